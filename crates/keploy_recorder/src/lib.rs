#![forbid(unsafe_code)]

pub mod capture;
pub mod cleaner;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixtures;
pub mod prereq;
pub mod readiness;
pub mod runmeta;
pub mod sanitize;
pub mod summary;
pub mod traffic;
pub mod util;
pub mod workaround;
pub mod workflow;

pub use cli::run_from_env;
pub use error::{RecorderError, Result};
