pub mod config;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub use domain::controller::WorkflowController;
pub use domain::engine::workflow_engine::WorkflowEngine;
pub use error::{Error, ErrorKind, Result};
