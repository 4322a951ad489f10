//! council-exec library crate
//!
//! Executes council-approved work orders against a GitHub repository: checks
//! out a workspace, commits the change manifest, runs the declared build and
//! test procedures, opens a pull request and keeps a redacted audit log of
//! every step. The CLI in `main.rs` is a thin shell over
//! [`ExecutionController`].

pub mod cancel;
pub mod checks;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod evidence;
pub mod github;
pub mod model;
pub mod publisher;
pub mod redact;
pub mod store;
pub mod transport;
pub mod util;
pub mod workspace;

pub use controller::{ControllerSettings, ExecutionController, RunHandle, Stores};
pub use error::{ErrorKind, ExecutionError};
pub use model::{ExecutionRequest, ExecutionResult, RunStatus};
