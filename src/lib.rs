//! cubehost: game-server container lifecycle and in-container file management.
//!
//! Lifecycle jobs are queued through [`worker::Dispatcher`] and executed by
//! [`tasks::Lifecycle`] against a [`runtime::ContainerRuntime`]. File access goes
//! through [`files::FileManager`].

pub mod config;
pub mod error;
pub mod files;
pub mod ports;
pub mod runtime;
pub mod store;
pub mod tasks;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
