#![deny(missing_docs)]
#![deny(warnings)]
#![warn(clippy::all)]

//! Dispatcher validates inference requests against the contract of a loaded
//! model version and runs them on that version's executor.

pub mod builder;
pub mod config;
pub mod dispatcher;
mod error;
pub mod executor;
pub mod health;
pub(crate) mod model;
pub mod observability;
pub mod registry;
pub mod request;

pub use crate::builder::{Builder, Frontend, ModelInfo};
pub use crate::config::{DispatcherConfig, OverloadPolicy, VersionPolicy};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::Error;
pub use crate::executor::{ExecutionError, Executor, ExecutorRequest, ExecutorResponse, InitError};
pub use crate::health::Health;
pub use crate::registry::{ModelMetadata, ReadinessState, Registry, Unload};
pub use crate::request::{CancelToken, InferenceRequest, InferenceResponse};
