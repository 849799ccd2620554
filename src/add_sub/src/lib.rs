//! Demo model backends for Kalypso and the model repository that selects them
#![deny(missing_docs)]
#![deny(warnings)]
#![warn(clippy::all)]

mod add_sub;
mod identity;
mod repository;

pub use crate::add_sub::AddSub;
pub use crate::identity::Identity;
pub use crate::repository::{Backend, ModelConfig, ModelRepository, RepositoryError, TensorConfig};
