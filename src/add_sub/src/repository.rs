//! Model repository: which models to serve, their contracts and backends.
//!
//! Field names follow Triton's `config.pbtxt` so an existing model
//! configuration translates one to one:
//!
//! ```json
//! {"models": [{"name": "add_sub", "version": 1, "backend": "add_sub",
//!   "max_batch_size": 0,
//!   "input":  [{"name": "INPUT0", "data_type": "TYPE_FP32", "dims": [-1, 4]}],
//!   "output": [{"name": "OUTPUT0", "data_type": "TYPE_FP32", "dims": [-1, 4]}]}]}
//! ```
//!
//! With `max_batch_size > 0` the batch dimension is implicit, as in Triton:
//! a leading wildcard is prepended to every declared `dims`.
use crate::{AddSub, Identity};
use dispatcher::{Executor, ModelInfo};
use kalypso_contract::{ContractError, DataType, ModelContract, ShapePattern, TensorSpec};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, str::FromStr};

/// Errors loading a model repository
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// file could not be read
    #[error("cannot read model repository: {0}")]
    Io(#[from] std::io::Error),
    /// malformed JSON
    #[error("cannot parse model repository: {0}")]
    Parse(#[from] serde_json::Error),
    /// a model declares an invalid contract
    #[error("model '{model}': {source}")]
    Contract {
        /// model name
        model: String,
        /// cause
        source: ContractError,
    },
}

/// Executor implementation behind a model.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// [`AddSub`]
    AddSub,
    /// [`Identity`]
    Identity,
}

impl Backend {
    /// Fresh, uninitialized executor.
    pub fn executor(self) -> Box<dyn Executor> {
        match self {
            Backend::AddSub => Box::new(AddSub::new()),
            Backend::Identity => Box::new(Identity::new()),
        }
    }
}

/// One declared input or output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TensorConfig {
    /// tensor name
    pub name: String,
    /// `TYPE_FP32` or `FP32`
    pub data_type: String,
    /// -1 for a wildcard dimension
    pub dims: Vec<i64>,
}

impl TensorConfig {
    fn to_spec(&self, batched: bool) -> Result<TensorSpec, ContractError> {
        let datatype = DataType::from_str(&self.data_type)?;
        let mut shape = ShapePattern::from_dims(&self.dims)?;
        if batched {
            shape = shape.batched();
        }
        Ok(TensorSpec::new(self.name.clone(), datatype, shape))
    }
}

fn default_version() -> u64 {
    1
}

/// One model version.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelConfig {
    /// model name
    pub name: String,
    /// version, 1 when omitted
    #[serde(default = "default_version")]
    pub version: u64,
    /// executor implementation
    pub backend: Backend,
    /// 0 disables batching
    #[serde(default)]
    pub max_batch_size: u32,
    /// inputs
    #[serde(default)]
    pub input: Vec<TensorConfig>,
    /// outputs
    #[serde(default)]
    pub output: Vec<TensorConfig>,
}

impl ModelConfig {
    /// Contract this configuration declares.
    pub fn to_contract(&self) -> Result<ModelContract, RepositoryError> {
        let batched = self.max_batch_size > 0;
        let specs = |tensors: &[TensorConfig]| {
            tensors
                .iter()
                .map(|t| t.to_spec(batched))
                .collect::<Result<Vec<_>, _>>()
        };
        let contract = specs(&self.input)
            .and_then(|inputs| Ok((inputs, specs(&self.output)?)))
            .and_then(|(inputs, outputs)| {
                ModelContract::new(self.name.clone(), self.version, inputs, outputs)
            })
            .map_err(|source| RepositoryError::Contract {
                model: self.name.clone(),
                source,
            })?;
        Ok(contract.with_max_batch_size(self.max_batch_size))
    }

    /// Registration info for [`dispatcher::Builder::register_model`].
    pub fn model_info(&self) -> Result<ModelInfo, RepositoryError> {
        let backend = self.backend;
        Ok(ModelInfo::new(self.to_contract()?, move |_| {
            backend.executor()
        }))
    }
}

/// All models the server loads at startup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelRepository {
    /// models
    pub models: Vec<ModelConfig>,
}

impl Default for ModelRepository {
    /// The `add_sub` demo: two `[-1,4]` FP32 inputs, two FP32 outputs.
    fn default() -> Self {
        let fp32 = |name: &str| TensorConfig {
            name: name.to_string(),
            data_type: "TYPE_FP32".to_string(),
            dims: vec![-1, 4],
        };
        ModelRepository {
            models: vec![ModelConfig {
                name: "add_sub".to_string(),
                version: 1,
                backend: Backend::AddSub,
                max_batch_size: 0,
                input: vec![fp32("INPUT0"), fp32("INPUT1")],
                output: vec![fp32("OUTPUT0"), fp32("OUTPUT1")],
            }],
        }
    }
}

impl FromStr for ModelRepository {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

impl ModelRepository {
    /// Load a JSON repository file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// Registration info for every model, failing on the first bad contract.
    pub fn model_infos(&self) -> Result<Vec<ModelInfo>, RepositoryError> {
        self.models.iter().map(ModelConfig::model_info).collect()
    }
}
