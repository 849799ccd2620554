//! Builder for the serving core, caller should provide models and their executors
use crate::{
    config::{DispatcherConfig, OverloadPolicy, VersionPolicy},
    dispatcher::Dispatcher,
    executor::Executor,
    health::Health,
    registry::Registry,
};
use kalypso_contract::ModelContract;
use std::{sync::Arc, time::Duration};

/// Builder for the serving core
#[derive(Default)]
pub struct Builder {
    config: DispatcherConfig,
    model_infos: Vec<ModelInfo>,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.config.$name = $name;
            self
        }
    };
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(
        max_concurrent_requests_per_version,
        Option<usize>,
        "Concurrent executor calls per model version, None or 0 for unlimited"
    );
    config!(overload_policy, OverloadPolicy, "Behavior at the concurrency limit");
    config!(queue_timeout, Option<Duration>, "Longest wait under the queue policy");
    config!(
        require_all_models_ready,
        bool,
        "Server readiness requires every model to be ready"
    );
    config!(
        default_model_version,
        VersionPolicy,
        "Version used when a request names none"
    );

    /// Replace the whole configuration.
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// model register
    pub fn register_model(mut self, info: ModelInfo) -> Self {
        self.model_infos.push(info);
        self
    }

    /// Build the core. Models that fail to load stay in the registry as
    /// `Failed` and are logged; they do not stop the build.
    pub fn build(self) -> Frontend {
        let registry = Registry::new(&self.config);
        for info in self.model_infos {
            let name = info.contract.model_name().to_string();
            let version = info.contract.version();
            let executor = (info.model_builder)(&info.contract);
            match registry.register(info.contract, executor) {
                Ok(()) => log::info!("Model {} version {} Registered", name, version),
                Err(err) => log::error!("Model {} version {} not registered: {}", name, version, err),
            }
        }
        Frontend {
            dispatcher: Arc::new(Dispatcher::new(registry.clone(), &self.config)),
            health: Arc::new(Health::new(registry.clone(), &self.config)),
            registry,
        }
    }
}

type BuildExecutorFn = dyn FnOnce(&ModelContract) -> Box<dyn Executor>;

/// register model info
pub struct ModelInfo {
    contract: ModelContract,
    model_builder: Box<BuildExecutorFn>,
}

impl ModelInfo {
    /// create ModelInfo
    pub fn new<F>(contract: ModelContract, model_builder: F) -> Self
    where
        F: 'static + FnOnce(&ModelContract) -> Box<dyn Executor>,
    {
        let model_builder = Box::new(model_builder);
        ModelInfo {
            contract,
            model_builder,
        }
    }

    /// Contract of the model to register.
    pub fn contract(&self) -> &ModelContract {
        &self.contract
    }
}

/// The wired-up core handed to protocol front ends.
#[derive(Clone)]
pub struct Frontend {
    /// Shared registry
    pub registry: Registry,
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Health reporter
    pub health: Arc<Health>,
}
