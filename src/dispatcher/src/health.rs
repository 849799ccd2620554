//! Liveness and readiness derived from Registry state.
use crate::{config::DispatcherConfig, registry::Registry};
use std::sync::atomic::{AtomicBool, Ordering};

/// Health reporter. Holds no model state of its own.
pub struct Health {
    registry: Registry,
    live: AtomicBool,
    require_all_models_ready: bool,
}

impl Health {
    /// Create a reporter; not live until [`Health::mark_live`].
    pub fn new(registry: Registry, config: &DispatcherConfig) -> Self {
        Health {
            registry,
            live: AtomicBool::new(false),
            require_all_models_ready: config.require_all_models_ready,
        }
    }

    /// Startup finished. Never cleared.
    pub fn mark_live(&self) {
        if !self.live.swap(true, Ordering::SeqCst) {
            log::info!("Server is live");
        }
    }

    /// Liveness
    pub fn live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Live, and either some model version is ready or, with
    /// `require_all_models_ready`, every registered model is.
    pub fn ready(&self) -> bool {
        self.live()
            && if self.require_all_models_ready {
                self.registry.all_ready()
            } else {
                self.registry.any_ready()
            }
    }

    /// A version of `name` is ready.
    pub fn model_ready(&self, name: &str) -> bool {
        self.registry.is_ready(name)
    }

    /// This version of `name` is ready.
    pub fn model_version_ready(&self, name: &str, version: u64) -> bool {
        self.registry.is_version_ready(name, version)
    }
}
