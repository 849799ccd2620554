//! Model Registry: loaded versions, their contracts and readiness.

use crate::{
    config::{DispatcherConfig, VersionPolicy},
    executor::Executor,
    model::Model,
    Error,
};
use crossbeam::channel;
use kalypso_contract::ModelContract;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Lifecycle of a model version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadinessState {
    /// Executor is initializing.
    Loading,
    /// Serving
    Ready,
    /// No new requests; waiting for in-flight ones to drain.
    Unloading,
    /// Executor initialization failed.
    Failed,
}

impl ReadinessState {
    /// Lower-case name used in logs and the repository index.
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessState::Loading => "loading",
            ReadinessState::Ready => "ready",
            ReadinessState::Unloading => "unloading",
            ReadinessState::Failed => "failed",
        }
    }
}

struct Slot {
    state: ReadinessState,
    contract: Arc<ModelContract>,
    model: Option<Arc<Model>>,
    released: Option<channel::Receiver<()>>,
}

type Versions = BTreeMap<u64, Slot>;

pub(crate) struct Inner {
    models: RwLock<HashMap<String, Versions>>,
    default_version: VersionPolicy,
    max_concurrency: Option<usize>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Versions>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Versions>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called once the last handle of an unloading version is gone.
    pub(crate) fn remove_unloaded(&self, name: &str, version: u64) {
        let mut models = self.write();
        let now_empty = match models.get_mut(name) {
            Some(versions) => {
                let unloading = versions
                    .get(&version)
                    .map_or(false, |slot| slot.state == ReadinessState::Unloading);
                if unloading {
                    versions.remove(&version);
                    log::info!("Model {} version {} removed", name, version);
                }
                versions.is_empty()
            }
            None => false,
        };
        if now_empty {
            models.remove(name);
        }
    }
}

/// A lookup result. Keeps the version's executor alive while held.
#[derive(Clone)]
pub struct ExecutorHandle(Arc<Model>);

impl ExecutorHandle {
    /// Contract of the version this handle refers to.
    pub fn contract(&self) -> &ModelContract {
        self.0.contract()
    }

    pub(crate) fn model(&self) -> &Model {
        &self.0
    }
}

/// Ticket returned by [`Registry::unload`].
pub struct Unload {
    model: String,
    version: u64,
    released: channel::Receiver<()>,
}

impl Unload {
    fn already_released(model: &str, version: u64) -> Self {
        let (tx, released) = channel::bounded(1);
        let _ = tx.send(());
        Unload {
            model: model.to_string(),
            version,
            released,
        }
    }

    /// Model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Block until in-flight requests have drained and the executor is finalized.
    pub fn wait(self) {
        // a disconnected channel also means the executor is gone
        let _ = self.released.recv();
    }

    /// Like `wait` with an upper bound. Returns true if released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.released.recv_timeout(timeout),
            Err(channel::RecvTimeoutError::Timeout)
        )
    }

    /// Has the executor been released.
    pub fn is_released(&self) -> bool {
        !matches!(self.released.try_recv(), Err(channel::TryRecvError::Empty))
    }
}

/// Description of a model for metadata queries.
#[derive(Clone, Debug)]
pub struct ModelMetadata {
    /// Model name
    pub name: String,
    /// Every known version with its state, ascending.
    pub versions: Vec<(u64, ReadinessState)>,
    /// Contract of the version a request without version would use
    /// (or the highest version when none is ready).
    pub contract: Arc<ModelContract>,
}

/// Registry owns every loaded model version. Cloning is cheap and all
/// clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(&DispatcherConfig::default())
    }
}

impl Registry {
    /// Create an empty Registry.
    pub fn new(config: &DispatcherConfig) -> Self {
        Registry {
            inner: Arc::new(Inner {
                models: RwLock::new(HashMap::new()),
                default_version: config.default_model_version,
                max_concurrency: config.max_concurrent_requests_per_version,
            }),
        }
    }

    /// Add a version in `Loading`, initialize its executor, then move it to
    /// `Ready`, or to `Failed` if initialization fails. A `Failed` version
    /// may be registered again.
    pub fn register(
        &self,
        contract: ModelContract,
        mut executor: Box<dyn Executor>,
    ) -> Result<(), Error> {
        let contract = Arc::new(contract);
        let name = contract.model_name().to_string();
        let version = contract.version();
        {
            let mut models = self.inner.write();
            let versions = models.entry(name.clone()).or_insert_with(BTreeMap::new);
            if let Some(slot) = versions.get(&version) {
                if slot.state != ReadinessState::Failed {
                    return Err(Error::AlreadyExists {
                        model: name,
                        version,
                    });
                }
            }
            versions.insert(
                version,
                Slot {
                    state: ReadinessState::Loading,
                    contract: contract.clone(),
                    model: None,
                    released: None,
                },
            );
        }
        log::info!("Model {} version {} loading", name, version);

        // initialize without holding the lock, other models stay available
        let result = executor.initialize(&contract);

        let mut models = self.inner.write();
        let slot = models
            .get_mut(&name)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| Error::Internal(format!("model '{}' vanished while loading", name)))?;
        match result {
            Ok(()) => {
                let (tx, rx) = channel::bounded(1);
                let model = Model::new(
                    contract.clone(),
                    executor,
                    self.inner.max_concurrency,
                    Arc::downgrade(&self.inner),
                    tx,
                );
                slot.state = ReadinessState::Ready;
                slot.model = Some(Arc::new(model));
                slot.released = Some(rx);
                log::info!("Model {} version {} ready", name, version);
                Ok(())
            }
            Err(err) => {
                slot.state = ReadinessState::Failed;
                log::error!("Model {} version {} failed: {}", name, version, err);
                Err(Error::Internal(err.to_string()))
            }
        }
    }

    /// Stop serving a version. New lookups fail at once; the executor is
    /// finalized after the last in-flight request holding it completes.
    pub fn unload(&self, name: &str, version: u64) -> Result<Unload, Error> {
        let (model, released) = {
            let mut models = self.inner.write();
            let versions = models
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            let state = versions
                .get(&version)
                .map(|slot| slot.state)
                .ok_or_else(|| Error::VersionNotFound {
                    model: name.to_string(),
                    version,
                })?;
            match state {
                ReadinessState::Ready => {}
                ReadinessState::Failed => {
                    versions.remove(&version);
                    if versions.is_empty() {
                        models.remove(name);
                    }
                    log::info!("Model {} version {} removed", name, version);
                    return Ok(Unload::already_released(name, version));
                }
                ReadinessState::Loading | ReadinessState::Unloading => {
                    return Err(Error::NotReady {
                        model: name.to_string(),
                        version,
                    })
                }
            }
            let slot = versions.get_mut(&version).ok_or_else(|| Error::VersionNotFound {
                model: name.to_string(),
                version,
            })?;
            slot.state = ReadinessState::Unloading;
            (slot.model.take(), slot.released.take())
        };
        log::info!("Model {} version {} unloading", name, version);
        let released = match released {
            Some(released) => released,
            None => return Ok(Unload::already_released(name, version)),
        };
        // dropped outside the lock: if idle, this finalizes right here
        drop(model);
        Ok(Unload {
            model: name.to_string(),
            version,
            released,
        })
    }

    /// Unload every ready or failed version of a model.
    pub fn unload_model(&self, name: &str) -> Result<Vec<Unload>, Error> {
        let versions: Vec<u64> = {
            let models = self.inner.read();
            let versions = models
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            versions
                .iter()
                .filter(|(_, slot)| {
                    slot.state == ReadinessState::Ready || slot.state == ReadinessState::Failed
                })
                .map(|(&version, _)| version)
                .collect()
        };
        let mut tickets = vec![];
        for version in versions {
            match self.unload(name, version) {
                Ok(ticket) => tickets.push(ticket),
                // raced with another unload
                Err(Error::NotFound(_)) | Err(Error::VersionNotFound { .. }) => {}
                Err(Error::NotReady { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(tickets)
    }

    /// Contract and executor of a ready version. `version = None` follows
    /// the configured default version policy.
    pub fn lookup(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> Result<(Arc<ModelContract>, ExecutorHandle), Error> {
        let models = self.inner.read();
        let versions = models
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let version = match version {
            Some(version) => version,
            None => self
                .default_version(versions)
                .ok_or_else(|| Error::NotFound(name.to_string()))?,
        };
        let slot = versions
            .get(&version)
            .ok_or_else(|| Error::VersionNotFound {
                model: name.to_string(),
                version,
            })?;
        match (slot.state, &slot.model) {
            (ReadinessState::Ready, Some(model)) => {
                Ok((slot.contract.clone(), ExecutorHandle(model.clone())))
            }
            _ => Err(Error::NotReady {
                model: name.to_string(),
                version,
            }),
        }
    }

    fn default_version(&self, versions: &Versions) -> Option<u64> {
        match self.inner.default_version {
            VersionPolicy::Pinned(version) => Some(version),
            VersionPolicy::Latest => versions
                .iter()
                .rev()
                .find(|(_, slot)| slot.state == ReadinessState::Ready)
                .or_else(|| versions.iter().next_back())
                .map(|(&version, _)| version),
        }
    }

    /// True iff at least one version of the model is ready.
    pub fn is_ready(&self, name: &str) -> bool {
        self.inner.read().get(name).map_or(false, |versions| {
            versions
                .values()
                .any(|slot| slot.state == ReadinessState::Ready)
        })
    }

    /// True iff this exact version is ready.
    pub fn is_version_ready(&self, name: &str, version: u64) -> bool {
        self.state(name, version) == Some(ReadinessState::Ready)
    }

    /// State of one version.
    pub fn state(&self, name: &str, version: u64) -> Option<ReadinessState> {
        self.inner
            .read()
            .get(name)
            .and_then(|versions| versions.get(&version))
            .map(|slot| slot.state)
    }

    /// Any version of any model ready.
    pub fn any_ready(&self) -> bool {
        self.inner.read().values().any(|versions| {
            versions
                .values()
                .any(|slot| slot.state == ReadinessState::Ready)
        })
    }

    /// Every registered model has a ready version. False for an empty registry.
    pub fn all_ready(&self) -> bool {
        let models = self.inner.read();
        !models.is_empty()
            && models.values().all(|versions| {
                versions
                    .values()
                    .any(|slot| slot.state == ReadinessState::Ready)
            })
    }

    /// All versions of all models, sorted by name then version.
    pub fn index(&self) -> Vec<(String, u64, ReadinessState)> {
        let models = self.inner.read();
        let mut index: Vec<_> = models
            .iter()
            .flat_map(|(name, versions)| {
                versions
                    .iter()
                    .map(move |(&version, slot)| (name.clone(), version, slot.state))
            })
            .collect();
        index.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        index
    }

    /// Name, versions and default contract of a model.
    pub fn metadata(&self, name: &str) -> Result<ModelMetadata, Error> {
        let models = self.inner.read();
        let versions = models
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let contract = self
            .default_version(versions)
            .and_then(|version| versions.get(&version))
            .or_else(|| versions.values().next_back())
            .map(|slot| slot.contract.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(ModelMetadata {
            name: name.to_string(),
            versions: versions
                .iter()
                .map(|(&version, slot)| (version, slot.state))
                .collect(),
            contract,
        })
    }

    /// Contract of one version, whatever its state.
    pub fn contract(&self, name: &str, version: u64) -> Result<Arc<ModelContract>, Error> {
        let models = self.inner.read();
        let versions = models
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        versions
            .get(&version)
            .map(|slot| slot.contract.clone())
            .ok_or_else(|| Error::VersionNotFound {
                model: name.to_string(),
                version,
            })
    }
}
