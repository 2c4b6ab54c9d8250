//! Repository facade
//!
//! The process-wide entry point: resolves units to ids, routes reads through
//! the layer stack top-down and sends writes to the writable top layer.
//!
//! Reads stop at the first layer that either has the record or removed it,
//! so a private writable layer can shadow a shared read-only one without
//! ever modifying it.

use crate::converter::UnitsConverter;
use crate::layering::{LayerBinding, LayeringSupport};
use crate::listener::{ListenerId, UnitEvent, UnitListeners};
use crate::registry::{UnitRegistry, UnitState};
use bytes::Bytes;
use modelrepo_common::{Error, RecordKey, RepositoryConfig, Result, UnitDescriptor, UnitId};
use modelrepo_storage::{
    CommitStats, DiskLayer, DiskLayerConfig, Key, LayerStatus, Persistent, RecordLookup,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of a repository
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepositoryState {
    Unstarted,
    Started,
    ShutDown,
}

/// Layered persistent object repository
pub struct Repository {
    state: RwLock<RepositoryState>,
    /// Serializes startup and shutdown
    lifecycle: Mutex<()>,
    registry: Arc<UnitRegistry>,
    layering: RwLock<Arc<LayeringSupport>>,
    listeners: UnitListeners,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RepositoryState::Unstarted),
            lifecycle: Mutex::new(()),
            registry: Arc::new(UnitRegistry::new()),
            layering: RwLock::new(Arc::new(LayeringSupport::new())),
            listeners: UnitListeners::new(),
        }
    }

    /// Start every configured layer, most specific first
    ///
    /// Only layer 0 may be written; all other layers are opened read-only.
    /// Failure to start layer 0 fails the whole startup, failure of any other
    /// layer is logged and the layer is left out of the stack.
    pub fn startup(&self, config: &RepositoryConfig) -> Result<Vec<LayerStatus>> {
        let _lifecycle = self.lifecycle.lock();
        if self.state() == RepositoryState::Started {
            return Err(Error::invalid_state("repository already started"));
        }
        config.validate()?;

        let disk_config = DiskLayerConfig::from(config);
        let mut layering = LayeringSupport::new();
        let mut statuses = Vec::new();

        for (position, layer_config) in config.layers.iter().enumerate() {
            let layer = Arc::new(DiskLayer::new(
                layer_config.descriptor(),
                disk_config.clone(),
            ));
            let read_only = layer_config.read_only || position > 0;
            match layer.startup(
                config.format_version,
                read_only,
                layer_config.create_if_missing,
            ) {
                Ok(status) => {
                    statuses.push(status);
                    layering.push(layer, &self.registry);
                }
                Err(e) if position == 0 => {
                    error!("Failed to start layer {}: {}", layer.descriptor(), e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Skipping layer {}: {}", layer.descriptor(), e);
                }
            }
        }

        *self.layering.write() = Arc::new(layering);
        *self.state.write() = RepositoryState::Started;
        info!(
            "Repository started with {} of {} layers",
            statuses.len(),
            config.layers.len()
        );
        Ok(statuses)
    }

    /// Commit all writable layers and close every unit
    pub fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.state() != RepositoryState::Started {
            return Ok(());
        }
        *self.state.write() = RepositoryState::ShutDown;

        let layering = std::mem::take(&mut *self.layering.write());
        let mut result = Ok(());
        for binding in layering.iter() {
            if let Err(e) = binding.layer().shutdown() {
                error!("Failed to shut down layer {}: {}", binding.layer().descriptor(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.registry.close_all();
        info!("Repository shut down");
        result
    }

    #[must_use]
    pub fn state(&self) -> RepositoryState {
        *self.state.read()
    }

    fn layering(&self) -> Result<Arc<LayeringSupport>> {
        match self.state() {
            RepositoryState::Started => Ok(self.layering.read().clone()),
            state => Err(Error::invalid_state(format!("repository is {state:?}"))),
        }
    }

    fn ensure_open(&self, unit: UnitId) -> Result<()> {
        match self.registry.state(unit) {
            Some(UnitState::Open) => Ok(()),
            Some(UnitState::Closed) => Err(Error::UnitClosed(unit)),
            None => Err(Error::not_found(format!("unit {unit}"))),
        }
    }

    fn writable_binding(layering: &LayeringSupport) -> Result<&LayerBinding> {
        layering.writable().ok_or_else(|| {
            let root = layering
                .get(0)
                .map(|binding| binding.layer().root().to_path_buf())
                .unwrap_or_default();
            Error::ReadOnly(root)
        })
    }

    /// Resolve a unit to its client id and open it
    ///
    /// Without `create`, a unit that no layer holds yields
    /// [`Error::NotFound`]. With `create`, the unit is also registered in the
    /// writable top layer.
    pub fn get_unit_id(&self, desc: &UnitDescriptor, create: bool) -> Result<UnitId> {
        let layering = self.layering()?;

        if !create
            && self.registry.find(desc).is_none()
            && !layering.iter().any(|b| b.layer().find_unit(desc).is_some())
        {
            return Err(Error::not_found(format!("unit {desc}")));
        }

        let (unit, allocated) = self.registry.get_or_allocate(desc);
        if allocated {
            debug!("Allocated unit {} for {}", unit, desc);
        }
        if create {
            if let Some(binding) = layering.writable() {
                binding.units().bind(unit)?;
            }
        }

        if self.registry.set_state(unit, UnitState::Open) != Some(UnitState::Open) {
            self.listeners.fire(&UnitEvent::Opened {
                unit,
                descriptor: desc.clone(),
            });
        }
        Ok(unit)
    }

    #[must_use]
    pub fn unit_descriptor(&self, unit: UnitId) -> Option<UnitDescriptor> {
        self.registry.descriptor(unit)
    }

    /// Walk the layers top-down and hand the first stored payload to `decode`
    ///
    /// A record that fails to read or decode in one layer is counted and
    /// reported, and the walk continues below it.
    fn walk<T>(
        &self,
        key: &Key,
        decode: impl Fn(&LayerBinding, Bytes) -> Result<T>,
    ) -> Result<Option<T>> {
        let layering = self.layering()?;
        self.ensure_open(key.unit())?;

        for binding in layering.iter() {
            let Some(local) = binding.units().client_to_layer(key.unit()) else {
                continue;
            };
            let found = match binding.layer().lookup(RecordKey::new(local, key.index())) {
                Ok(found) => found,
                Err(e) if e.is_corruption() => {
                    self.report_corruption(key, binding.position(), &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match found {
                RecordLookup::Found(data) => match decode(binding, data) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) if e.is_corruption() => {
                        self.report_corruption(key, binding.position(), &e);
                    }
                    Err(e) => return Err(e),
                },
                RecordLookup::Removed => return Ok(None),
                RecordLookup::Absent => {}
            }
        }
        Ok(None)
    }

    fn report_corruption(&self, key: &Key, layer: usize, err: &Error) {
        let count = self.registry.record_error(key.unit());
        warn!(
            "Corrupt record {} in layer {} ({} errors in unit): {}",
            key, layer, count, err
        );
        self.listeners.fire(&UnitEvent::RecordCorrupted {
            key: key.record(),
            layer,
            reason: err.to_string(),
        });
    }

    /// Committed payload of `key` from the most specific layer that has it
    pub fn read(&self, key: &Key) -> Result<Option<Bytes>> {
        self.walk(key, |_, data| Ok(data))
    }

    /// Decoded object of `key` from the most specific layer that has it
    pub fn get(&self, key: &Key) -> Result<Option<Arc<dyn Persistent>>> {
        self.walk(key, |binding, data| key.decode(data, Some(binding.translator(false))))
    }

    /// Buffer a payload for `key` in the writable top layer
    pub fn write(&self, key: &Key, data: Bytes) -> Result<()> {
        let layering = self.layering()?;
        self.ensure_open(key.unit())?;
        let binding = Self::writable_binding(&layering)?;
        let local = binding.units().bind(key.unit())?;
        binding
            .layer()
            .write(RecordKey::new(local, key.index()), data, key.behavior())
    }

    /// Serialize `obj` with the key's factory and buffer it
    pub fn put(&self, key: &Key, obj: &dyn Persistent) -> Result<()> {
        let layering = self.layering()?;
        self.ensure_open(key.unit())?;
        let binding = Self::writable_binding(&layering)?;
        let data = key.encode(obj, Some(binding.translator(true)))?;
        let local = binding.units().bind(key.unit())?;
        binding
            .layer()
            .write(RecordKey::new(local, key.index()), data, key.behavior())
    }

    /// Buffer the removal of `key`; lower layers are masked once committed
    pub fn remove(&self, key: &Key) -> Result<()> {
        let layering = self.layering()?;
        self.ensure_open(key.unit())?;
        let binding = Self::writable_binding(&layering)?;
        let local = binding.units().bind(key.unit())?;
        binding.layer().remove(RecordKey::new(local, key.index()))
    }

    /// Make the buffered writes of a unit durable and visible
    pub fn commit(&self, unit: UnitId) -> Result<CommitStats> {
        let layering = self.layering()?;
        let binding = Self::writable_binding(&layering)?;
        match binding.units().client_to_layer(unit) {
            Some(local) => binding.layer().commit(local),
            None => Ok(CommitStats::default()),
        }
    }

    /// Close a unit in every layer
    ///
    /// Keys of the unit become unusable until it is opened again with
    /// [`Self::get_unit_id`]. `exclude` keys are never persisted by this
    /// close. `expunge` deletes the unit from the writable layer only;
    /// shared layers are never modified. A failure in one layer does not stop
    /// the others from being closed.
    pub fn close_unit(
        &self,
        unit: UnitId,
        write_back: bool,
        exclude: &[Key],
        expunge: bool,
    ) -> Result<()> {
        let layering = self.layering()?;
        if self.registry.set_state(unit, UnitState::Closed).is_none() {
            return Err(Error::not_found(format!("unit {unit}")));
        }

        let excluded: Vec<u32> = exclude
            .iter()
            .filter(|key| key.unit() == unit)
            .map(Key::index)
            .collect();

        let mut result = Ok(());
        for binding in layering.iter() {
            let Some(local) = binding.units().client_to_layer(unit) else {
                continue;
            };
            let expunge_here = expunge && binding.is_writable();
            if let Err(e) = binding
                .layer()
                .close_unit(local, write_back, &excluded, expunge_here)
            {
                error!(
                    "Failed to close unit {} in layer {}: {}",
                    unit,
                    binding.position(),
                    e
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
            if expunge_here {
                binding.units().forget(unit);
            }
        }

        self.listeners.fire(&UnitEvent::Closed {
            unit,
            expunged: expunge,
        });
        result
    }

    /// Corrupt records seen for a unit
    #[must_use]
    pub fn error_count(&self, unit: UnitId) -> u64 {
        self.registry.error_count(unit)
    }

    #[must_use]
    pub fn unit_state(&self, unit: UnitId) -> Option<UnitState> {
        self.registry.state(unit)
    }

    pub fn subscribe(&self, listener: impl Fn(&UnitEvent) + Send + Sync + 'static) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Number of started layers
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layering.read().len()
    }

    #[must_use]
    pub fn layer(&self, position: usize) -> Option<Arc<DiskLayer>> {
        self.layering
            .read()
            .get(position)
            .map(|binding| binding.layer().clone())
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to shut down repository: {}", e);
        }
    }
}
