//! Id converters between client and layer numbering
//!
//! Each layer numbers its units and filesystems on its own, so the same unit
//! usually carries a different id in every layer. Converters translate in
//! both directions. Converting an id the layer does not own yields `None`
//! so that callers can fall through to the next layer.

use crate::registry::UnitRegistry;
use modelrepo_common::{Error, FsId, Result, UnitId};
use modelrepo_storage::DiskLayer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Translates unit ids between client and layer numbering
pub trait UnitsConverter: Send + Sync {
    fn client_to_layer(&self, id: UnitId) -> Option<UnitId>;
    fn layer_to_client(&self, id: UnitId) -> Option<UnitId>;
}

/// Translates filesystem ids between client and layer numbering
pub trait FsConverter: Send + Sync {
    fn client_to_layer(&self, id: FsId) -> Option<FsId>;
    fn layer_to_client(&self, id: FsId) -> Option<FsId>;
}

/// Converter for layers that share the client numbering
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityConverter;

impl UnitsConverter for IdentityConverter {
    fn client_to_layer(&self, id: UnitId) -> Option<UnitId> {
        Some(id)
    }

    fn layer_to_client(&self, id: UnitId) -> Option<UnitId> {
        Some(id)
    }
}

impl FsConverter for IdentityConverter {
    fn client_to_layer(&self, id: FsId) -> Option<FsId> {
        Some(id)
    }

    fn layer_to_client(&self, id: FsId) -> Option<FsId> {
        Some(id)
    }
}

/// Cached translations in both directions
struct BiTable<T> {
    to_layer: HashMap<T, T>,
    to_client: HashMap<T, T>,
}

impl<T> Default for BiTable<T> {
    fn default() -> Self {
        Self {
            to_layer: HashMap::new(),
            to_client: HashMap::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> BiTable<T> {
    fn insert(&mut self, client: T, layer: T) {
        self.to_layer.insert(client, layer);
        self.to_client.insert(layer, client);
    }

    fn remove_client(&mut self, client: T) -> Option<T> {
        let layer = self.to_layer.remove(&client)?;
        self.to_client.remove(&layer);
        Some(layer)
    }
}

/// Unit converter backed by the registry and a layer manifest
///
/// Translations are resolved through unit descriptors on first use and
/// cached afterwards.
pub struct LayerUnitsConverter {
    registry: Arc<UnitRegistry>,
    layer: Arc<DiskLayer>,
    table: RwLock<BiTable<UnitId>>,
}

impl LayerUnitsConverter {
    pub fn new(registry: Arc<UnitRegistry>, layer: Arc<DiskLayer>) -> Self {
        Self {
            registry,
            layer,
            table: RwLock::new(BiTable::default()),
        }
    }

    /// Layer id of a client unit, allocating one in a writable layer
    pub fn bind(&self, client: UnitId) -> Result<UnitId> {
        if let Some(id) = self.client_to_layer(client) {
            return Ok(id);
        }
        let desc = self
            .registry
            .descriptor(client)
            .ok_or_else(|| Error::not_found(format!("unit {client}")))?;
        let id = self.layer.register_unit(&desc)?;
        self.table.write().insert(client, id);
        debug!(
            "Bound unit {} ({}) to layer id {} in {}",
            client,
            desc,
            id,
            self.layer.descriptor()
        );
        Ok(id)
    }

    /// Drop a cached translation, e.g. after the unit was expunged
    pub fn forget(&self, client: UnitId) -> Option<UnitId> {
        self.table.write().remove_client(client)
    }
}

impl UnitsConverter for LayerUnitsConverter {
    fn client_to_layer(&self, id: UnitId) -> Option<UnitId> {
        if let Some(layer) = self.table.read().to_layer.get(&id) {
            return Some(*layer);
        }
        let desc = self.registry.descriptor(id)?;
        let layer = self.layer.find_unit(&desc)?;
        self.table.write().insert(id, layer);
        Some(layer)
    }

    fn layer_to_client(&self, id: UnitId) -> Option<UnitId> {
        if let Some(client) = self.table.read().to_client.get(&id) {
            return Some(*client);
        }
        // Units a layer owns always have a client id, even if nobody opened them yet
        let desc = self.layer.unit_descriptor(id)?;
        let (client, _) = self.registry.get_or_allocate(&desc);
        self.table.write().insert(client, id);
        Some(client)
    }
}

/// Filesystem converter backed by the registry and a layer manifest
pub struct LayerFsConverter {
    registry: Arc<UnitRegistry>,
    layer: Arc<DiskLayer>,
    table: RwLock<BiTable<FsId>>,
}

impl LayerFsConverter {
    pub fn new(registry: Arc<UnitRegistry>, layer: Arc<DiskLayer>) -> Self {
        Self {
            registry,
            layer,
            table: RwLock::new(BiTable::default()),
        }
    }

    /// Layer id of a client filesystem, allocating one in a writable layer
    pub fn bind(&self, client: FsId) -> Result<FsId> {
        if let Some(id) = self.client_to_layer(client) {
            return Ok(id);
        }
        let fs = self
            .registry
            .filesystem(client)
            .ok_or_else(|| Error::not_found(format!("filesystem {client}")))?;
        let id = self.layer.register_filesystem(&fs)?;
        self.table.write().insert(client, id);
        Ok(id)
    }
}

impl FsConverter for LayerFsConverter {
    fn client_to_layer(&self, id: FsId) -> Option<FsId> {
        if let Some(layer) = self.table.read().to_layer.get(&id) {
            return Some(*layer);
        }
        let fs = self.registry.filesystem(id)?;
        let layer = self.layer.manifest().find_fs(&fs)?;
        self.table.write().insert(id, layer);
        Some(layer)
    }

    fn layer_to_client(&self, id: FsId) -> Option<FsId> {
        if let Some(client) = self.table.read().to_client.get(&id) {
            return Some(*client);
        }
        let fs = self.layer.manifest().filesystem(id)?;
        let client = self.registry.fs_id(&fs);
        self.table.write().insert(client, id);
        Some(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrepo_common::{FilesystemId, LayerDescriptor, UnitDescriptor};
    use modelrepo_storage::DiskLayerConfig;
    use tempfile::tempdir;

    fn layer(root: &std::path::Path, read_only: bool) -> Arc<DiskLayer> {
        let layer = DiskLayer::new(LayerDescriptor::new(root), DiskLayerConfig::default());
        layer.startup(1, read_only, !read_only).unwrap();
        Arc::new(layer)
    }

    #[test]
    fn test_identity() {
        let id = UnitId::new(42);
        assert_eq!(UnitsConverter::client_to_layer(&IdentityConverter, id), Some(id));
        assert_eq!(UnitsConverter::layer_to_client(&IdentityConverter, id), Some(id));
        let fs = FsId::new(3);
        assert_eq!(FsConverter::client_to_layer(&IdentityConverter, fs), Some(fs));
    }

    #[test]
    fn test_unit_translation_is_invertible() {
        let dir = tempdir().unwrap();
        let layer = layer(dir.path(), false);

        // The layer was populated by another process in another order
        let b_layer = layer.register_unit(&UnitDescriptor::local("b.c")).unwrap();
        let a_layer = layer.register_unit(&UnitDescriptor::local("a.c")).unwrap();

        let registry = Arc::new(UnitRegistry::new());
        let (a, _) = registry.get_or_allocate(&UnitDescriptor::local("a.c"));
        let (c, _) = registry.get_or_allocate(&UnitDescriptor::local("c.c"));

        let converter = LayerUnitsConverter::new(registry.clone(), layer.clone());
        assert_eq!(converter.client_to_layer(a), Some(a_layer));
        assert_eq!(converter.layer_to_client(a_layer), Some(a));

        // Not owned by the layer
        assert_eq!(converter.client_to_layer(c), None);
        assert_eq!(converter.layer_to_client(UnitId::new(77)), None);

        // Owned by the layer but unknown to the client yet
        let b = converter.layer_to_client(b_layer).unwrap();
        assert_eq!(registry.descriptor(b), Some(UnitDescriptor::local("b.c")));
        assert_eq!(converter.client_to_layer(b), Some(b_layer));

        let c_layer = converter.bind(c).unwrap();
        assert_eq!(converter.client_to_layer(c), Some(c_layer));
        assert_eq!(layer.find_unit(&UnitDescriptor::local("c.c")), Some(c_layer));

        assert_eq!(converter.forget(c), Some(c_layer));
        assert_eq!(converter.forget(c), None);
    }

    #[test]
    fn test_bind_fails_on_read_only_layer() {
        let dir = tempdir().unwrap();
        layer(dir.path(), false).shutdown().unwrap();
        let shared = layer(dir.path(), true);

        let registry = Arc::new(UnitRegistry::new());
        let (a, _) = registry.get_or_allocate(&UnitDescriptor::local("a.c"));
        let converter = LayerUnitsConverter::new(registry, shared);
        assert!(converter.bind(a).is_err());
        assert_eq!(converter.client_to_layer(a), None);
    }

    #[test]
    fn test_fs_translation() {
        let dir = tempdir().unwrap();
        let layer = layer(dir.path(), false);
        let remote = FilesystemId::new("ssh://build");
        let remote_layer = layer.register_filesystem(&remote).unwrap();

        let registry = Arc::new(UnitRegistry::new());
        registry.fs_id(&FilesystemId::local());
        let converter = LayerFsConverter::new(registry.clone(), layer);

        let remote_client = converter.layer_to_client(remote_layer).unwrap();
        assert_eq!(registry.filesystem(remote_client), Some(remote));
        assert_eq!(converter.client_to_layer(remote_client), Some(remote_layer));

        let local = registry.find_fs(&FilesystemId::local()).unwrap();
        assert_eq!(converter.client_to_layer(local), None);
        let local_layer = converter.bind(local).unwrap();
        assert_ne!(local_layer, remote_layer);
        assert_eq!(converter.layer_to_client(local_layer), Some(local));
    }
}
