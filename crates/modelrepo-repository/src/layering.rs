//! Layer stack
//!
//! Layers are ordered from most specific (position 0, the only one that is
//! ever written) to most generic. Every layer carries its own converter pair.

use crate::converter::{FsConverter, LayerFsConverter, LayerUnitsConverter, UnitsConverter};
use crate::registry::UnitRegistry;
use modelrepo_common::{FsId, UnitId};
use modelrepo_storage::{DiskLayer, IdTranslator};
use std::sync::Arc;

/// One started layer plus its converters
pub struct LayerBinding {
    layer: Arc<DiskLayer>,
    units: Arc<LayerUnitsConverter>,
    fs: Arc<LayerFsConverter>,
    position: usize,
}

impl LayerBinding {
    #[must_use]
    pub fn layer(&self) -> &Arc<DiskLayer> {
        &self.layer
    }

    #[must_use]
    pub fn units(&self) -> &LayerUnitsConverter {
        &self.units
    }

    #[must_use]
    pub fn fs(&self) -> &LayerFsConverter {
        &self.fs
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.layer.is_writable()
    }

    /// Id translator for objects stored in this layer
    ///
    /// With `allocate`, ids this layer does not know yet are registered in
    /// its manifest; use it only when writing to a writable layer.
    #[must_use]
    pub fn translator(&self, allocate: bool) -> Arc<dyn IdTranslator> {
        Arc::new(LayerTranslator {
            units: self.units.clone(),
            fs: self.fs.clone(),
            allocate: allocate && self.is_writable(),
        })
    }
}

/// Bridges the converters to the codec's translator
struct LayerTranslator {
    units: Arc<LayerUnitsConverter>,
    fs: Arc<LayerFsConverter>,
    allocate: bool,
}

impl IdTranslator for LayerTranslator {
    fn unit_to_layer(&self, client: UnitId) -> Option<UnitId> {
        if self.allocate {
            self.units.bind(client).ok()
        } else {
            self.units.client_to_layer(client)
        }
    }

    fn unit_to_client(&self, layer: UnitId) -> Option<UnitId> {
        self.units.layer_to_client(layer)
    }

    fn fs_to_layer(&self, client: FsId) -> Option<FsId> {
        if self.allocate {
            self.fs.bind(client).ok()
        } else {
            self.fs.client_to_layer(client)
        }
    }

    fn fs_to_client(&self, layer: FsId) -> Option<FsId> {
        self.fs.layer_to_client(layer)
    }
}

/// The ordered layer stack of a started repository
#[derive(Default)]
pub struct LayeringSupport {
    bindings: Vec<LayerBinding>,
}

impl LayeringSupport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a started layer to the bottom of the stack
    pub fn push(&mut self, layer: Arc<DiskLayer>, registry: &Arc<UnitRegistry>) {
        let position = self.bindings.len();
        self.bindings.push(LayerBinding {
            units: Arc::new(LayerUnitsConverter::new(registry.clone(), layer.clone())),
            fs: Arc::new(LayerFsConverter::new(registry.clone(), layer.clone())),
            layer,
            position,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&LayerBinding> {
        self.bindings.get(position)
    }

    /// Layers in lookup order
    pub fn iter(&self) -> impl Iterator<Item = &LayerBinding> {
        self.bindings.iter()
    }

    /// The top layer, if it accepts writes
    #[must_use]
    pub fn writable(&self) -> Option<&LayerBinding> {
        self.bindings.first().filter(|binding| binding.is_writable())
    }

    #[must_use]
    pub fn units_converter(&self, position: usize) -> Option<&dyn UnitsConverter> {
        self.get(position)
            .map(|binding| binding.units() as &dyn UnitsConverter)
    }

    #[must_use]
    pub fn fs_converter(&self, position: usize) -> Option<&dyn FsConverter> {
        self.get(position).map(|binding| binding.fs() as &dyn FsConverter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelrepo_common::{FilesystemId, LayerDescriptor, UnitDescriptor};
    use modelrepo_storage::DiskLayerConfig;
    use tempfile::tempdir;

    fn started(root: &std::path::Path, read_only: bool) -> Arc<DiskLayer> {
        let layer = DiskLayer::new(LayerDescriptor::new(root), DiskLayerConfig::default());
        layer.startup(1, read_only, !read_only).unwrap();
        Arc::new(layer)
    }

    #[test]
    fn test_stack_order_and_writable_top() {
        let top = tempdir().unwrap();
        let shared = tempdir().unwrap();
        started(shared.path(), false).shutdown().unwrap();

        let registry = Arc::new(UnitRegistry::new());
        let mut layering = LayeringSupport::new();
        layering.push(started(top.path(), false), &registry);
        layering.push(started(shared.path(), true), &registry);

        assert_eq!(layering.len(), 2);
        assert_eq!(layering.writable().map(LayerBinding::position), Some(0));
        assert!(!layering.get(1).unwrap().is_writable());
        assert!(layering.units_converter(2).is_none());

        let mut read_only = LayeringSupport::new();
        read_only.push(started(shared.path(), true), &registry);
        assert!(read_only.writable().is_none());
    }

    #[test]
    fn test_translator_allocates_only_when_asked() {
        let top = tempdir().unwrap();
        let registry = Arc::new(UnitRegistry::new());
        let (unit, _) = registry.get_or_allocate(&UnitDescriptor::new(
            "net.h",
            FilesystemId::new("ssh://build"),
        ));
        let fs = registry.find_fs(&FilesystemId::new("ssh://build")).unwrap();

        let mut layering = LayeringSupport::new();
        layering.push(started(top.path(), false), &registry);
        let binding = layering.get(0).unwrap();

        let lookup = binding.translator(false);
        assert_eq!(lookup.unit_to_layer(unit), None);
        assert_eq!(lookup.fs_to_layer(fs), None);

        let writer = binding.translator(true);
        let layer_unit = writer.unit_to_layer(unit).unwrap();
        let layer_fs = writer.fs_to_layer(fs).unwrap();
        assert_eq!(lookup.unit_to_layer(unit), Some(layer_unit));
        assert_eq!(lookup.unit_to_client(layer_unit), Some(unit));
        assert_eq!(lookup.fs_to_client(layer_fs), Some(fs));
        assert_eq!(
            layering.fs_converter(0).unwrap().client_to_layer(fs),
            Some(layer_fs)
        );
    }
}
