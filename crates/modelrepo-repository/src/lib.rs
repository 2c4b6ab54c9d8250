//! modelrepo Repository - the layered repository facade
//!
//! This crate stacks disk layers into one repository:
//! - `UnitRegistry` assigns process-wide unit and filesystem ids
//! - Converters translate ids between the client and each layer's numbering
//! - `LayeringSupport` orders layers from most specific to most generic
//! - `Repository` routes reads top-down and writes to the top layer

pub mod converter;
pub mod layering;
pub mod listener;
pub mod registry;
pub mod repository;

// Re-exports
pub use converter::{
    FsConverter, IdentityConverter, LayerFsConverter, LayerUnitsConverter, UnitsConverter,
};
pub use layering::{LayerBinding, LayeringSupport};
pub use listener::{ListenerId, UnitEvent, UnitListeners};
pub use registry::{UnitRegistry, UnitState};
pub use repository::{Repository, RepositoryState};
