//! Persistable objects and the keys that address them
//!
//! A [`Key`] is minted by the model layer together with the
//! [`PersistentFactory`] able to decode its referent, so the repository never
//! needs a global type registry.

use crate::codec::{IdTranslator, RepositoryDataInput, RepositoryDataOutput};
use bytes::Bytes;
use modelrepo_common::{Behavior, Error, RecordKey, Result, UnitId};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An object that can serialize itself
pub trait Persistent: Any + Send + Sync {
    /// Serialize this object into `out`
    fn write(&self, out: &mut RepositoryDataOutput) -> Result<()>;

    /// Access the concrete type for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Serializes and deserializes one family of [`Persistent`] objects
pub trait PersistentFactory: Send + Sync {
    /// Serialize `obj`; defaults to letting the object write itself
    fn write(&self, out: &mut RepositoryDataOutput, obj: &dyn Persistent) -> Result<()> {
        obj.write(out)
    }

    /// Decode an object of the right concrete type
    fn read(&self, input: &mut RepositoryDataInput) -> Result<Arc<dyn Persistent>>;
}

/// Downcast a decoded object to its concrete type
#[must_use]
pub fn downcast<T: Persistent>(obj: &Arc<dyn Persistent>) -> Option<&T> {
    obj.as_any().downcast_ref::<T>()
}

/// Identifies one persistable object
///
/// Two keys are equal iff their `(unit, index)` pairs are equal; the behavior
/// and factory ride along and do not take part in comparisons.
#[derive(Clone)]
pub struct Key {
    unit: UnitId,
    index: u32,
    behavior: Behavior,
    factory: Arc<dyn PersistentFactory>,
}

impl Key {
    /// Create a key with the default behavior
    pub fn new(unit: UnitId, index: u32, factory: Arc<dyn PersistentFactory>) -> Self {
        Self {
            unit,
            index,
            behavior: Behavior::Default,
            factory,
        }
    }

    /// Set the storage behavior
    #[must_use]
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn behavior(&self) -> Behavior {
        self.behavior
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<dyn PersistentFactory> {
        &self.factory
    }

    /// Storage-level address of this key
    #[must_use]
    pub const fn record(&self) -> RecordKey {
        RecordKey::new(self.unit, self.index)
    }

    /// Serialize `obj` with this key's factory
    pub fn encode(
        &self,
        obj: &dyn Persistent,
        translator: Option<Arc<dyn IdTranslator>>,
    ) -> Result<Bytes> {
        let mut out = match translator {
            Some(t) => RepositoryDataOutput::with_translator(t),
            None => RepositoryDataOutput::new(),
        };
        self.factory.write(&mut out, obj)?;
        Ok(out.into_bytes())
    }

    /// Decode a stored payload with this key's factory
    ///
    /// Any failure, including unconsumed trailing bytes, is reported as a
    /// [`Error::CorruptRecord`] for this key only.
    pub fn decode(
        &self,
        bytes: Bytes,
        translator: Option<Arc<dyn IdTranslator>>,
    ) -> Result<Arc<dyn Persistent>> {
        let mut input = match translator {
            Some(t) => RepositoryDataInput::with_translator(bytes, t),
            None => RepositoryDataInput::new(bytes),
        };
        let obj = self
            .factory
            .read(&mut input)
            .map_err(|e| Error::corrupt(self.record(), e.to_string()))?;
        if input.remaining() != 0 {
            return Err(Error::corrupt(
                self.record(),
                format!("{} trailing bytes after object", input.remaining()),
            ));
        }
        Ok(obj)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.unit == other.unit && self.index == other.index
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unit.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("unit", &self.unit)
            .field("index", &self.index)
            .field("behavior", &self.behavior)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.index)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// A parsed declaration as the model layer would persist it
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Declaration {
        pub name: String,
        pub unit: UnitId,
        pub offsets: Vec<i32>,
    }

    impl Persistent for Declaration {
        fn write(&self, out: &mut RepositoryDataOutput) -> Result<()> {
            out.write_utf(&self.name)?;
            out.write_unit_id(self.unit)?;
            out.write_int_array(&self.offsets)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) struct DeclarationFactory;

    impl PersistentFactory for DeclarationFactory {
        fn read(&self, input: &mut RepositoryDataInput) -> Result<Arc<dyn Persistent>> {
            Ok(Arc::new(Declaration {
                name: input.read_utf()?,
                unit: input.read_unit_id()?,
                offsets: input.read_int_array()?,
            }))
        }
    }

    pub(crate) fn key(unit: u32, index: u32) -> Key {
        Key::new(UnitId::new(unit), index, Arc::new(DeclarationFactory))
    }

    #[test]
    fn test_encode_decode_object() {
        let k = key(3, 11);
        let decl = Declaration {
            name: "std::vector".into(),
            unit: UnitId::new(3),
            offsets: vec![10, 20, 30],
        };

        let bytes = k.encode(&decl, None).unwrap();
        let obj = k.decode(bytes, None).unwrap();
        assert_eq!(downcast::<Declaration>(&obj), Some(&decl));
    }

    #[test]
    fn test_decode_garbage_is_corrupt_record() {
        let k = key(3, 11);
        let err = k.decode(Bytes::from_static(b"\xff\xff"), None).err().unwrap();
        match err {
            Error::CorruptRecord { key, .. } => assert_eq!(key, k.record()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let k = key(1, 1);
        let decl = Declaration {
            name: "f".into(),
            unit: UnitId::new(1),
            offsets: vec![],
        };
        let mut bytes = k.encode(&decl, None).unwrap().to_vec();
        bytes.push(0);
        assert!(k.decode(Bytes::from(bytes), None).is_err());
    }

    #[test]
    fn test_key_equality_ignores_behavior() {
        let a = key(1, 2);
        let b = key(1, 2).with_behavior(Behavior::LargeAndMutable);
        let c = key(1, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Key> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
