//! Per-kind wire schema table
//!
//! Gameplay registers one [`EntitySchema`] per entity kind at startup. The
//! netcode never matches on concrete kinds itself; it dispatches through this
//! table by wire tag.

use crate::game::entity::{EntityKind, EntityView};
use crate::net::bitstream::{BitReader, BitWriter};
use crate::net::protocol::DecodeError;

/// Writes one field group of a view
pub type SerializeFn = fn(&EntityView, &mut BitWriter);

/// Reads one field group into an existing view
pub type DeserializeFn = fn(&mut BitReader<'_>, &mut EntityView) -> Result<(), DecodeError>;

/// Encoding functions and byte budgets for one entity kind.
///
/// `serialize_*`/`deserialize_*` must be exact inverses up to the declared
/// float quantization. `partial_size` and `full_size` bound the cached
/// record sizes including the `[id][tag]` header.
#[derive(Clone, Copy)]
pub struct EntitySchema {
    pub partial_size: usize,
    pub full_size: usize,
    pub serialize_partial: SerializeFn,
    pub serialize_full: SerializeFn,
    pub deserialize_partial: DeserializeFn,
    pub deserialize_full: DeserializeFn,
}

impl std::fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySchema")
            .field("partial_size", &self.partial_size)
            .field("full_size", &self.full_size)
            .finish_non_exhaustive()
    }
}

/// Fixed lookup table indexed by kind tag
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: [Option<EntitySchema>; EntityKind::COUNT],
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind registered
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in EntityKind::ALL {
            registry.register(kind, crate::net::schemas::schema_for(kind));
        }
        registry
    }

    /// Register (or replace) the schema for a kind
    pub fn register(&mut self, kind: EntityKind, schema: EntitySchema) {
        self.schemas[kind.tag() as usize] = Some(schema);
    }

    pub fn get(&self, kind: EntityKind) -> Option<&EntitySchema> {
        self.schemas[kind.tag() as usize].as_ref()
    }

    /// Lookup by raw wire tag; unknown or unregistered tags are a decode error
    pub fn get_by_tag(&self, tag: u8) -> Result<(EntityKind, &EntitySchema), DecodeError> {
        let kind = EntityKind::from_tag(tag).ok_or(DecodeError::UnknownEntityKind(tag))?;
        let schema = self.get(kind).ok_or(DecodeError::UnknownEntityKind(tag))?;
        Ok((kind, schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registers_every_kind() {
        let registry = SchemaRegistry::standard();
        for kind in EntityKind::ALL {
            assert!(registry.get(kind).is_some(), "{} missing", kind.name());
            let (found, _) = registry.get_by_tag(kind.tag()).unwrap();
            assert_eq!(found, kind);
        }
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        let registry = SchemaRegistry::standard();
        assert!(matches!(registry.get_by_tag(9), Err(DecodeError::UnknownEntityKind(9))));
    }

    #[test]
    fn test_unregistered_kind_is_decode_error() {
        let mut registry = SchemaRegistry::new();
        registry.register(EntityKind::Mob, crate::net::schemas::schema_for(EntityKind::Mob));
        assert!(registry.get_by_tag(EntityKind::Mob.tag()).is_ok());
        assert!(matches!(
            registry.get_by_tag(EntityKind::Loot.tag()),
            Err(DecodeError::UnknownEntityKind(3))
        ));
    }
}
