//! Client-side mirror of the replicated world
//!
//! A replica only ever learns about an entity through a full record; partial
//! records are applied on top of the view it already holds. A packet is
//! decoded completely before anything is applied, so a malformed packet
//! leaves the replica untouched.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::game::entity::EntityView;
use crate::game::id_alloc::EntityId;
use crate::net::packet::{decode_update_with, DecodedUpdate, MapInfo, ScalarState};
use crate::net::protocol::DecodeError;
use crate::net::schema::SchemaRegistry;

/// What a single packet changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub deleted: usize,
    pub full: usize,
    pub partial: usize,
    pub joined: usize,
    pub left: usize,
}

pub struct Replica {
    registry: SchemaRegistry,
    entities: HashMap<EntityId, EntityView, FxBuildHasher>,
    clients: HashMap<EntityId, String, FxBuildHasher>,
    scalar: Option<ScalarState>,
    map: Option<MapInfo>,
    packets: u64,
    rejected: u64,
}

impl Replica {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            entities: HashMap::with_hasher(FxBuildHasher),
            clients: HashMap::with_hasher(FxBuildHasher),
            scalar: None,
            map: None,
            packets: 0,
            rejected: 0,
        }
    }

    /// Decode one update packet and apply it. On error the packet is dropped
    /// and the replica keeps its previous state.
    pub fn apply(&mut self, bytes: &[u8]) -> Result<ApplySummary, DecodeError> {
        let entities = &self.entities;
        let decoded = decode_update_with(bytes, &self.registry, |id, kind| match entities.get(&id) {
            Some(view) if view.kind() == kind => Ok(view.clone()),
            Some(view) => Err(DecodeError::KindMismatch {
                expected: view.kind(),
                found: kind,
            }),
            None => Err(DecodeError::UnknownEntity(id)),
        });

        match decoded {
            Ok(update) => {
                self.packets += 1;
                Ok(self.merge(update))
            }
            Err(e) => {
                self.rejected += 1;
                warn!("dropping update packet ({} bytes): {}", bytes.len(), e);
                Err(e)
            }
        }
    }

    fn merge(&mut self, update: DecodedUpdate) -> ApplySummary {
        let summary = ApplySummary {
            deleted: update.deleted.len(),
            full: update.full.len(),
            partial: update.partial.len(),
            joined: update.new_clients.len(),
            left: update.removed_clients.len(),
        };

        for id in update.deleted {
            if self.entities.remove(&id).is_none() {
                debug!("deletion of entity {} the replica never saw", id);
            }
        }
        for record in update.full.into_iter().chain(update.partial) {
            self.entities.insert(record.id, record.view);
        }
        for (id, name) in update.new_clients {
            self.clients.insert(id, name);
        }
        for id in update.removed_clients {
            self.clients.remove(&id);
        }
        if update.scalar.is_some() {
            self.scalar = update.scalar;
        }
        if update.map.is_some() {
            self.map = update.map;
        }
        summary
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityView> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &EntityView)> + '_ {
        self.entities.iter().map(|(&id, view)| (id, view))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Known entity ids in ascending order
    pub fn ids_sorted(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn client_name(&self, id: EntityId) -> Option<&str> {
        self.clients.get(&id).map(String::as_str)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn scalar(&self) -> Option<&ScalarState> {
        self.scalar.as_ref()
    }

    pub fn map(&self) -> Option<&MapInfo> {
        self.map.as_ref()
    }

    /// Packets applied successfully
    pub fn packets_applied(&self) -> u64 {
        self.packets
    }

    pub fn packets_rejected(&self) -> u64 {
        self.rejected
    }
}
