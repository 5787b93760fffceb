//! Local record store: cached server state plus optimistic writes.
//!
//! Entities are persisted in the durable store under `"{type}/{id}"` and
//! mirrored in an in-memory map so UI reads never wait on the store. Writes go
//! to both; reads hit the mirror first.

use dashmap::DashMap;
use fieldsync_engine::{EntityRef, Timestamp, VersionedEntity};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::store::DurableStore;

/// Indexed field holding the entity type in stored values.
const ENTITY_TYPE_FIELD: &str = "entityType";

/// Cache of synchronized entities.
pub struct LocalRecordStore {
    store: Arc<dyn DurableStore>,
    memory: DashMap<EntityRef, VersionedEntity>,
}

impl LocalRecordStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            memory: DashMap::new(),
        }
    }

    fn encode(entity_ref: &EntityRef, entity: &VersionedEntity) -> Value {
        let mut snapshot = entity.snapshot();
        snapshot.insert(
            ENTITY_TYPE_FIELD.into(),
            Value::from(entity_ref.entity_type.clone()),
        );
        Value::Object(snapshot)
    }

    fn decode(value: Value) -> Option<VersionedEntity> {
        let mut value = value;
        if let Some(map) = value.as_object_mut() {
            map.remove(ENTITY_TYPE_FIELD);
        }
        VersionedEntity::from_value(value).ok()
    }

    /// Read an entity, preferring the in-memory mirror.
    pub fn get(&self, entity_ref: &EntityRef) -> Result<Option<VersionedEntity>> {
        if let Some(entity) = self.memory.get(entity_ref) {
            return Ok(Some(entity.clone()));
        }

        let Some(value) = self.store.get(&entity_ref.key())? else {
            return Ok(None);
        };
        match Self::decode(value) {
            Some(entity) => {
                self.memory.insert(entity_ref.clone(), entity.clone());
                Ok(Some(entity))
            }
            None => {
                tracing::warn!(entity = %entity_ref, "Unreadable cached entity ignored");
                Ok(None)
            }
        }
    }

    /// Write an entity to the store and the mirror.
    pub fn put(&self, entity_ref: &EntityRef, entity: &VersionedEntity) -> Result<()> {
        self.store
            .put(&entity_ref.key(), Self::encode(entity_ref, entity))?;
        self.memory.insert(entity_ref.clone(), entity.clone());
        Ok(())
    }

    /// Cache a batch of server entities of one type for offline reads.
    pub fn bulk_put(&self, entity_type: &str, entities: Vec<VersionedEntity>) -> Result<usize> {
        let mut entries = Vec::with_capacity(entities.len());
        let mut refs = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity_ref = EntityRef::new(entity_type, entity.id.clone());
            entries.push((entity_ref.key(), Self::encode(&entity_ref, &entity)));
            refs.push((entity_ref, entity));
        }

        self.store.bulk_put(entries)?;
        let count = refs.len();
        for (entity_ref, entity) in refs {
            self.memory.insert(entity_ref, entity);
        }
        Ok(count)
    }

    pub fn delete(&self, entity_ref: &EntityRef) -> Result<bool> {
        self.memory.remove(entity_ref);
        Ok(self.store.delete(&entity_ref.key())?)
    }

    /// All cached entities of a type, ordered by id.
    pub fn query(&self, entity_type: &str) -> Result<Vec<VersionedEntity>> {
        let rows = self
            .store
            .query_by_index(ENTITY_TYPE_FIELD, &Value::from(entity_type))?;
        // queued operations share the store and carry the same index field
        let prefix = format!("{entity_type}/");
        let mut entities: Vec<VersionedEntity> = rows
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, value)| Self::decode(value))
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    /// Stamp a cached entity with a successful server response.
    ///
    /// When the entity is not cached yet, the response itself is cached if it
    /// parses as an entity. The cached version never moves backwards.
    pub fn reconcile(
        &self,
        entity_ref: &EntityRef,
        response: &Value,
        now: Timestamp,
    ) -> Result<Option<VersionedEntity>> {
        let next = match self.get(entity_ref)? {
            Some(current) => {
                let mut next = current.reconcile(response, now);
                next.version = next.version.max(current.version);
                next
            }
            None => {
                let mut response = response.clone();
                if let Some(map) = response.as_object_mut() {
                    map.entry("id")
                        .or_insert_with(|| Value::from(entity_ref.entity_id.clone()));
                }
                match VersionedEntity::from_value(response) {
                    Ok(mut entity) => {
                        if entity.updated_at == 0 {
                            entity.updated_at = now;
                        }
                        entity
                    }
                    Err(_) => return Ok(None),
                }
            }
        };

        self.put(entity_ref, &next)?;
        Ok(Some(next))
    }

    /// Bump only the version of a cached entity (used while later local edits
    /// to it are still queued, so their fields must not be overwritten).
    pub fn observe_version(
        &self,
        entity_ref: &EntityRef,
        version: u64,
    ) -> Result<Option<VersionedEntity>> {
        let Some(mut entity) = self.get(entity_ref)? else {
            return Ok(None);
        };
        if version > entity.version {
            entity.version = version;
            self.put(entity_ref, &entity)?;
        }
        Ok(Some(entity))
    }
}
