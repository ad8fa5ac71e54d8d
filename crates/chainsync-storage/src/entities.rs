//! In-memory entity store.
//!
//! Every record keeps its full version history as `(timestamp, data)` pairs,
//! oldest first. A deletion is a version without data. Reads resolve the
//! latest version at or before the requested timestamp, and `revert` drops
//! every version stamped after the safe timestamp.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chainsync_core::error::StoreError;
use chainsync_core::schema::{EntityInstance, Schema};
use chainsync_core::store::EntityStore;

#[derive(Debug, Clone)]
struct Version {
    timestamp: u64,
    data: Option<EntityInstance>,
}

type Records = BTreeMap<String, Vec<Version>>;

#[derive(Default)]
struct EntityData {
    schema: Option<Schema>,
    models: HashMap<String, Records>,
}

impl EntityData {
    fn records(&self, model: &str) -> Result<&Records, StoreError> {
        self.models
            .get(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }

    fn records_mut(&mut self, model: &str) -> Result<&mut Records, StoreError> {
        self.models
            .get_mut(model)
            .ok_or_else(|| StoreError::UnknownModel(model.to_string()))
    }
}

fn latest_at(versions: &[Version], timestamp: u64) -> Option<&EntityInstance> {
    versions
        .iter()
        .rev()
        .find(|v| v.timestamp <= timestamp)
        .and_then(|v| v.data.as_ref())
}

/// Append a version, overwriting one already stamped with `timestamp`.
fn write_version(versions: &mut Vec<Version>, timestamp: u64, data: Option<EntityInstance>) {
    match versions.last_mut() {
        Some(last) if last.timestamp == timestamp => last.data = data,
        _ => versions.push(Version { timestamp, data }),
    }
}

fn merge(mut base: EntityInstance, changes: EntityInstance) -> EntityInstance {
    for (key, value) in changes {
        base.insert(key, value);
    }
    base
}

fn with_id(mut data: EntityInstance, id: &str) -> EntityInstance {
    data.insert("id".into(), serde_json::Value::String(id.to_string()));
    data
}

/// Versioned in-memory entity storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryEntityStore {
    data: Mutex<EntityData>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema loaded by the last [`EntityStore::reload`].
    pub fn schema(&self) -> Option<Schema> {
        self.data().schema.clone()
    }

    /// Number of live records of `model` as of its latest version.
    pub fn count(&self, model: &str) -> usize {
        self.data()
            .models
            .get(model)
            .map(|records| {
                records
                    .values()
                    .filter(|versions| versions.last().is_some_and(|v| v.data.is_some()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Latest live version of every record of `model`, ordered by id.
    pub fn latest(&self, model: &str) -> Vec<EntityInstance> {
        self.data()
            .models
            .get(model)
            .map(|records| {
                records
                    .values()
                    .filter_map(|versions| versions.last()?.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn data(&self) -> MutexGuard<'_, EntityData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn reload(&self, schema: &Schema) -> Result<(), StoreError> {
        let mut data = self.data();
        data.models = schema
            .entities
            .iter()
            .map(|entity| (entity.name.clone(), Records::new()))
            .collect();
        data.schema = Some(schema.clone());
        tracing::debug!(entities = schema.entities.len(), "entity store reloaded");
        Ok(())
    }

    async fn revert(&self, safe_timestamp: u64) -> Result<(), StoreError> {
        let mut data = self.data();
        let mut dropped = 0usize;
        for records in data.models.values_mut() {
            records.retain(|_, versions| {
                let before = versions.len();
                versions.retain(|v| v.timestamp <= safe_timestamp);
                dropped += before - versions.len();
                !versions.is_empty()
            });
        }
        tracing::debug!(safe_timestamp, dropped, "entity store reverted");
        Ok(())
    }

    async fn find_unique(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
    ) -> Result<Option<EntityInstance>, StoreError> {
        let data = self.data();
        Ok(data
            .records(model)?
            .get(id)
            .and_then(|versions| latest_at(versions, timestamp))
            .cloned())
    }

    async fn create(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        let mut store = self.data();
        let versions = store.records_mut(model)?.entry(id.to_string()).or_default();
        if latest_at(versions, timestamp).is_some() {
            return Err(StoreError::Conflict {
                model: model.to_string(),
                id: id.to_string(),
            });
        }
        let record = with_id(data, id);
        write_version(versions, timestamp, Some(record.clone()));
        Ok(record)
    }

    async fn update(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        let mut store = self.data();
        let not_found = || StoreError::NotFound {
            model: model.to_string(),
            id: id.to_string(),
        };
        let versions = store.records_mut(model)?.get_mut(id).ok_or_else(not_found)?;
        let current = latest_at(versions, timestamp).cloned().ok_or_else(not_found)?;
        let record = with_id(merge(current, data), id);
        write_version(versions, timestamp, Some(record.clone()));
        Ok(record)
    }

    async fn upsert(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        create: EntityInstance,
        update: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        let mut store = self.data();
        let versions = store.records_mut(model)?.entry(id.to_string()).or_default();
        let record = match latest_at(versions, timestamp).cloned() {
            Some(current) => merge(current, update),
            None => create,
        };
        let record = with_id(record, id);
        write_version(versions, timestamp, Some(record.clone()));
        Ok(record)
    }

    async fn delete(&self, model: &str, timestamp: u64, id: &str) -> Result<bool, StoreError> {
        let mut store = self.data();
        let Some(versions) = store.records_mut(model)?.get_mut(id) else {
            return Ok(false);
        };
        if latest_at(versions, timestamp).is_none() {
            return Ok(false);
        }
        write_version(versions, timestamp, None);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::schema::{EntitySchema, FieldKind};
    use serde_json::json;

    fn obj(value: serde_json::Value) -> EntityInstance {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn store() -> InMemoryEntityStore {
        let store = InMemoryEntityStore::new();
        let schema = Schema::new(vec![EntitySchema::new("Account")
            .field("id", FieldKind::String)
            .field("balance", FieldKind::BigInt)]);
        store.reload(&schema).await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = store().await;
        store
            .create("Account", 100, "alice", obj(json!({ "balance": "5" })))
            .await
            .unwrap();

        let found = store.find_unique("Account", 100, "alice").await.unwrap().unwrap();
        assert_eq!(found["balance"], json!("5"));
        assert_eq!(found["id"], json!("alice"));
        // Not visible before it was created.
        assert!(store.find_unique("Account", 99, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_conflicts_and_update_requires_record() {
        let store = store().await;
        store.create("Account", 1, "a", EntityInstance::new()).await.unwrap();
        let err = store.create("Account", 2, "a", EntityInstance::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let err = store.update("Account", 2, "b", EntityInstance::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let store = store().await;
        let err = store.find_unique("Token", 1, "x").await.unwrap_err();
        assert_eq!(err, StoreError::UnknownModel("Token".into()));
    }

    #[tokio::test]
    async fn upsert_merges_update_into_existing() {
        let store = store().await;
        store
            .upsert("Account", 1, "a", obj(json!({ "balance": "1" })), obj(json!({})))
            .await
            .unwrap();
        let record = store
            .upsert(
                "Account",
                2,
                "a",
                obj(json!({ "balance": "0" })),
                obj(json!({ "balance": "7" })),
            )
            .await
            .unwrap();
        assert_eq!(record["balance"], json!("7"));
        assert_eq!(store.count("Account"), 1);
        assert_eq!(store.latest("Account"), vec![record]);
    }

    #[tokio::test]
    async fn revert_restores_prior_versions() {
        let store = store().await;
        store.create("Account", 10, "a", obj(json!({ "balance": "1" }))).await.unwrap();
        store.update("Account", 20, "a", obj(json!({ "balance": "2" }))).await.unwrap();
        store.create("Account", 30, "b", EntityInstance::new()).await.unwrap();
        store.delete("Account", 30, "a").await.unwrap();
        assert_eq!(store.count("Account"), 1);

        store.revert(15).await.unwrap();

        let a = store.find_unique("Account", u64::MAX, "a").await.unwrap().unwrap();
        assert_eq!(a["balance"], json!("1"));
        assert!(store.find_unique("Account", u64::MAX, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_at_same_timestamp_collapse() {
        let store = store().await;
        store.create("Account", 5, "a", obj(json!({ "balance": "1" }))).await.unwrap();
        store.update("Account", 5, "a", obj(json!({ "balance": "3" }))).await.unwrap();
        store.revert(4).await.unwrap();
        assert!(store.find_unique("Account", u64::MAX, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_returns_whether_record_existed() {
        let store = store().await;
        assert!(!store.delete("Account", 1, "a").await.unwrap());
        store.create("Account", 1, "a", EntityInstance::new()).await.unwrap();
        assert!(store.delete("Account", 2, "a").await.unwrap());
        assert!(!store.delete("Account", 3, "a").await.unwrap());
        // Deleted record can be created again.
        store.create("Account", 4, "a", EntityInstance::new()).await.unwrap();
    }

    #[tokio::test]
    async fn reload_drops_all_data() {
        let store = store().await;
        store.create("Account", 1, "a", EntityInstance::new()).await.unwrap();
        let schema = store.schema().unwrap();
        store.reload(&schema).await.unwrap();
        assert_eq!(store.count("Account"), 0);
    }
}
