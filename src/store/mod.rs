//! Remote-first record store with a local cache fallback.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

mod local;
mod remote;

pub use local::{doc_id, LocalCache};
pub use remote::{PgDocumentStore, RemoteStore};

pub type Document = Map<String, Value>;

const BOOKKEEPING_FIELDS: &[&str] = &["id", "createdAt", "updatedAt"];

enum Served<T> {
    Remote(T),
    Local(T),
}

#[derive(Clone)]
pub struct RecordStore {
    collection: String,
    remote: Option<Arc<dyn RemoteStore>>,
    local: LocalCache,
}

impl RecordStore {
    pub fn new(
        collection: impl Into<String>,
        remote: Option<Arc<dyn RemoteStore>>,
        local: LocalCache,
    ) -> Self {
        Self {
            collection: collection.into(),
            remote,
            local,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn remote_or_local<T, R, RFut, L, LFut>(
        &self,
        op: &'static str,
        remote: R,
        local: L,
    ) -> StoreResult<Served<T>>
    where
        R: FnOnce(Arc<dyn RemoteStore>) -> RFut,
        RFut: Future<Output = StoreResult<T>>,
        L: FnOnce() -> LFut,
        LFut: Future<Output = StoreResult<T>>,
    {
        match self.remote.clone() {
            Some(store) => match remote(store).await {
                Ok(value) => return Ok(Served::Remote(value)),
                Err(err) => warn!(
                    collection = %self.collection,
                    op,
                    error = %err,
                    "remote store failed, falling back to local cache"
                ),
            },
            None => debug!(
                collection = %self.collection,
                op,
                "remote store not configured, using local cache"
            ),
        }

        local().await.map(Served::Local)
    }

    pub async fn create(&self, mut data: Document) -> StoreResult<String> {
        data.retain(|key, value| !value.is_null() && !BOOKKEEPING_FIELDS.contains(&key.as_str()));
        let now = Utc::now();
        let collection = self.collection.clone();

        let payload = data.clone();
        let local_payload = data.clone();
        let served = self
            .remote_or_local(
                "create",
                |remote| async move { remote.insert(&collection, &payload, now).await },
                || async {
                    let id = local_id(now);
                    let doc = with_bookkeeping(local_payload, &id, now, now);
                    self.local.upsert(&self.collection, doc).await?;
                    Ok(id)
                },
            )
            .await?;

        match served {
            Served::Remote(id) => {
                let mirror = with_bookkeeping(data, &id, now, now);
                if let Err(err) = self.local.upsert(&self.collection, mirror).await {
                    warn!(collection = %self.collection, id = %id, error = %err, "failed to mirror created record into local cache");
                }
                Ok(id)
            }
            Served::Local(id) => {
                debug!(collection = %self.collection, id = %id, "record created in local cache");
                Ok(id)
            }
        }
    }

    /// All documents. A reachable remote is authoritative and the cache is not read.
    pub async fn get_all(&self) -> StoreResult<Vec<Document>> {
        let collection = self.collection.clone();
        let served = self
            .remote_or_local(
                "get_all",
                |remote| async move { remote.list(&collection).await },
                || self.local.load(&self.collection),
            )
            .await?;

        Ok(match served {
            Served::Remote(docs) | Served::Local(docs) => docs,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<Document>> {
        let collection = self.collection.clone();
        let remote_id = id.to_string();
        let served = self
            .remote_or_local(
                "get_by_id",
                |remote| async move { remote.get(&collection, &remote_id).await },
                || self.local.get(&self.collection, id),
            )
            .await?;

        Ok(match served {
            Served::Remote(doc) | Served::Local(doc) => doc,
        })
    }

    pub async fn update(&self, id: &str, mut patch: Document) -> StoreResult<()> {
        patch.retain(|key, value| !value.is_null() && !BOOKKEEPING_FIELDS.contains(&key.as_str()));
        let now = Utc::now();
        patch.insert("updatedAt".to_string(), Value::String(now.to_rfc3339()));

        let collection = self.collection.clone();
        let remote_id = id.to_string();
        let remote_patch = patch.clone();
        let served = self
            .remote_or_local(
                "update",
                |remote| async move { remote.update(&collection, &remote_id, &remote_patch, now).await },
                || async {
                    if self.local.merge(&self.collection, id, &patch).await? {
                        Ok(())
                    } else {
                        Err(StoreError::NotFound(id.to_string()))
                    }
                },
            )
            .await?;

        if let Served::Remote(()) = served {
            if let Err(err) = self.local.merge(&self.collection, id, &patch).await {
                warn!(collection = %self.collection, id, error = %err, "failed to mirror update into local cache");
            }
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let collection = self.collection.clone();
        let remote_id = id.to_string();
        let served = self
            .remote_or_local(
                "delete",
                |remote| async move { remote.delete(&collection, &remote_id).await },
                || async {
                    self.local.remove(&self.collection, id).await?;
                    Ok(())
                },
            )
            .await?;

        if let Served::Remote(()) = served {
            if let Err(err) = self.local.remove(&self.collection, id).await {
                warn!(collection = %self.collection, id, error = %err, "failed to mirror delete into local cache");
            }
        }
        Ok(())
    }
}

fn local_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("local_{}_{}", now.timestamp_millis(), &random[..9])
}

fn with_bookkeeping(mut doc: Document, id: &str, created: DateTime<Utc>, updated: DateTime<Utc>) -> Document {
    doc.insert("id".to_string(), Value::String(id.to_string()));
    doc.insert("createdAt".to_string(), Value::String(created.to_rfc3339()));
    doc.insert("updatedAt".to_string(), Value::String(updated.to_rfc3339()));
    doc
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    pub struct MemoryRemote {
        docs: Mutex<BTreeMap<(String, String), Document>>,
        next_id: Mutex<u32>,
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn insert(&self, collection: &str, data: &Document, now: DateTime<Utc>) -> StoreResult<String> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("remote-{}", *next);
            let doc = with_bookkeeping(data.clone(), &id, now, now);
            self.docs
                .lock()
                .unwrap()
                .insert((collection.to_string(), id.clone()), doc);
            Ok(id)
        }

        async fn list(&self, collection: &str) -> StoreResult<Vec<Document>> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .iter()
                .filter(|((c, _), _)| c == collection)
                .map(|(_, doc)| doc.clone())
                .collect())
        }

        async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .get(&(collection.to_string(), id.to_string()))
                .cloned())
        }

        async fn update(
            &self,
            collection: &str,
            id: &str,
            patch: &Document,
            _now: DateTime<Utc>,
        ) -> StoreResult<()> {
            let mut docs = self.docs.lock().unwrap();
            let doc = docs
                .get_mut(&(collection.to_string(), id.to_string()))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            for (key, value) in patch {
                doc.insert(key.clone(), value.clone());
            }
            Ok(())
        }

        async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
            self.docs
                .lock()
                .unwrap()
                .remove(&(collection.to_string(), id.to_string()));
            Ok(())
        }
    }

    /// Remote double whose every call fails like an unreachable database.
    pub struct FailingRemote;

    #[async_trait]
    impl RemoteStore for FailingRemote {
        async fn insert(&self, _: &str, _: &Document, _: DateTime<Utc>) -> StoreResult<String> {
            Err(StoreError::Remote("connection refused".into()))
        }

        async fn list(&self, _: &str) -> StoreResult<Vec<Document>> {
            Err(StoreError::Remote("connection refused".into()))
        }

        async fn get(&self, _: &str, _: &str) -> StoreResult<Option<Document>> {
            Err(StoreError::Remote("connection refused".into()))
        }

        async fn update(&self, _: &str, _: &str, _: &Document, _: DateTime<Utc>) -> StoreResult<()> {
            Err(StoreError::Remote("connection refused".into()))
        }

        async fn delete(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::Remote("connection refused".into()))
        }
    }

    pub fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    pub fn local_store(dir: &std::path::Path) -> RecordStore {
        RecordStore::new("defauts", None, LocalCache::new(dir, "qt_"))
    }
}
