use std::path::PathBuf;

use serde_json::Value;

use super::Document;
use crate::error::StoreResult;
use crate::timestamp::normalize_timestamp;

const DATE_FIELDS: &[&str] = &["createdAt", "updatedAt", "detectedAt"];

/// One JSON array per collection. Concurrent writers are not coordinated.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
    prefix: String,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", self.prefix, collection))
    }

    pub async fn load(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let path = self.path_for(collection);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let mut docs: Vec<Document> = serde_json::from_slice(&raw)?;
        for doc in docs.iter_mut() {
            revive_dates(doc);
        }
        Ok(docs)
    }

    pub async fn save(&self, collection: &str, docs: &[Document]) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let payload = serde_json::to_vec_pretty(docs)?;
        tokio::fs::write(self.path_for(collection), payload).await?;
        Ok(())
    }

    pub async fn upsert(&self, collection: &str, doc: Document) -> StoreResult<()> {
        let mut docs = self.load(collection).await?;
        let id = doc_id(&doc).map(str::to_string);
        match docs.iter_mut().find(|existing| id.is_some() && doc_id(existing) == id.as_deref()) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        self.save(collection, &docs).await
    }

    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let docs = self.load(collection).await?;
        Ok(docs.into_iter().find(|doc| doc_id(doc) == Some(id)))
    }

    /// Merges `patch` into the cached document. Returns false when the id is not cached.
    pub async fn merge(&self, collection: &str, id: &str, patch: &Document) -> StoreResult<bool> {
        let mut docs = self.load(collection).await?;
        let Some(doc) = docs.iter_mut().find(|doc| doc_id(doc) == Some(id)) else {
            return Ok(false);
        };
        for (key, value) in patch {
            doc.insert(key.clone(), value.clone());
        }
        self.save(collection, &docs).await?;
        Ok(true)
    }

    pub async fn remove(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let mut docs = self.load(collection).await?;
        let before = docs.len();
        docs.retain(|doc| doc_id(doc) != Some(id));
        if docs.len() == before {
            return Ok(false);
        }
        self.save(collection, &docs).await?;
        Ok(true)
    }
}

pub fn doc_id(doc: &Document) -> Option<&str> {
    doc.get("id").and_then(Value::as_str)
}

fn revive_dates(doc: &mut Document) {
    for field in DATE_FIELDS {
        if let Some(value) = doc.get_mut(*field) {
            if let Some(parsed) = normalize_timestamp(value) {
                *value = Value::String(parsed.to_rfc3339());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "qt_");
        assert!(cache.load("defauts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collections_are_keyed_by_prefix_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "qt_");
        cache
            .upsert("defauts", doc(json!({"id": "a", "operatorName": "Lina"})))
            .await
            .unwrap();

        assert!(dir.path().join("qt_defauts.json").exists());
        assert!(cache.load("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "qt_");
        cache.upsert("c", doc(json!({"id": "a", "n": 1}))).await.unwrap();
        cache.upsert("c", doc(json!({"id": "a", "n": 2}))).await.unwrap();

        let docs = cache.load("c").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["n"], 2);
    }

    #[tokio::test]
    async fn serialized_dates_are_revived_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "qt_");
        cache
            .upsert(
                "c",
                doc(json!({"id": "a", "detectedAt": {"seconds": 1_700_000_000, "nanoseconds": 0}})),
            )
            .await
            .unwrap();

        let loaded = cache.get("c", "a").await.unwrap().unwrap();
        assert_eq!(loaded["detectedAt"], "2023-11-14T22:13:20+00:00");
    }

    #[tokio::test]
    async fn merge_and_remove_report_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "qt_");
        cache.upsert("c", doc(json!({"id": "a", "n": 1}))).await.unwrap();

        assert!(cache.merge("c", "a", &doc(json!({"n": 5}))).await.unwrap());
        assert!(!cache.merge("c", "zz", &doc(json!({"n": 5}))).await.unwrap());
        assert_eq!(cache.get("c", "a").await.unwrap().unwrap()["n"], 5);

        assert!(cache.remove("c", "a").await.unwrap());
        assert!(!cache.remove("c", "a").await.unwrap());
    }
}
