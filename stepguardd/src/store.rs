//! In-memory collections.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;
use stepguard_common::protocol::{ServerError, ServerErrorCode};
use stepguard_common::types::{Document, Namespace};
use uuid::Uuid;

#[derive(Default)]
pub struct Store {
    collections: RwLock<BTreeMap<Namespace, Vec<Document>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `docs` in order. The batch is rejected as a whole on a duplicate `_id`.
    pub fn insert(&self, ns: &Namespace, docs: Vec<Document>) -> Result<usize, ServerError> {
        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs {
            let Value::Object(mut map) = doc else {
                return Err(ServerError::new(
                    ServerErrorCode::BadValue,
                    "documents must be objects",
                ));
            };
            map.entry("_id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            prepared.push(Value::Object(map));
        }

        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        let coll = collections.entry(ns.clone()).or_default();
        for (i, doc) in prepared.iter().enumerate() {
            let id = &doc["_id"];
            let clash = coll.iter().any(|d| &d["_id"] == id)
                || prepared[..i].iter().any(|d| &d["_id"] == id);
            if clash {
                return Err(ServerError::new(
                    ServerErrorCode::DuplicateKey,
                    format!("E11000 duplicate key error collection: {ns} dup key: {{ _id: {id} }}"),
                ));
            }
        }
        let n = prepared.len();
        coll.extend(prepared);
        Ok(n)
    }

    /// Documents in insertion order whose top-level fields equal every field of `filter`.
    pub fn find(&self, ns: &Namespace, filter: Option<&Document>) -> Vec<Document> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let Some(coll) = collections.get(ns) else {
            return Vec::new();
        };
        coll.iter()
            .filter(|doc| matches_filter(doc, filter))
            .cloned()
            .collect()
    }
}

fn matches_filter(doc: &Document, filter: Option<&Document>) -> bool {
    match filter {
        Some(Value::Object(fields)) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("test", "coll")
    }

    #[test]
    fn test_insert_and_find_in_order() {
        let store = Store::new();
        store
            .insert(&ns(), vec![json!({"_id": 1, "x": "a"}), json!({"_id": 0, "x": "b"})])
            .unwrap();
        let all = store.find(&ns(), None);
        assert_eq!(all[0]["_id"], 1);
        assert_eq!(all[1]["_id"], 0);
        assert_eq!(store.find(&ns(), Some(&json!({"x": "b"}))).len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejects_batch() {
        let store = Store::new();
        store.insert(&ns(), vec![json!({"_id": 0})]).unwrap();
        let err = store
            .insert(&ns(), vec![json!({"_id": 1}), json!({"_id": 0})])
            .unwrap_err();
        assert_eq!(err.code_name, ServerErrorCode::DuplicateKey);
        assert_eq!(store.find(&ns(), None).len(), 1);
    }

    #[test]
    fn test_missing_id_is_generated() {
        let store = Store::new();
        store.insert(&ns(), vec![json!({"x": 1})]).unwrap();
        assert!(store.find(&ns(), None)[0]["_id"].is_string());
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        assert!(Store::new().find(&Namespace::new("nope", "nope"), None).is_empty());
    }
}
