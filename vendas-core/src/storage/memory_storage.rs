// vendas-core/src/storage/memory_storage.rs
//! Pure in-memory collection source
//!
//! Holds collections as plain vectors of JSON documents. Used to embed the
//! query engine in another program and by the test suites.

use crate::error::{Result, VendasError};
use crate::storage::Storage;
use serde_json::Value;
use std::collections::HashMap;

/// In-memory storage backend
///
/// Documents without an `_id` receive an auto-incrementing integer id on
/// insert, the way a document database assigns one.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Collection name -> documents
    collections: HashMap<String, Vec<Value>>,

    /// Collection name -> last generated integer _id
    last_ids: HashMap<String, i64>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Append documents to a collection, creating it when missing
    ///
    /// Returns the number of inserted documents. Nothing is inserted when
    /// any of the documents is not a JSON object.
    pub fn insert_many<I>(&mut self, collection: &str, docs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Value>,
    {
        let docs: Vec<Value> = docs.into_iter().collect();
        if let Some(position) = docs.iter().position(|doc| !doc.is_object()) {
            return Err(VendasError::QueryExecution(format!(
                "document {} for '{}' must be an object",
                position, collection
            )));
        }

        let last_id = self.last_ids.entry(collection.to_string()).or_insert(0);
        let target = self.collections.entry(collection.to_string()).or_default();

        let inserted = docs.len();
        for mut doc in docs {
            if let Value::Object(map) = &mut doc {
                match map.get("_id").and_then(Value::as_i64) {
                    Some(id) => *last_id = (*last_id).max(id),
                    None if !map.contains_key("_id") => {
                        *last_id += 1;
                        map.insert("_id".to_string(), Value::from(*last_id));
                    }
                    None => {}
                }
            }
            target.push(doc);
        }

        Ok(inserted)
    }
}

impl Storage for MemoryStorage {
    fn scan_documents(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self.collections.get(collection).cloned().unwrap_or_default())
    }

    fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn contains_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_insert_creates_collection() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.insert_many("vendas", Vec::new()).unwrap(), 0);
        assert_eq!(storage.insert_many("vendas", Vec::new()).unwrap(), 0);

        assert_eq!(storage.list_collections(), vec!["vendas"]);
        assert!(storage.contains_collection("vendas"));
        assert!(storage.scan_documents("vendas").unwrap().is_empty());
    }

    #[test]
    fn test_insert_assigns_ids() {
        let mut storage = MemoryStorage::new();
        let inserted = storage
            .insert_many(
                "vendas",
                vec![
                    json!({"cliente": "Ana"}),
                    json!({"_id": 10, "cliente": "Bruno"}),
                    json!({"cliente": "Carla"}),
                    json!({"_id": "pedido-7", "cliente": "Davi"}),
                ],
            )
            .unwrap();
        assert_eq!(inserted, 4);

        let docs = storage.scan_documents("vendas").unwrap();
        assert_eq!(docs[0]["_id"], 1);
        assert_eq!(docs[1]["_id"], 10);
        assert_eq!(docs[2]["_id"], 11);
        assert_eq!(docs[3]["_id"], "pedido-7");
    }

    #[test]
    fn test_insert_rejects_non_objects() {
        let mut storage = MemoryStorage::new();
        let result = storage.insert_many("vendas", vec![json!({"a": 1}), json!([1, 2])]);

        assert!(matches!(result, Err(VendasError::QueryExecution(_))));
        assert!(storage.scan_documents("vendas").unwrap().is_empty());
    }

    #[test]
    fn test_scan_unknown_collection() {
        let storage = MemoryStorage::new();
        assert!(storage.scan_documents("vendas").unwrap().is_empty());
        assert!(!storage.contains_collection("vendas"));
    }

    #[test]
    fn test_scan_keeps_insertion_order() {
        let mut storage = MemoryStorage::new();
        for i in 0..5 {
            storage.insert_many("vendas", vec![json!({"n": i})]).unwrap();
        }
        let docs = storage.scan_documents("vendas").unwrap();
        let ns: Vec<i64> = docs.iter().filter_map(|d| d["n"].as_i64()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }
}
