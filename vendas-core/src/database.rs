// vendas-core/src/database.rs
// Database handle: runs pipelines against the collections of a source

use crate::aggregation::Pipeline;
use crate::error::Result;
use crate::storage::{DumpStorage, MemoryStorage, Storage};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared, cloneable handle over a collection source
pub struct Database<S: Storage> {
    storage: Arc<RwLock<S>>,
}

impl<S: Storage> Clone for Database<S> {
    fn clone(&self) -> Self {
        Database {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl Database<MemoryStorage> {
    pub fn in_memory() -> Self {
        Database::new(MemoryStorage::new())
    }
}

impl Database<DumpStorage> {
    /// Open a JSON dump file or export directory
    pub fn open_dump<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Database::new(DumpStorage::open(path)?))
    }
}

impl<S: Storage> Database<S> {
    pub fn new(storage: S) -> Self {
        Database {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn storage_mut(&self) -> RwLockWriteGuard<'_, S> {
        self.storage.write()
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.storage.read().list_collections()
    }

    /// Run an aggregation pipeline over every document of a collection
    ///
    /// Either the whole result set is returned or a single error; a failing
    /// document aborts the query.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use vendas_core::Database;
    ///
    /// let db = Database::in_memory();
    /// db.storage_mut()
    ///     .insert_many("vendas", vec![json!({"compras": [{"nome_produto": "Caneta"}]})])
    ///     .unwrap();
    ///
    /// let rows = db
    ///     .aggregate_json("vendas", &json!([
    ///         {"$unwind": "$compras"},
    ///         {"$group": {"_id": "$compras.nome_produto"}}
    ///     ]))
    ///     .unwrap();
    /// assert_eq!(rows, vec![json!({"_id": "Caneta"})]);
    /// ```
    pub fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let docs = {
            let storage = self.storage.read();
            if !storage.contains_collection(collection) {
                warn!(collection, "collection does not exist, scanning nothing");
            }
            storage.scan_documents(collection)?
        };

        let scanned = docs.len();
        let rows = pipeline.execute(docs)?;
        info!(collection, scanned, returned = rows.len(), "aggregate finished");
        Ok(rows)
    }

    /// Parse a JSON pipeline and run it
    pub fn aggregate_json(&self, collection: &str, pipeline_json: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::from_json(pipeline_json)?;
        self.aggregate(collection, &pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VendasError;
    use serde_json::json;

    fn seeded() -> Database<MemoryStorage> {
        let db = Database::in_memory();
        db.storage_mut()
            .insert_many(
                "vendas",
                vec![
                    json!({"loja": "Centro", "total": 10}),
                    json!({"loja": "Centro", "total": 5}),
                    json!({"loja": "Norte", "total": 7}),
                ],
            )
            .unwrap();
        db
    }

    #[test]
    fn test_aggregate_group_sum() {
        let db = seeded();
        let rows = db
            .aggregate_json(
                "vendas",
                &json!([
                    {"$group": {"_id": "$loja", "total": {"$sum": "$total"}}},
                    {"$sort": {"total": -1}}
                ]),
            )
            .unwrap();
        assert_eq!(
            rows,
            vec![json!({"_id": "Centro", "total": 15}), json!({"_id": "Norte", "total": 7})]
        );
    }

    #[test]
    fn test_aggregate_unknown_collection_is_empty() {
        let db = seeded();
        let rows = db
            .aggregate_json("devolucoes", &json!([{"$limit": 10}]))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_aggregate_invalid_pipeline() {
        let db = seeded();
        let err = db.aggregate_json("vendas", &json!({})).unwrap_err();
        assert!(matches!(err, VendasError::AggregationError(_)));
    }

    #[test]
    fn test_clones_share_storage() {
        let db = Database::in_memory();
        let other = db.clone();
        other
            .storage_mut()
            .insert_many("vendas", vec![json!({"compras": []})])
            .unwrap();
        assert_eq!(db.list_collections(), vec!["vendas"]);
    }

    #[test]
    fn test_open_dump_missing_path() {
        let err = Database::open_dump("/nonexistent/vendas.json").err().unwrap();
        assert!(matches!(err, VendasError::QueryExecution(_)));
    }
}
