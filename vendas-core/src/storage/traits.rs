// vendas-core/src/storage/traits.rs
//! Read-only collection source abstraction
//!
//! Queries never write, so a source only has to hand out the documents of a
//! named collection. This keeps the query code independent of where the
//! sales data lives:
//!
//! ```text
//! Storage trait
//!   ├── MemoryStorage (embedding and tests)
//!   └── DumpStorage   (JSON dump file or export directory)
//! ```

use crate::error::Result;
use serde_json::Value;

/// Source of the documents of named collections
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use vendas_core::storage::{MemoryStorage, Storage};
///
/// let mut storage = MemoryStorage::new();
/// storage.insert_many("vendas", vec![json!({"compras": []})]).unwrap();
/// assert_eq!(storage.scan_documents("vendas").unwrap().len(), 1);
/// assert!(storage.scan_documents("clientes").unwrap().is_empty());
/// ```
pub trait Storage: Send + Sync {
    /// All documents of a collection, in storage order
    ///
    /// An unknown collection has no documents. An error means the collection
    /// exists but could not be read.
    fn scan_documents(&self, collection: &str) -> Result<Vec<Value>>;

    /// List all collection names
    fn list_collections(&self) -> Vec<String>;

    fn contains_collection(&self, name: &str) -> bool {
        self.list_collections().iter().any(|c| c == name)
    }
}
