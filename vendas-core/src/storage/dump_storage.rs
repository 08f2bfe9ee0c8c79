// vendas-core/src/storage/dump_storage.rs
//! Read-only collection source backed by JSON exports on disk
//!
//! Two layouts are understood:
//!
//! ```text
//! vendas.json              { "vendas": [ {...}, ... ], "clientes": [...] }
//! dump/                    one file per collection
//!   ├── vendas.json        [ {...}, ... ]   (mongoexport --jsonArray)
//!   └── clientes.jsonl     {...}\n{...}\n   (one document per line)
//! ```
//!
//! A single dump file is parsed once on open. Directory collections are
//! read on every scan, so each query sees the current export.

use crate::error::{Result, VendasError};
use crate::storage::Storage;
use crate::value_utils::type_name;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON dump / export directory backend
#[derive(Debug)]
pub struct DumpStorage {
    path: PathBuf,
    layout: Layout,
}

#[derive(Debug)]
enum Layout {
    /// Whole dump held in memory
    File(HashMap<String, Vec<Value>>),
    /// Collection name -> export file
    Directory(HashMap<String, PathBuf>),
}

fn unreachable_error(path: &Path, reason: impl std::fmt::Display) -> VendasError {
    VendasError::QueryExecution(format!("cannot read {}: {}", path.display(), reason))
}

impl DumpStorage {
    /// Open a dump file or export directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let layout = if path.is_dir() {
            Layout::Directory(Self::index_directory(&path)?)
        } else {
            Layout::File(Self::load_dump_file(&path)?)
        };

        let storage = DumpStorage { path, layout };
        debug!(
            path = %storage.path.display(),
            collections = ?storage.list_collections(),
            "opened dump"
        );
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index_directory(dir: &Path) -> Result<HashMap<String, PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| unreachable_error(dir, e))?;

        let mut files: HashMap<String, PathBuf> = HashMap::new();
        for entry in entries {
            let file_path = entry.map_err(|e| unreachable_error(dir, e))?.path();
            let is_export = matches!(
                file_path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("jsonl")
            );
            if !is_export || !file_path.is_file() {
                continue;
            }
            let Some(name) = file_path.file_stem().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(previous) = files.get(name) {
                return Err(VendasError::QueryExecution(format!(
                    "collection '{}' is exported twice in {}: {} and {}",
                    name,
                    dir.display(),
                    file_name_of(previous),
                    file_name_of(&file_path)
                )));
            }
            files.insert(name.to_string(), file_path);
        }
        Ok(files)
    }

    /// `{ "<collection>": [docs...] }`
    fn load_dump_file(path: &Path) -> Result<HashMap<String, Vec<Value>>> {
        let content = fs::read_to_string(path).map_err(|e| unreachable_error(path, e))?;
        let data: Map<String, Value> =
            serde_json::from_str(&content).map_err(|e| unreachable_error(path, e))?;

        let mut collections = HashMap::new();
        for (name, documents) in data {
            let docs = match documents {
                Value::Array(docs) => docs,
                other => {
                    return Err(VendasError::QueryExecution(format!(
                        "collection '{}' in {} must be an array, found {}",
                        name,
                        path.display(),
                        type_name(&other)
                    )))
                }
            };
            check_documents(&name, &docs)?;
            collections.insert(name, docs);
        }
        Ok(collections)
    }

    /// JSON array or one document per line
    fn load_collection_file(name: &str, path: &Path) -> Result<Vec<Value>> {
        let content = fs::read_to_string(path).map_err(|e| unreachable_error(path, e))?;

        let docs = if content.trim_start().starts_with('[') {
            serde_json::from_str::<Vec<Value>>(&content).map_err(|e| unreachable_error(path, e))?
        } else {
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(number, line)| {
                    serde_json::from_str(line)
                        .map_err(|e| unreachable_error(path, format!("line {}: {}", number + 1, e)))
                })
                .collect::<Result<Vec<Value>>>()?
        };

        check_documents(name, &docs)?;
        Ok(docs)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn check_documents(collection: &str, docs: &[Value]) -> Result<()> {
    match docs.iter().position(|doc| !doc.is_object()) {
        Some(position) => Err(VendasError::QueryExecution(format!(
            "document {} of '{}' must be an object, found {}",
            position,
            collection,
            type_name(&docs[position])
        ))),
        None => Ok(()),
    }
}

impl Storage for DumpStorage {
    fn scan_documents(&self, collection: &str) -> Result<Vec<Value>> {
        match &self.layout {
            Layout::File(collections) => {
                Ok(collections.get(collection).cloned().unwrap_or_default())
            }
            Layout::Directory(files) => match files.get(collection) {
                Some(file) => Self::load_collection_file(collection, file),
                None => Ok(Vec::new()),
            },
        }
    }

    fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = match &self.layout {
            Layout::File(collections) => collections.keys().cloned().collect(),
            Layout::Directory(files) => files.keys().cloned().collect(),
        };
        names.sort();
        names
    }

    fn contains_collection(&self, name: &str) -> bool {
        match &self.layout {
            Layout::File(collections) => collections.contains_key(name),
            Layout::Directory(files) => files.contains_key(name),
        }
    }
}
