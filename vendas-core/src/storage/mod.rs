// vendas-core/src/storage/mod.rs
//! Collection sources the query engine reads from

mod dump_storage;
mod memory_storage;
mod traits;

pub use dump_storage::DumpStorage;
pub use memory_storage::MemoryStorage;
pub use traits::Storage;
