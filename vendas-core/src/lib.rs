// vendas-core/src/lib.rs
// Embedded aggregation engine for the sales collection

pub mod aggregation;
pub mod database;
pub mod error;
pub mod extract;
pub mod queries;
pub mod script;
pub mod storage;
pub mod value_utils;

// Public exports
pub use aggregation::{Accumulator, GroupStage, Pipeline, ProjectStage, SortDirection, Stage, UnwindStage};
pub use database::Database;
pub use error::{Result, VendasError};
pub use extract::{CodeblockExtractor, ExtractStats};
pub use queries::{DistinctProducts, ProductRow, SALES_COLLECTION};
pub use script::QueryScript;
pub use storage::{DumpStorage, MemoryStorage, Storage};
