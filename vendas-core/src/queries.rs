// vendas-core/src/queries.rs
//! Built-in queries over the sales collection
//!
//! [`DistinctProducts`] lists every product name that appears in any
//! purchase of any sale:
//!
//! ```javascript
//! db.vendas.aggregate([
//!       { $unwind: "$compras" },
//!       { $group: { _id: "$compras.nome_produto" } },
//!       { $project: { "nome_produto": "$_id", "_id": 0 } }
//!     ]).pretty()
//! ```

use crate::aggregation::{GroupStage, Pipeline, ProjectStage, SortDirection};
use crate::database::Database;
use crate::error::{Result, VendasError};
use crate::script::collection_accessor;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default sales collection
pub const SALES_COLLECTION: &str = "vendas";

/// Array of purchases inside a sale document
pub const PURCHASES_FIELD: &str = "compras";

/// Product name inside a purchase, and the output attribute
pub const PRODUCT_NAME_FIELD: &str = "nome_produto";

/// One distinct product
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductRow {
    pub nome_produto: String,
}

impl ProductRow {
    pub fn new(name: impl Into<String>) -> Self {
        ProductRow {
            nome_produto: name.into(),
        }
    }
}

/// Distinct product names across all purchases of all sales
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctProducts {
    collection: String,
    sorted: bool,
}

impl Default for DistinctProducts {
    fn default() -> Self {
        Self::new()
    }
}

impl DistinctProducts {
    /// The query against the `vendas` collection
    pub fn new() -> Self {
        Self::with_collection(SALES_COLLECTION)
    }

    pub fn with_collection(collection: &str) -> Self {
        DistinctProducts {
            collection: collection.to_string(),
            sorted: false,
        }
    }

    /// Append a sort on `nome_produto` so rows come out in ascending order
    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Unwind purchases, group by product name, project the name
    pub fn pipeline(&self) -> Pipeline {
        let purchases = format!("${}", PURCHASES_FIELD);
        let group_key = format!("${}.{}", PURCHASES_FIELD, PRODUCT_NAME_FIELD);

        let builder = Pipeline::builder()
            .unwind(&purchases)
            .group(GroupStage::by(&group_key))
            .project(
                ProjectStage::new()
                    .rename(PRODUCT_NAME_FIELD, "$_id")
                    .exclude("_id"),
            );

        let builder = if self.sorted {
            builder.sort(PRODUCT_NAME_FIELD, SortDirection::Ascending)
        } else {
            builder
        };

        builder.build()
    }

    /// Console script form of the query
    pub fn script(&self) -> String {
        let mut stages = vec![
            r#"{ $unwind: "$compras" }"#,
            r#"{ $group: { _id: "$compras.nome_produto" } }"#,
            r#"{ $project: { "nome_produto": "$_id", "_id": 0 } }"#,
        ];
        if self.sorted {
            stages.push(r#"{ $sort: { "nome_produto": 1 } }"#);
        }
        format!(
            "// db-{coll}-aggregate-produtos-distintos.js\n\
             {accessor}.aggregate([\n      {stages}\n    ]).pretty()\n",
            coll = self.collection,
            accessor = collection_accessor(&self.collection),
            stages = stages.join(",\n      ")
        )
    }

    /// Run the query; any failure aborts the whole result set
    pub fn run<S: Storage>(&self, db: &Database<S>) -> Result<Vec<ProductRow>> {
        let rows = db.aggregate(&self.collection, &self.pipeline())?;
        rows.into_iter().map(product_row).collect()
    }
}

fn product_row(row: Value) -> Result<ProductRow> {
    match row.get(PRODUCT_NAME_FIELD) {
        Some(Value::String(name)) => Ok(ProductRow::new(name.as_str())),
        None | Some(Value::Null) => Err(VendasError::QueryExecution(format!(
            "purchase without {}",
            PRODUCT_NAME_FIELD
        ))),
        Some(other) => Err(VendasError::QueryExecution(format!(
            "purchase with non-string {}: {}",
            PRODUCT_NAME_FIELD, other
        ))),
    }
}
