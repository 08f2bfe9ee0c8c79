// Rendering of result rows on stdout

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How result rows are printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// One indented document per row, like `.pretty()` in the shell
    #[default]
    Pretty,
    /// A single JSON array
    Json,
    /// One compact document per line
    Lines,
}

/// Render rows; every row (or the whole array) ends with a newline
pub fn render<T: Serialize>(rows: &[T], format: Format) -> serde_json::Result<String> {
    let mut out = String::new();
    match format {
        Format::Pretty => {
            for row in rows {
                out.push_str(&serde_json::to_string_pretty(row)?);
                out.push('\n');
            }
        }
        Format::Json => {
            out.push_str(&serde_json::to_string_pretty(rows)?);
            out.push('\n');
        }
        Format::Lines => {
            for row in rows {
                out.push_str(&serde_json::to_string(row)?);
                out.push('\n');
            }
        }
    }
    Ok(out)
}
