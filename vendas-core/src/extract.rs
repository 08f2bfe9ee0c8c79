// vendas-core/src/extract.rs
//! Extract query scripts from Markdown code blocks
//!
//! Queries are documented in a README as fenced blocks whose first line
//! names the target file:
//!
//! ````markdown
//! ```javascript
//! // db-vendas-aggregate-produtos-distintos.js
//! db.vendas.aggregate([ ... ]).pretty()
//! ```
//! ````
//!
//! Each such block becomes `<output_dir>/<name>.js`.

use crate::error::{Result, VendasError};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Counters of one extraction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub created: usize,
    pub replaced: usize,
    pub ignored: usize,
}

impl ExtractStats {
    pub fn total(&self) -> usize {
        self.created + self.replaced + self.ignored
    }
}

/// One named code block: (file name as written, code)
pub type Codeblock = (String, String);

/// Reads fenced code blocks of one language out of a Markdown file
#[derive(Debug, Clone)]
pub struct CodeblockExtractor {
    markdown: PathBuf,
    output_dir: PathBuf,
    lang: String,
}

fn file_name(name: &str) -> String {
    let name = name.trim();
    if name.ends_with(".js") {
        name.to_string()
    } else {
        format!("{}.js", name)
    }
}

/// Block names become plain file names inside the output directory
fn check_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.contains(['/', '\\']) || name.contains("..") || name == ".js" {
        return Err(VendasError::ScriptError(format!(
            "invalid code block name '{}': must be a plain file name",
            name
        )));
    }
    Ok(())
}

impl CodeblockExtractor {
    pub fn new<M: AsRef<Path>, O: AsRef<Path>>(markdown: M, output_dir: O, lang: &str) -> Self {
        CodeblockExtractor {
            markdown: markdown.as_ref().to_path_buf(),
            output_dir: output_dir.as_ref().to_path_buf(),
            lang: lang.to_string(),
        }
    }

    fn pattern(&self) -> Result<Regex> {
        let pattern = format!(r"(?s)```{}\s*//\s*(\S+)\s*\n(.*?)```", regex::escape(&self.lang));
        Regex::new(&pattern)
            .map_err(|e| VendasError::ScriptError(format!("invalid code block pattern: {}", e)))
    }

    /// All named code blocks of the configured language, in document order
    pub fn read_codeblocks(&self) -> Result<Vec<Codeblock>> {
        let content = fs::read_to_string(&self.markdown)?;
        let pattern = self.pattern()?;
        Ok(pattern
            .captures_iter(&content)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect())
    }

    /// Output file names that already exist
    pub fn existing_files(&self, matches: &[Codeblock]) -> BTreeSet<String> {
        matches
            .iter()
            .map(|(name, _)| file_name(name))
            .filter(|file| self.output_dir.join(file).exists())
            .collect()
    }

    /// Write every block to its file; existing files are kept unless `overwrite`
    ///
    /// Nothing is written when any block name is not a plain file name.
    pub fn save_codeblocks(&self, matches: &[Codeblock], overwrite: bool) -> Result<ExtractStats> {
        for (name, _) in matches {
            check_name(name)?;
        }

        let mut stats = ExtractStats::default();

        for (name, code) in matches {
            let file = file_name(name);
            let path = self.output_dir.join(&file);
            let content = format!("// {}\n{}\n", file, code.trim());

            if path.exists() {
                if overwrite {
                    fs::write(&path, content)?;
                    debug!(path = %path.display(), "replaced");
                    stats.replaced += 1;
                } else {
                    debug!(path = %path.display(), "ignored, already exists");
                    stats.ignored += 1;
                }
            } else {
                fs::write(&path, content)?;
                debug!(path = %path.display(), "created");
                stats.created += 1;
            }
        }

        Ok(stats)
    }

    /// Full run: read the Markdown, create the output directory, save the blocks
    pub fn extract(&self, overwrite: bool) -> Result<ExtractStats> {
        let matches = self.read_codeblocks()?;

        if !self.output_dir.exists() {
            fs::create_dir_all(&self.output_dir)?;
            info!(dir = %self.output_dir.display(), "created output directory");
        }

        if matches.is_empty() {
            warn!(markdown = %self.markdown.display(), lang = %self.lang, "no code blocks found");
            return Ok(ExtractStats::default());
        }
        info!(count = matches.len(), "code blocks found");

        let existing = self.existing_files(&matches);
        if !existing.is_empty() && !overwrite {
            info!(count = existing.len(), "existing files will be kept");
        }

        let stats = self.save_codeblocks(&matches, overwrite)?;
        info!(
            created = stats.created,
            replaced = stats.replaced,
            ignored = stats.ignored,
            "extraction finished"
        );
        Ok(stats)
    }
}
