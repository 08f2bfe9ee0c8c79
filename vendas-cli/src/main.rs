mod config;
mod output;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use config::Config;
use output::Format;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vendas_core::{CodeblockExtractor, Database, DistinctProducts, QueryScript};

#[derive(Parser)]
#[command(name = "vendas")]
#[command(about = "Vendas CLI - Run the sales queries over a JSON dump")]
#[command(version)]
struct Cli {
    /// Config file (default: $VENDAS_CONFIG or ./vendas.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every product name that appears in any purchase
    #[command(alias = "produtos-distintos")]
    DistinctProducts {
        /// Dump file or export directory
        #[arg(long)]
        data: Option<PathBuf>,
        /// Sales collection
        #[arg(long)]
        collection: Option<String>,
        /// Order rows by nome_produto
        #[arg(long, overrides_with = "no_sort")]
        sort: bool,
        /// Keep first-seen order even when the config sets `sort = true`
        #[arg(long, overrides_with = "sort")]
        no_sort: bool,
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
    /// Print the console script of the distinct products query
    Script {
        #[arg(long)]
        collection: Option<String>,
        #[arg(long, overrides_with = "no_sort")]
        sort: bool,
        #[arg(long, overrides_with = "sort")]
        no_sort: bool,
    },
    /// Run a `db.<collection>.aggregate([...])` script
    Run {
        /// Script file
        script: PathBuf,
        /// Dump file or export directory
        #[arg(long)]
        data: Option<PathBuf>,
        /// Default: pretty for `.pretty()` scripts, lines otherwise
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
    /// Print the parsed pipeline of a script without running it
    Explain {
        /// Script file
        script: PathBuf,
    },
    /// Extract query scripts from Markdown code blocks
    Extract {
        /// Markdown file to read
        #[arg(long)]
        markdown: Option<PathBuf>,
        /// Directory receiving the scripts
        #[arg(long)]
        out: Option<PathBuf>,
        /// Code block language
        #[arg(long)]
        lang: Option<String>,
        /// Replace scripts that already exist
        #[arg(long)]
        overwrite: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_level, cli.verbose);

    match &source {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => debug!("config file not found, using defaults"),
    }

    match cli.command {
        Commands::DistinctProducts {
            data,
            collection,
            sort,
            no_sort,
            format,
        } => distinct_products(
            data.as_deref().unwrap_or(&config.data_path),
            collection.as_deref().unwrap_or(&config.collection),
            resolve_sort(sort, no_sort, config.sort),
            format.unwrap_or(config.format),
        ),
        Commands::Script {
            collection,
            sort,
            no_sort,
        } => {
            let query = build_query(
                collection.as_deref().unwrap_or(&config.collection),
                resolve_sort(sort, no_sort, config.sort),
            );
            print!("{}", query.script());
            Ok(())
        }
        Commands::Run {
            script,
            data,
            format,
        } => run_script(&script, data.as_deref().unwrap_or(&config.data_path), format),
        Commands::Explain { script } => explain_script(&script),
        Commands::Extract {
            markdown,
            out,
            lang,
            overwrite,
        } => extract_scripts(
            markdown.as_deref().unwrap_or(&config.extract.markdown),
            out.as_deref().unwrap_or(&config.extract.output_dir),
            lang.as_deref().unwrap_or(&config.extract.lang),
            overwrite,
        ),
    }
}

/// RUST_LOG wins; otherwise `-v` flags, then the configured level
fn init_tracing(log_level: &str, verbose: u8) {
    let default_level = match verbose {
        0 => log_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// `--sort` / `--no-sort` win over the configured default
fn resolve_sort(sort: bool, no_sort: bool, configured: bool) -> bool {
    if sort {
        true
    } else if no_sort {
        false
    } else {
        configured
    }
}

/// An explicit `--format` wins; otherwise `.pretty()` asks for indented rows
fn script_format(format: Option<Format>, pretty: bool) -> Format {
    match format {
        Some(format) => format,
        None if pretty => Format::Pretty,
        None => Format::Lines,
    }
}

fn build_query(collection: &str, sort: bool) -> DistinctProducts {
    let query = DistinctProducts::with_collection(collection);
    if sort {
        query.sorted()
    } else {
        query
    }
}

fn open_data(data: &Path) -> Result<Database<vendas_core::DumpStorage>> {
    Database::open_dump(data).with_context(|| format!("Failed to open data: {}", data.display()))
}

fn distinct_products(data: &Path, collection: &str, sort: bool, format: Format) -> Result<()> {
    let db = open_data(data)?;
    let query = build_query(collection, sort);

    let rows = query
        .run(&db)
        .with_context(|| format!("Distinct products query failed on '{}'", collection))?;
    info!(rows = rows.len(), "distinct products");

    print!("{}", output::render(&rows, format)?);
    Ok(())
}

fn load_script(path: &Path) -> Result<QueryScript> {
    QueryScript::from_file(path)
        .with_context(|| format!("Failed to load script: {}", path.display()))
}

fn run_script(path: &Path, data: &Path, format: Option<Format>) -> Result<()> {
    let script = load_script(path)?;
    let format = script_format(format, script.pretty());
    let db = open_data(data)?;

    let rows = db
        .aggregate(script.collection(), script.pipeline())
        .with_context(|| format!("Script failed: {}", path.display()))?;

    print!("{}", output::render(&rows, format)?);
    Ok(())
}

fn explain_script(path: &Path) -> Result<()> {
    let script = load_script(path)?;

    let plan = json!({
        "name": script.name(),
        "collection": script.collection(),
        "pipeline": script.pipeline().to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn extract_scripts(markdown: &Path, out: &Path, lang: &str, overwrite: bool) -> Result<()> {
    let extractor = CodeblockExtractor::new(markdown, out, lang);
    let stats = extractor
        .extract(overwrite)
        .with_context(|| format!("Failed to extract code blocks from {}", markdown.display()))?;

    println!(
        "Created: {}, replaced: {}, ignored: {} (in {})",
        stats.created,
        stats.replaced,
        stats.ignored,
        out.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_alias_and_flags() {
        let cli = Cli::try_parse_from([
            "vendas",
            "-vv",
            "produtos-distintos",
            "--data",
            "dump/",
            "--sort",
            "--format",
            "lines",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::DistinctProducts {
                data,
                collection,
                sort,
                no_sort,
                format,
            } => {
                assert_eq!(data, Some(PathBuf::from("dump/")));
                assert_eq!(collection, None);
                assert!(sort);
                assert!(!no_sort);
                assert_eq!(format, Some(Format::Lines));
            }
            _ => panic!("expected distinct-products"),
        }
    }

    #[test]
    fn test_no_sort_overrides_config() {
        assert!(resolve_sort(false, false, true));
        assert!(!resolve_sort(false, true, true));
        assert!(resolve_sort(true, false, false));
        assert!(!resolve_sort(false, false, false));

        let cli = Cli::try_parse_from(["vendas", "script", "--sort", "--no-sort"]).unwrap();
        match cli.command {
            Commands::Script { sort, no_sort, .. } => {
                assert!(!sort);
                assert!(no_sort);
                assert!(!resolve_sort(sort, no_sort, true));
            }
            _ => panic!("expected script"),
        }
    }

    #[test]
    fn test_script_format_follows_pretty_call() {
        assert_eq!(script_format(None, true), Format::Pretty);
        assert_eq!(script_format(None, false), Format::Lines);
        assert_eq!(script_format(Some(Format::Json), true), Format::Json);
        assert_eq!(script_format(Some(Format::Pretty), false), Format::Pretty);

        let plain = QueryScript::parse("db.vendas.aggregate([{ $limit: 1 }])").unwrap();
        assert_eq!(script_format(None, plain.pretty()), Format::Lines);
        let pretty = QueryScript::parse("db.vendas.aggregate([{ $limit: 1 }]).pretty()").unwrap();
        assert_eq!(script_format(None, pretty.pretty()), Format::Pretty);
    }

    #[test]
    fn test_build_query() {
        assert_eq!(build_query("vendas", false), DistinctProducts::new());
        assert_eq!(build_query("vendas", true), DistinctProducts::new().sorted());
    }
}
