//! Folio Sources CLI
//!
//! Thin command-line front end over the source runtime: install, list, and
//! remove sources, and exercise their catalog operations.

use anyhow::Result;
use clap::{Parser, Subcommand};
use folio_sources::core::config::{CliArgs, Config};
use folio_sources::core::Logger;
use folio_sources::source::{Listing, Paginator, SearchRequest, SourceRegistry};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "folio-sources", version, about = "Book catalog source runtime")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List installed sources and their status
    List,
    /// Install a source from a package directory
    Install {
        /// Directory containing source.json and the entry script
        package: PathBuf,
    },
    /// Remove an installed source
    Remove { source_id: String },
    /// Search a source's catalog
    Search {
        source_id: String,
        query: String,
        /// How many pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Fetch full details for one book
    Details { source_id: String, book_id: String },
    /// Show the search filters a source exposes
    Filters { source_id: String },
    /// Resolve download info for one book
    Download { source_id: String, book_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Print to stderr since logging isn't initialized yet
    let config = match Config::load(&cli.args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = Logger::init(&config.logging)?;
    info!("Starting Folio Sources v{}", folio_sources::VERSION);
    info!(sources_dir = ?config.sources.sources_dir, "Sources configuration");

    let registry = SourceRegistry::new(config.sources);
    registry.discover().await?;

    match cli.command {
        Command::List => {
            let statuses = registry.list().await;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Command::Install { package } => {
            let manifest = registry.install_source(&package).await?;
            println!("Installed {} v{}", manifest.source_id, manifest.version);
        }
        Command::Remove { source_id } => {
            registry.remove_source(&source_id).await?;
            println!("Removed {}", source_id);
        }
        Command::Search {
            source_id,
            query,
            pages,
        } => {
            let listing = Listing::Search(SearchRequest::new(query));
            let mut pager = Paginator::new(&registry, source_id, listing);
            for _ in 0..pages {
                let page = pager.next_page().await?;
                println!("{}", serde_json::to_string_pretty(&page.items)?);
                if pager.exhausted() {
                    break;
                }
            }
        }
        Command::Details { source_id, book_id } => {
            let details = registry.get_book_details(&source_id, &book_id).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Command::Filters { source_id } => {
            let filters = registry.get_search_filters(&source_id).await?;
            println!("{}", serde_json::to_string_pretty(&filters)?);
        }
        Command::Download { source_id, book_id } => {
            let info = registry.get_download_info(&source_id, &book_id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
