use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use inquire::error::InquireResult;
use tracing_subscriber::{fmt, EnvFilter};

use contextnote::config::Config;
use contextnote::notes::load_notes;
use contextnote::semantic::SemanticService;

mod cli;
use cli::Command;

fn get_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(base_path) = std::env::var("CNOTE_BASE_PATH") {
        return Ok(PathBuf::from(base_path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/contextnote"))
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging(args.verbose);

    let base_path = get_base_path()?;
    tracing::debug!(base_path = %base_path.display(), "loading config");
    let config = Config::load_with(&base_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(args.command, config))
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let service = SemanticService::open(&config.semantic_search, config.base_path());
    service.load().await;

    match command {
        Command::Index { notes } => {
            let notes = load_notes(&notes)?;
            service
                .initialize()
                .await
                .context("failed to load embedding model")?;

            let report = service.process_all(&notes).await;
            service.flush().await;
            print_json(&report)
        }

        Command::Search {
            query,
            notes,
            precomputed,
            threshold,
            max_results,
        } => {
            let notes = load_notes(&notes)?;
            service
                .initialize()
                .await
                .context("failed to load embedding model")?;

            let results = if precomputed {
                service
                    .find_similar_precomputed(&query, &notes, threshold)
                    .await
            } else {
                service.find_similar(&query, &notes, max_results).await
            };

            // on-demand search fills the text cache
            service.flush().await;
            print_json(&results)
        }

        Command::Remove { id } => {
            if !service.has(id) {
                println!("note {id} is not indexed");
                return Ok(());
            }
            service.remove(id);
            service.flush().await;
            println!("removed note {id}");
            Ok(())
        }

        Command::Has { id } => {
            println!("{}", service.has(id));
            Ok(())
        }

        Command::Stats {} => print_json(&service.get_cache_stats()),

        Command::Clear { yes } => {
            if !yes {
                let stats = service.get_cache_stats();
                match inquire::prompt_confirmation(format!(
                    "Are you sure you want to delete {} cached embeddings and {} note embeddings?",
                    stats.cache_size, stats.indexed_note_count
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            service.clear_cache().await;
            println!("cleared");
            Ok(())
        }
    }
}
