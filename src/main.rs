use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

use crime_scraper::app::ports::TableStore;
use crime_scraper::common::error::ScraperError;
use crime_scraper::config::PipelineConfig;
use crime_scraper::infra::{self, sqlite_store::SqliteTableStore};
use crime_scraper::logging;
use crime_scraper::pipeline::processing::LoadOutcome;
use crime_scraper::pipeline::{Pipeline, RunOutcome};

#[derive(Parser)]
#[command(name = "crime_scraper")]
#[command(about = "London recorded crime summary scraper and normaliser")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate, download, load and combine every category (default)
    Run,
    /// Print the resource selected for each category without downloading
    Locate,
    /// Load a local CSV file into a category's table
    Load {
        /// Category id, e.g. borough, lsoa, ward
        #[arg(long)]
        category: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Rebuild the combined fact table from the stored raw tables
    Combine,
}

fn exit_code_for(e: &ScraperError) -> i32 {
    if e.is_environment() {
        RunOutcome::HardFailure.exit_code()
    } else {
        RunOutcome::PartialFailure.exit_code()
    }
}

async fn execute(command: Commands, config: Arc<PipelineConfig>) -> anyhow::Result<i32> {
    let sessions = infra::session_factory(&config.renderer).context("creating session factory")?;
    let store: Arc<dyn TableStore> = Arc::new(
        SqliteTableStore::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let pipeline = Pipeline::new(Arc::clone(&config), sessions, store)?;

    let code = match command {
        Commands::Run => {
            println!("🚀 Running crime data pipeline...");
            let report = pipeline.run().await;
            for category in &report.categories {
                println!("   {:<8} {:?}", category.category, category.status);
            }
            if let Some(combine) = &report.combine {
                println!("   combined: {} fact rows", combine.fact_rows);
            }
            if let Some(e) = &report.combine_error {
                println!("   combined: skipped ({e})");
            }
            match report.outcome {
                RunOutcome::Success => println!("✅ Pipeline completed successfully"),
                RunOutcome::PartialFailure => println!("⚠️  Pipeline completed with failures"),
                RunOutcome::HardFailure => println!("❌ Pipeline aborted"),
            }
            report.outcome.exit_code()
        }
        Commands::Locate => match pipeline.locate().await {
            Ok((located, fallback)) => {
                if fallback {
                    warn!("Dataset page unavailable; showing fallback resources");
                }
                println!("{}", serde_json::to_string_pretty(&located)?);
                if located.values().all(Option::is_some) {
                    0
                } else {
                    RunOutcome::PartialFailure.exit_code()
                }
            }
            Err(e) => {
                error!("Locate failed: {}", e);
                exit_code_for(&e)
            }
        },
        Commands::Load { category, file } => match pipeline.load_local(&category, &file).await {
            Ok(LoadOutcome::Loaded { rows, columns }) => {
                println!("✅ Loaded {rows} rows x {columns} columns into '{category}'");
                0
            }
            Ok(LoadOutcome::Empty) => {
                println!("⚠️  {} is empty; nothing loaded", file.display());
                0
            }
            Err(e) => {
                error!("Load failed: {}", e);
                exit_code_for(&e)
            }
        },
        Commands::Combine => match pipeline.combine().await {
            Ok(report) => {
                println!("✅ Wrote {} fact rows", report.fact_rows);
                0
            }
            Err(e) => {
                error!("Combine failed: {}", e);
                exit_code_for(&e)
            }
        },
    };
    Ok(code)
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match PipelineConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(RunOutcome::HardFailure.exit_code());
        }
    };

    let guard = logging::init_logging(&config.log_dir);
    info!("Using database {}", config.database_path.display());

    let code = match execute(cli.command.unwrap_or(Commands::Run), config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            RunOutcome::HardFailure.exit_code()
        }
    };
    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}
