use anyhow::Context;
use clap::{Parser, Subcommand};
use rx_ledger::bins::Granularity;
use rx_ledger::config::Config;
use rx_ledger::db::Database;
use rx_ledger::import::{self, DEFAULT_IMPORT_LIMIT};
use rx_ledger::server::{self, AppState};
use rx_ledger::storage::StatsWindow;
use rx_ledger::{logging, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Instrument};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rx_ledger")]
#[command(about = "Drug inventory and prescription ledger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Insert the default drug categories into an empty catalog
    SeedCategories,
    /// Import drugs from a JSON file
    ImportDrugs {
        #[arg(long)]
        file: PathBuf,
        /// Maximum number of records to import
        #[arg(long, default_value_t = DEFAULT_IMPORT_LIMIT)]
        limit: usize,
    },
    /// Print prescription statistics as JSON
    Stats {
        #[arg(long)]
        workspace: Uuid,
        /// Single pharmacy; all pharmacies of the workspace when omitted
        #[arg(long)]
        pharmacy: Option<Uuid>,
        /// Bucket size: DAYS, MONTHS or YEARS
        #[arg(long = "type", default_value = "DAYS")]
        kind: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::load().context("loading configuration")?;
    let _guard = logging::init_logging(&config.logging);
    metrics::init_metrics(&config.metrics);

    let cli = Cli::parse();
    let db = Database::open(&config.database).context("opening database")?;

    match cli.command {
        Commands::Serve { port } => {
            let mut server_config = config.server.clone();
            if let Some(port) = port {
                server_config.port = port;
            }
            let state = AppState {
                db: Arc::new(db),
                stats: config.stats,
            };
            let span = tracing::info_span!("serve", port = server_config.port);
            server::start_server(state, &server_config).instrument(span).await?;
        }
        Commands::Migrate => {
            db.migrate()?;
            info!("Schema is up to date at {}", config.database.path.display());
        }
        Commands::SeedCategories => {
            let inserted = import::seed_categories(&db)?;
            println!("{}", serde_json::json!({ "inserted": inserted }));
        }
        Commands::ImportDrugs { file, limit } => {
            let records = import::read_drug_records(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let summary = import::import_drugs(&db, &records, limit, &mut rand::thread_rng())?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Stats {
            workspace,
            pharmacy,
            kind,
        } => {
            let granularity: Granularity = kind.parse()?;
            let scope = config.stats.range_scope;
            let output = match pharmacy {
                Some(pharmacy) => serde_json::to_string_pretty(&db.pharmacy_statistics(
                    workspace,
                    pharmacy,
                    granularity,
                    StatsWindow::default(),
                    scope,
                )?)?,
                None => serde_json::to_string_pretty(&db.pharmacies_statistics(
                    workspace,
                    granularity,
                    StatsWindow::default(),
                    scope,
                )?)?,
            };
            println!("{output}");
        }
    }

    Ok(())
}
