use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use study_stats_api::api::{self, AppState, DailyOutcome};
use study_stats_api::config::{DatabaseArgs, ProvisionConfig};
use study_stats_api::db::{self, PgStore};
use study_stats_api::form::{RawParams, STUDY_ID};
use study_stats_api::schema;

#[derive(Parser)]
#[command(name = "study-stats")]
#[command(about = "Daily summary statistics API for research studies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb {
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Load a demo study with a week of statistics
    Seed {
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Create a study and print its object id
    CreateStudy {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Import daily statistics from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
        /// Object id of the study the rows belong to
        #[arg(long)]
        study: String,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Run a daily statistics query and print the JSON payload
    Query {
        study_id: String,
        /// Query parameter as key=value, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Print the column schema of the daily statistics payload
    Schema,
    /// Load a provisioning config and print it with defaults applied
    CheckProvisionConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Mark every record of a participant deleted
    DeleteParticipant {
        #[arg(long)]
        patient_id: String,
        #[command(flatten)]
        database: DatabaseArgs,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb { database } => {
            let pool = database.connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { database } => {
            let pool = database.connect().await?;
            let study = db::seed(&pool).await?;
            println!("Seed data inserted for study {}.", study.object_id);
        }
        Commands::CreateStudy { name, database } => {
            let pool = database.connect().await?;
            let study = db::create_study(&pool, &name).await?;
            println!("{}", study.object_id);
        }
        Commands::Import {
            csv,
            study,
            database,
        } => {
            let pool = database.connect().await?;
            let written = db::import_csv(&pool, &csv, &study).await?;
            println!("Wrote {written} daily statistics from {}.", csv.display());
        }
        Commands::Serve { bind, database } => {
            let pool = database.connect().await?;
            let state = AppState {
                store: Arc::new(PgStore::new(pool)),
            };
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!(bind_addr = %bind, "study-stats listening");

            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server failed")?;
        }
        Commands::Query {
            study_id,
            params,
            database,
        } => {
            let pool = database.connect().await?;
            let store = PgStore::new(pool);
            let mut raw: RawParams = params.into_iter().collect();
            raw.insert(STUDY_ID, study_id);

            let outcome = api::daily_query(&store, &raw).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let DailyOutcome::Rejected(_) = outcome {
                std::process::exit(2);
            }
        }
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&schema::columns())?);
        }
        Commands::CheckProvisionConfig { config } => {
            let settings = ProvisionConfig::load(&config)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::DeleteParticipant {
            patient_id,
            database,
        } => {
            let pool = database.connect().await?;
            let flipped = db::delete_participant(&pool, &patient_id).await?;
            println!("Marked {flipped} records deleted for {patient_id}.");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
