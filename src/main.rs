use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};

mod aggregate;
mod dashboard;
mod db;
mod error;
#[cfg(test)]
mod memory;
mod models;
mod normalize;
mod period;
mod report;
mod risk;
mod server;

use crate::db::{LoanStore, PgLoanStore};
use crate::models::DashboardOutcome;
use crate::period::{AggregationFilter, PeriodStamp};
use crate::risk::Scorecard;

#[derive(Parser)]
#[command(name = "loan-risk-dashboard")]
#[command(about = "Loan default risk scoring and portfolio dashboard", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    max_connections: u32,

    /// Scorecard JSON exported from the training notebook
    #[arg(long, env = "MODEL_PATH", global = true)]
    model_path: Option<PathBuf>,

    /// Accuracy figure reported alongside dashboard metrics
    #[arg(long, env = "MODEL_ACCURACY", default_value_t = dashboard::DEFAULT_MODEL_ACCURACY, global = true)]
    model_accuracy: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PeriodArgs {
    /// Month name or number (1-12)
    #[arg(long)]
    month: Option<String>,
    #[arg(long)]
    year: Option<i32>,
}

impl PeriodArgs {
    fn filter(&self) -> AggregationFilter {
        AggregationFilter::new(self.month.as_deref(), self.year)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import loan applications from a CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score one loan application without storing it
    Predict {
        /// JSON file with loan fields, or - for stdin
        #[arg(long)]
        json: PathBuf,
    },
    /// Normalize, score and store one loan application
    Submit {
        /// JSON file with loan fields, or - for stdin
        #[arg(long)]
        json: PathBuf,
    },
    /// List stored loans
    List {
        #[command(flatten)]
        period: PeriodArgs,
        /// Only loans with this prediction flag (0 or 1)
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..=1))]
        prediction: Option<i32>,
    },
    /// Delete a stored loan
    Delete {
        #[arg(long)]
        id: i64,
    },
    /// Print dashboard statistics as JSON
    Dashboard {
        #[command(flatten)]
        period: PeriodArgs,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        period: PeriodArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Serve the dashboard API over HTTP
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8000")]
        bind: String,
    },
}

impl Cli {
    async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }

    fn classifier(&self) -> anyhow::Result<Scorecard> {
        match &self.model_path {
            Some(path) => {
                let scorecard = Scorecard::from_path(path)
                    .with_context(|| format!("failed to load model from {}", path.display()))?;
                tracing::info!(path = %path.display(), "loaded scorecard");
                Ok(scorecard)
            }
            None => {
                tracing::info!("MODEL_PATH not set, using the built-in scorecard");
                Ok(Scorecard::default())
            }
        }
    }
}

fn read_object(path: &Path) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let contents = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    };

    let value: serde_json::Value =
        serde_json::from_str(&contents).context("loan input is not valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("loan input must be a JSON object of loan fields"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::InitDb => {
            let pool = cli.connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let store = PgLoanStore::new(cli.connect().await?);
            let inserted = db::seed(&store, &cli.classifier()?, &PeriodStamp::today()).await?;
            println!("Inserted {inserted} seed loans.");
        }
        Commands::Import { csv } => {
            let store = PgLoanStore::new(cli.connect().await?);
            let inserted =
                db::import_csv(&store, &cli.classifier()?, csv, &PeriodStamp::today()).await?;
            println!("Inserted {inserted} loans from {}.", csv.display());
        }
        Commands::Predict { json } => {
            let raw = read_object(json)?;
            let loan = normalize::normalize(&raw, &PeriodStamp::today());
            let outcome = risk::predict(&cli.classifier()?, &loan);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Submit { json } => {
            let raw = read_object(json)?;
            let store = PgLoanStore::new(cli.connect().await?);
            let record =
                db::submit_loan(&store, &cli.classifier()?, &raw, &PeriodStamp::today()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { period, prediction } => {
            let store = PgLoanStore::new(cli.connect().await?);
            let loans = store.fetch_loans(&period.filter(), *prediction).await?;

            if loans.is_empty() {
                println!("No loans found for {}.", period.filter().label());
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&loans)?);
        }
        Commands::Delete { id } => {
            let store = PgLoanStore::new(cli.connect().await?);
            if store.delete_loan(*id).await? {
                println!("Deleted loan {id}.");
            } else {
                anyhow::bail!("no loan with id {id}");
            }
        }
        Commands::Dashboard { period } => {
            let store = PgLoanStore::new(cli.connect().await?);
            let outcome =
                dashboard::load_dashboard(&store, &period.filter(), cli.model_accuracy).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Report { period, out } => {
            let store = PgLoanStore::new(cli.connect().await?);
            let filter = period.filter();
            let payload =
                match dashboard::load_dashboard(&store, &filter, cli.model_accuracy).await {
                    DashboardOutcome::Ready(payload) => payload,
                    DashboardOutcome::Failed(body) => {
                        anyhow::bail!("{}: {}", body.error, body.details)
                    }
                };
            let report = report::build_report(&filter, &payload);
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve { bind } => {
            let store = PgLoanStore::new(cli.connect().await?);
            let state = server::AppState {
                store: Arc::new(store),
                classifier: Arc::new(cli.classifier()?),
                model_accuracy: cli.model_accuracy,
            };
            server::serve(state, bind).await?;
        }
    }

    Ok(())
}
