use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod export;
mod geometry;
mod govunits;
mod http;
#[cfg(test)]
mod memory_store;
mod models;
mod quartile;
mod report;
mod search;
mod session;
mod sso;
mod store;

use crate::config::AppConfig;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "firecares-dist")]
#[command(about = "Fire department DIST scores, rankings and station exports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the department site
    Serve,
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample departments and stations
    Seed,
    /// Import departments from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a department's peer and national quartiles
    Rank {
        #[arg(long)]
        department: i64,
    },
    /// Write a markdown report card for a department
    Report {
        #[arg(long)]
        department: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let pool = db::connect(&config.database_url).await?;

    match cli.command {
        Commands::Serve => {
            let bind_addr = config.bind_addr;
            let store: Arc<dyn Store> = Arc::new(db::PgStore::new(pool));
            let sweep_every = config.session_sweep_interval;
            let state = http::AppState::new(config, store)?;
            session::spawn_sweeper(state.sessions().clone(), sweep_every);
            let listener = tokio::net::TcpListener::bind(bind_addr)
                .await
                .with_context(|| format!("failed to bind {bind_addr}"))?;
            tracing::info!(%bind_addr, "serving");
            axum::serve(listener, http::router(state)).await?;
        }
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let imported = db::import_csv(&pool, &csv).await?;
            println!("Imported {imported} departments from {}.", csv.display());
        }
        Commands::Rank { department } => {
            let store = db::PgStore::new(pool);
            let (department, card) = load_report_card(&store, department).await?;
            println!("{} (DIST {:?})", department.name, department.dist_model_score);
            match card.national_dist_quartile {
                Some(quartile) => println!("National DIST quartile: {quartile}"),
                None => println!("National DIST quartile: not scored"),
            }
            for metric in &card.metrics {
                let peer = metric.peer.as_ref().and_then(|ranking| ranking.quartile);
                let national = metric.national.as_ref().and_then(|ranking| ranking.quartile);
                println!(
                    "- {}: peer quartile {}, national quartile {}",
                    report::metric_label(metric.metric),
                    peer.map_or_else(|| "-".to_string(), |q| q.to_string()),
                    national.map_or_else(|| "-".to_string(), |q| q.to_string())
                );
            }
        }
        Commands::Report { department, out } => {
            let store = db::PgStore::new(pool);
            let (department, card) = load_report_card(&store, department).await?;
            std::fs::write(&out, report::build_report(&department, &card))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn load_report_card(
    store: &dyn Store,
    department_id: i64,
) -> anyhow::Result<(models::Department, quartile::ReportCard)> {
    let department = store
        .department(department_id)
        .await?
        .with_context(|| format!("department {department_id} not found"))?;
    let peers = store
        .departments_in_population_class(department.population_class)
        .await?;
    let all_scored = store.scored_departments().await?;
    let card = quartile::build_report_card(&department, &peers, &all_scored);
    Ok((department, card))
}
