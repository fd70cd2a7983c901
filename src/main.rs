pub mod config;
pub mod data;
pub mod filters;
pub mod query;
pub mod server;
pub mod session;
pub mod types;

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the monitoring dashboard
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and normalize the SE catalog, print a per-region summary
    Inspect {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { config } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let areas = data::load_enumeration_areas(&app_config.input.se_geojson).await?;
            server::start_server(app_config, areas).await?;
        }
        Commands::Inspect { config } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            let areas = data::load_enumeration_areas(&app_config.input.se_geojson).await?;

            let mut by_region: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
            for area in &areas {
                let entry = by_region.entry(area.region.as_str()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += u64::from(area.pop_se);
            }

            println!("{:<20} {:>8} {:>12}", "Region", "SE", "Population");
            for (region, (count, population)) in &by_region {
                let label = if region.is_empty() { "(none)" } else { region };
                println!("{:<20} {:>8} {:>12}", label, count, population);
            }
            println!("{:<20} {:>8}", "Total", areas.len());
            info!(regions = by_region.len(), areas = areas.len(), "inspect done");
        }
    }

    Ok(())
}
