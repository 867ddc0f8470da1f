use std::sync::Arc;

use clap::Parser;
use warden_core::engine::CheckCache;
use warden_core::schema::{compile, render_schema};
use warden_service::cli::{Cli, Command};
use warden_service::config::AppConfig;
use warden_service::demo::run_demo;
use warden_service::logging::init_logging;
use warden_service::service::AuthzService;
use warden_storage::InMemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config.log)?;

    match cli.command {
        Command::ValidateSchema { path } => {
            let text = std::fs::read_to_string(&path)?;
            let compiled = compile(&text)?;
            print!("{}", render_schema(compiled.schema()));
        }
        Command::Demo => {
            let mut service = AuthzService::new(
                Arc::new(InMemoryStore::new()),
                config.to_engine_config(),
                config.to_schema_limits(),
            );
            if let Some(cache) = config.to_cache_config() {
                service = service.with_cache(CheckCache::new(&cache));
            }

            let report = run_demo(&service).await?;
            for (id, permissionship) in &report.checks {
                println!("check thing:{id}#read: {permissionship:?}");
            }
            for (i, id) in report.found.iter().enumerate() {
                println!("{i}\t{id}");
            }
            tracing::info!(found = report.found.len(), "demo finished");
        }
    }

    Ok(())
}
