//! tessera-view: open a list view against a live backend and print it.
//!
//! Usage: `tessera-view --config <path> <entity-type> [limit]`
//! (or set `TESSERA_CONFIG`).

use std::process::ExitCode;

use tessera_core::{EntityType, ListParams, TesseraConfig, TesseraResult};
use tessera_sync::{init_tracing, CacheContext, CacheManager, LabelLookup};
use tracing::{error, info};

const DEFAULT_LIMIT: u32 = 20;

/// Positional arguments, with `--config <path>` skipped.
fn positional_args() -> Vec<String> {
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            args.next();
            continue;
        }
        positional.push(arg);
    }
    positional
}

async fn run(entity_type: EntityType, limit: u32) -> TesseraResult<()> {
    let config = TesseraConfig::load()?;
    let manager = CacheManager::create(CacheContext::from_config(config)?)?;
    let report = manager.hydrate().await?;
    info!(purged_rows = report.purged_rows, drafts = report.drafts, "hydrated");

    let view = manager
        .open_view(&entity_type, &ListParams::page(limit, 0))
        .await?;
    let rows = view.format(&LabelLookup::new());
    let columns: Vec<&str> = view
        .metadata
        .value()
        .visible_fields()
        .map(|(field, _)| field)
        .collect();

    println!("{}", columns.join("\t"));
    for row in &rows {
        let cells: Vec<&str> = columns
            .iter()
            .map(|field| row.display(field).unwrap_or(""))
            .collect();
        println!("{}", cells.join("\t"));
    }
    println!(
        "-- {} of {} {} (source {:?}, stale {})",
        rows.len(),
        view.data.value().total,
        entity_type,
        view.data.source(),
        view.data.is_stale()
    );

    manager.teardown();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("tracing already initialized: {e}");
    }

    let args = positional_args();
    let Some(entity_type) = args.first() else {
        eprintln!("usage: tessera-view --config <path> <entity-type> [limit]");
        return ExitCode::from(2);
    };
    let limit = match args.get(1).map(|s| s.parse::<u32>()) {
        None => DEFAULT_LIMIT,
        Some(Ok(limit)) => limit,
        Some(Err(e)) => {
            eprintln!("invalid limit: {e}");
            return ExitCode::from(2);
        }
    };

    match run(EntityType::new(entity_type.as_str()), limit).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "view failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
