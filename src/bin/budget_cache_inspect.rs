//! Budget Cache Inspector
//!
//! Usage: budget-cache-inspect <storage-dir> [key]
//!
//! Reads the persisted blob under <storage-dir> without touching the
//! network or storage, and prints what a client would restore from it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use budget_cache::clock::{Clock, SystemClock};
use budget_cache::persist::{FileStorage, Persister};
use budget_cache::{CacheConfig, CacheResult};

fn run(dir: PathBuf, key: Option<String>) -> CacheResult<()> {
    let mut config = CacheConfig::from_file(dir.join("cache_config.json"))?;
    if let Some(key) = key {
        config.storage_key = key;
    }

    let storage = Arc::new(FileStorage::new(&dir)?);
    let persister = Persister::new(storage, config.storage_key.clone(), config.retention());
    let inspection = persister.inspect(SystemClock.now());
    rolling_logger::info(&format!("inspected {}", dir.display()));

    if let Some(err) = &inspection.error {
        println!("storage: {}", err);
    }
    println!("slots:");
    for (slot, count, fetched) in &inspection.slots {
        println!("  {:<14} {} items, fetched {}", slot.as_str(), count, fetched.to_rfc3339());
    }
    for slot in &inspection.stale_slots {
        println!("  {:<14} past retention", slot.as_str());
    }

    println!("paused mutations: {}", inspection.mutations.len());
    for mutation in &inspection.mutations {
        println!(
            "  {} {} enqueued {} touches {:?}",
            mutation.id,
            mutation.registry_key,
            mutation.enqueued_at.to_rfc3339(),
            mutation.touched()
        );
    }
    for expired in &inspection.expired {
        println!("  {}", expired);
    }
    Ok(())
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(dir) = args.next().map(PathBuf::from) else {
        eprintln!("usage: budget-cache-inspect <storage-dir> [key]");
        return ExitCode::from(2);
    };
    let key = args.next();

    let logger = match rolling_logger::init_logger(dir.join("logs"), "budget-cache-inspect") {
        Ok(logger) => Some(logger),
        Err(e) => {
            eprintln!("logger unavailable: {}", e);
            None
        }
    };

    let result = run(dir, key);
    if let Some(logger) = logger {
        println!("log: {}", logger.current_file().display());
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            rolling_logger::error(&e.to_string());
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
