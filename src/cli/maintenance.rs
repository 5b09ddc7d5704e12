//! Offline maintenance: one sweep and payload key rotation, without starting
//! transports.

use anyhow::Result;
use chrono::Utc;

use crate::config::NodeConfig;
use crate::server::open_store;
use crate::trust::TrustLedger;

/// Run one consolidation / decay / eviction pass and relax stale trust.
pub async fn run(config: &NodeConfig) -> Result<()> {
    let (db, store) = open_store(config)?;

    println!("Running maintenance pass...");
    let report = store.run_maintenance().await?;
    println!("  Examined:   {}", report.examined);
    println!("  Promoted:   {}", report.promoted);
    println!("  Demoted:    {}", report.demoted);
    println!("  Decayed:    {}", report.decayed);
    println!("  Purged:     {}", report.purged);
    println!("  Evicted:    {}", report.evicted);
    if report.skipped > 0 {
        println!("  Skipped:    {} (changed during the pass)", report.skipped);
    }

    let ledger = TrustLedger::open(db, config.trust.clone())?;
    let relaxed = ledger.relax_inactive(Utc::now())?;
    println!("  Trust entries relaxed: {relaxed}");

    println!("Maintenance complete.");
    Ok(())
}

/// Re-encrypt every payload under a fresh key.
pub async fn rotate_key(config: &NodeConfig) -> Result<()> {
    let (_db, store) = open_store(config)?;
    println!("Rotating payload key...");
    let key_id = store.rotate_key().await?;
    println!("Active key is now {key_id}");
    Ok(())
}
