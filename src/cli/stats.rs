use anyhow::Result;

use crate::config::NodeConfig;

/// Display store statistics in the terminal.
pub fn stats(config: &NodeConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path, config.embedding.dimensions)?;

    let response = crate::memory::stats::store_stats(&conn, Some(&db_path))?;

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total records:       {}", response.total_records);
    println!("  Unverified facts:    {}", response.unverified_records);
    println!("  Partitions:          {}", response.partitions);
    println!();

    println!("By Tier:");
    for t in &["ephemeral", "short_term", "long_term", "purged"] {
        let count = response.by_tier.get(*t).copied().unwrap_or(0);
        println!("  {:<12} {}", t, count);
    }
    println!();

    println!("Outbox pending:        {}", response.outbox_pending);
    println!("Database size:         {} bytes", response.db_size_bytes);

    if let Some(ref oldest) = response.oldest_record {
        println!("Oldest record:         {oldest}");
    }
    if let Some(ref newest) = response.newest_record {
        println!("Newest record:         {newest}");
    }

    Ok(())
}
