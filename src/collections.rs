//! `forge collections`: list or drop named collections.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::{drop_collection, list_collections};

pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let collections = list_collections(&pool).await?;

    if collections.is_empty() {
        println!("No collections.");
    } else {
        println!("{:<24} {:>10} {:>10}", "COLLECTION", "DOCUMENTS", "CHUNKS");
        for c in &collections {
            let marker = if c.name == config.db.collection { "*" } else { " " };
            println!(
                "{:<24} {:>10} {:>10}",
                format!("{}{}", c.name, marker),
                c.documents,
                c.chunks
            );
        }
    }

    pool.close().await;
    Ok(())
}

pub async fn run_drop(config: &Config, name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let removed = drop_collection(&pool, name).await?;
    println!("Dropped collection '{}' ({} chunks removed).", name, removed);
    pool.close().await;
    Ok(())
}
