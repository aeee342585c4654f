//! Cached timing inspection — `shopfloor status`.

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_status(project_dir: &Path, order: Option<&str>) -> Result<()> {
    use shopfloor::cache::{DurableCache, FileCache};
    use shopfloor::config::ShopfloorConfig;

    let config = ShopfloorConfig::new(project_dir.to_path_buf())?;
    let cache = FileCache::open(&config.cache_dir())?;
    let doc = cache.load()?;

    let json = match order {
        Some(order_id) => {
            let accumulators = doc
                .accumulators(order_id)
                .with_context(|| format!("No cached timing for order {}", order_id))?;
            serde_json::json!({
                "order_id": order_id,
                "accumulators": accumulators,
            })
        }
        None => serde_json::to_value(&doc).context("Failed to serialize cache")?,
    };
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
