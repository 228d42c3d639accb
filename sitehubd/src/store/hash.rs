use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::InventoryItem;

/// Only the fields that describe what is installed. `active` flips on a
/// plugin toggle, which the activity log records separately.
#[derive(Serialize)]
struct ItemView<'a> {
    slug: &'a str,
    version: &'a str,
    update_available: Option<&'a str>,
}

#[derive(Serialize)]
struct InventoryView<'a> {
    plugins: Vec<ItemView<'a>>,
    themes: Vec<ItemView<'a>>,
}

fn sorted_views(items: &[InventoryItem]) -> Vec<ItemView<'_>> {
    let mut indices: Vec<usize> = (0..items.len()).collect();
    indices.sort_by(|&a, &b| items[a].slug.cmp(&items[b].slug));

    indices
        .iter()
        .map(|&i| ItemView {
            slug: &items[i].slug,
            version: &items[i].version,
            update_available: items[i].update_available.as_deref(),
        })
        .collect()
}

/// SHA-256 over a client's inventory, independent of the order the agent
/// listed items in.
pub fn inventory_digest(plugins: &[InventoryItem], themes: &[InventoryItem]) -> Result<String> {
    let view = InventoryView {
        plugins: sorted_views(plugins),
        themes: sorted_views(themes),
    };

    let json = serde_json::to_vec(&view).context("Failed to serialize inventory for hashing")?;
    Ok(hex::encode(Sha256::digest(&json)))
}
