//! Host-supplied inputs: broker tokens and the server directory, both read
//! from JSON files.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use aoc_sync::{AutomationServer, TokenData};

pub fn load_tokens(path: &Path) -> Result<Vec<TokenData>> {
    load_json(path)
}

pub fn load_servers(path: &Path) -> Result<Vec<AutomationServer>> {
    load_json(path)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
