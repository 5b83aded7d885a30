//! `qmd collection add|remove|rename`: edit the `[[collections]]` entries of
//! the config file.
//!
//! The file is edited as a generic TOML table so unrelated settings survive,
//! then re-parsed with [`parse_config`] before anything is written. `remove`
//! drops the collection's documents and contexts from the index, and
//! `rename` moves them to the new name, before the file changes.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use toml::Value;

use crate::config::{parse_config, Config};
use crate::db;
use crate::indexer::Indexer;

#[derive(Debug, Clone, Serialize)]
pub struct CollectionChange {
    pub action: &'static str,
    pub name: String,
    /// Index rows moved or dropped.
    pub documents: usize,
}

fn load_toml_table(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    if !value.is_table() {
        bail!("{} must contain a top-level TOML table", path.display());
    }
    Ok(value)
}

fn write_toml_table(path: &Path, value: &Value) -> Result<()> {
    let serialized = toml::to_string_pretty(value)?;
    std::fs::write(path, serialized).with_context(|| format!("Failed to write {}", path.display()))
}

/// Parse the edited table the way `load_config` would.
fn check(root: &Value) -> Result<Config> {
    parse_config(&toml::to_string_pretty(root)?).context("edited config is invalid")
}

fn collections_mut(root: &mut Value) -> Result<&mut Vec<Value>> {
    let Some(table) = root.as_table_mut() else {
        bail!("config must be a TOML table");
    };
    table
        .entry("collections")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .context("`collections` must be an array of tables")
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("collection name must not be empty");
    }
    if name.contains('/') {
        bail!("collection name '{}' must not contain '/'", name);
    }
    Ok(())
}

pub fn add_entry(root: &mut Value, name: &str, path: &Path, include_globs: &[String]) -> Result<()> {
    check_name(name)?;
    let collections = collections_mut(root)?;
    if collections.iter().any(|c| entry_name(c) == Some(name)) {
        bail!("collection '{}' already exists", name);
    }

    let mut entry = toml::map::Map::new();
    entry.insert("name".into(), Value::String(name.to_string()));
    entry.insert("path".into(), Value::String(path.display().to_string()));
    if !include_globs.is_empty() {
        let globs = include_globs.iter().cloned().map(Value::String).collect();
        entry.insert("include_globs".into(), Value::Array(globs));
    }
    collections.push(Value::Table(entry));
    Ok(())
}

pub fn remove_entry(root: &mut Value, name: &str) -> Result<()> {
    let collections = collections_mut(root)?;
    let Some(idx) = collections.iter().position(|c| entry_name(c) == Some(name)) else {
        bail!("unknown collection: '{}'", name);
    };
    collections.remove(idx);
    Ok(())
}

pub fn rename_entry(root: &mut Value, from: &str, to: &str) -> Result<()> {
    check_name(to)?;
    let collections = collections_mut(root)?;
    if collections.iter().any(|c| entry_name(c) == Some(to)) {
        bail!("collection '{}' already exists", to);
    }
    let Some(entry) = collections
        .iter_mut()
        .find(|c| entry_name(c) == Some(from))
        .and_then(Value::as_table_mut)
    else {
        bail!("unknown collection: '{}'", from);
    };
    entry.insert("name".into(), Value::String(to.to_string()));
    Ok(())
}

fn print_change(change: &CollectionChange, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(change)?);
    } else {
        println!(
            "collection '{}' {} ({} document{})",
            change.name,
            change.action,
            change.documents,
            if change.documents == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

pub fn run_collection_add(
    config_path: &Path,
    name: Option<String>,
    path: &Path,
    include_globs: &[String],
    json: bool,
) -> Result<()> {
    if path.exists() && !path.is_dir() {
        bail!("{} exists but is not a directory", path.display());
    }
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("cannot derive a collection name from the path; pass --name")?,
    };

    let mut root = load_toml_table(config_path)?;
    add_entry(&mut root, &name, path, include_globs)?;
    check(&root)?;
    write_toml_table(config_path, &root)?;

    print_change(
        &CollectionChange {
            action: "added",
            name: name.clone(),
            documents: 0,
        },
        json,
    )?;
    if !json {
        println!("  run `qmd update -c {}` to index it", name);
    }
    Ok(())
}

pub async fn run_collection_remove(config_path: &Path, config: &Config, name: &str, json: bool) -> Result<()> {
    let mut root = load_toml_table(config_path)?;
    remove_entry(&mut root, name)?;
    check(&root)?;

    let store = Arc::new(db::open_store(config).await?);
    let indexer = Indexer::new(store, config.chunking.params()?);
    let documents = indexer.drop_collection(name).await?;
    write_toml_table(config_path, &root)?;

    print_change(
        &CollectionChange {
            action: "removed",
            name: name.to_string(),
            documents,
        },
        json,
    )
}

pub async fn run_collection_rename(
    config_path: &Path,
    config: &Config,
    from: &str,
    to: &str,
    json: bool,
) -> Result<()> {
    let mut root = load_toml_table(config_path)?;
    rename_entry(&mut root, from, to)?;
    check(&root)?;

    let store = Arc::new(db::open_store(config).await?);
    let indexer = Indexer::new(store, config.chunking.params()?);
    let documents = indexer.rename_collection(from, to).await?;
    write_toml_table(config_path, &root)?;

    print_change(
        &CollectionChange {
            action: "renamed",
            name: format!("{from} -> {to}"),
            documents,
        },
        json,
    )
}
