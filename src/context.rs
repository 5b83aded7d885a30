//! Path contexts: short descriptions attached to a collection or a folder.
//!
//! A context on `notes` covers the whole collection; one on `notes/ops`
//! covers everything under `ops/`. Search results and `get` show the most
//! specific context that covers a document.

use anyhow::{bail, Result};

use qmd_core::models::PathContext;
use qmd_core::store::Store;
use qmd_core::QmdError;

use crate::config::Config;
use crate::db;

/// Split `collection[/path]` (optionally `qmd://`-prefixed). The path part is
/// empty for a collection-wide context.
pub fn parse_context_target(target: &str) -> Result<(&str, &str)> {
    let target = target.trim();
    let target = target.strip_prefix("qmd://").unwrap_or(target);
    let target = target.trim_end_matches('/');
    let (collection, path) = target.split_once('/').unwrap_or((target, ""));
    if collection.is_empty() {
        bail!("expected <collection>[/<path>], got '{}'", target);
    }
    Ok((collection, path.trim_matches('/')))
}

pub async fn add_context<S: Store + ?Sized>(
    store: &S,
    config: &Config,
    target: &str,
    description: &str,
) -> Result<PathContext> {
    let (collection, path) = parse_context_target(target)?;
    if config.collection(collection).is_none() {
        bail!("unknown collection: '{}'", collection);
    }
    let description = description.trim();
    if description.is_empty() {
        return Err(QmdError::InvalidInput("context description must not be empty".into()).into());
    }

    let context = PathContext {
        collection: collection.to_string(),
        path: path.to_string(),
        description: description.to_string(),
        updated_at: chrono::Utc::now().timestamp(),
    };
    store.set_path_context(&context).await?;
    Ok(context)
}

pub async fn remove_context<S: Store + ?Sized>(store: &S, target: &str) -> Result<()> {
    let (collection, path) = parse_context_target(target)?;
    if !store.remove_path_context(collection, path).await? {
        return Err(QmdError::NotFound(format!("context for {}", display_target(collection, path))).into());
    }
    Ok(())
}

fn display_target(collection: &str, path: &str) -> String {
    if path.is_empty() {
        format!("qmd://{collection}/")
    } else {
        format!("qmd://{collection}/{path}")
    }
}

pub async fn run_context_add(config: &Config, target: &str, description: &str, json: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    let context = add_context(&store, config, target, description).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&context)?);
        return Ok(());
    }
    println!(
        "context set for {}: {}",
        display_target(&context.collection, &context.path),
        context.description
    );
    Ok(())
}

pub async fn run_context_list(config: &Config, collection: Option<&str>, json: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    let contexts = store.list_path_contexts(collection).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&contexts)?);
        return Ok(());
    }
    if contexts.is_empty() {
        println!("No contexts.");
        return Ok(());
    }
    for c in &contexts {
        println!("{:<32} {}", display_target(&c.collection, &c.path), c.description);
    }
    Ok(())
}

pub async fn run_context_rm(config: &Config, target: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    remove_context(&store, target).await?;
    println!("context removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmd_core::store::memory::InMemoryStore;

    use crate::config::parse_config;

    fn config() -> Config {
        parse_config(
            r#"
[storage]
backend = "memory"

[[collections]]
name = "notes"
path = "./notes"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_context_target() {
        assert_eq!(parse_context_target("notes").unwrap(), ("notes", ""));
        assert_eq!(parse_context_target("qmd://notes/").unwrap(), ("notes", ""));
        assert_eq!(parse_context_target("notes/ops/").unwrap(), ("notes", "ops"));
        assert!(parse_context_target("").is_err());
    }

    #[tokio::test]
    async fn test_add_replaces_existing_description() {
        let store = InMemoryStore::new();
        add_context(&store, &config(), "notes/ops", "runbooks").await.unwrap();
        add_context(&store, &config(), "notes/ops/", "deploy runbooks").await.unwrap();

        let contexts = store.list_path_contexts(Some("notes")).await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].path, "ops");
        assert_eq!(contexts[0].description, "deploy runbooks");
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_collection_and_empty_text() {
        let store = InMemoryStore::new();
        let err = add_context(&store, &config(), "work", "tasks").await.unwrap_err();
        assert!(err.to_string().contains("unknown collection"));
        assert!(add_context(&store, &config(), "notes", "  ").await.is_err());
        assert!(store.list_path_contexts(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_context_is_not_found() {
        let store = InMemoryStore::new();
        add_context(&store, &config(), "notes", "all notes").await.unwrap();
        remove_context(&store, "notes").await.unwrap();

        let err = remove_context(&store, "notes").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QmdError>(),
            Some(QmdError::NotFound(_))
        ));
    }
}
