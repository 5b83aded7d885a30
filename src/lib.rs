//! # qmd
//!
//! A local hybrid search engine for Markdown collections.
//!
//! Documents are scanned from configured directories, stored by content
//! hash, chunked and embedded. Queries combine BM25 keyword search and
//! vector search over query variants with weighted Reciprocal Rank Fusion,
//! and the fused shortlist can be blended with a reranker's scores.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Collections │──▶│   Indexer    │──▶│  Store     │
//! │ (Markdown)  │   │ hash + chunk │   │ FTS5 + vec │
//! └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                            │
//!        ┌──────────┐   ┌────────┐   ┌───────▼──────┐
//!        │  rerank  │◀──│  RRF   │◀──│ lexical/vec  │◀── expanded query
//!        └──────────┘   └────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qmd init                      # create database
//! qmd update                    # scan collections
//! qmd embed                     # generate embeddings
//! qmd query "deploy rollback"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection and backend selection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`store`] | Runtime backend dispatch |
//! | [`indexer`] | Incremental indexing, `update` and `cleanup` |
//! | [`embedding`] | Embedding providers |
//! | [`rerank`] | Reranking providers |
//! | [`expansion`] | Query expanders |
//! | [`embed_cmd`] | `embed` command |
//! | [`search`] | `search`, `vsearch` and `query` |
//! | [`cache`] | Response cache for expansion and reranking |
//! | [`get`] | `get`, `ls` and `multi-get` |
//! | [`context`] | Path contexts |
//! | [`collection`] | `collection add/remove/rename` config editing |
//! | [`stats`] | `status` and `collections` |
//!
//! The retrieval algorithms themselves live in the `qmd-core` crate.

pub mod cache;
pub mod collection;
pub mod config;
pub mod context;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod expansion;
pub mod get;
pub mod indexer;
pub mod migrate;
pub mod rerank;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod store;
