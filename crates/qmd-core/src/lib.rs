//! # qmd core
//!
//! Runtime-agnostic logic for qmd: data models, chunking, the storage
//! abstraction, lexical and vector adapters, query expansion, reciprocal
//! rank fusion, and reranker blending.
//!
//! This crate has no tokio, sqlx, filesystem or network dependencies.
//! Concrete backends and providers live in the `qmd` application crate
//! and plug in through the [`store::Store`], [`embedding::EmbeddingProvider`],
//! [`rerank::RerankProvider`] and [`expand::QueryExpander`] traits.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod fusion;
pub mod lexical;
pub mod models;
pub mod rerank;
pub mod store;
pub mod vector;

pub use error::{QmdError, Result};
