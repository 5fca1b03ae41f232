//! # membank-core
//!
//! Runtime-free building blocks shared by the memory-bank bridge: data
//! models, the paragraph chunker, the [`Embedder`](embedding::Embedder)
//! trait, the indexing capabilities the bridge consumes
//! ([`Encoder`](engine::Encoder), [`QueryEngine`](engine::QueryEngine),
//! [`Retriever`](engine::Retriever)), and [`LocalEngine`](engine::local::LocalEngine),
//! the reference engine that persists artifacts as plain files.
//!
//! This crate has no async runtime, network, or logging dependencies.

pub mod chunk;
pub mod embedding;
pub mod engine;
pub mod models;
