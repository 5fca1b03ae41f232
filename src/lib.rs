//! # Memory Bank Bridge
//!
//! A persistent side-process that gives a host application three
//! capabilities over "memory banks": build one from heterogeneous sources,
//! search one semantically, and append content to one without risking
//! corruption.
//!
//! The host spawns the process once, waits for the ready line on stdout,
//! then exchanges one JSON object per line in each direction.
//!
//! ## Architecture
//!
//! ```text
//! stdin ──▶ dispatch ──▶ bridge ──┬─▶ builder ──▶ sources
//!                                 ├─▶ cache (retrievers per artifact)
//!                                 └─▶ updater ──▶ transaction
//!                         loader ─┘ (backend loaded on first use)
//! stdout ◀── one response line per request
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Wire types: requests, responses, params, results |
//! | [`dispatch`] | The stdio request loop |
//! | [`bridge`] | Process state and one handler per method |
//! | [`loader`] | One-time, thread-safe backend initialization |
//! | [`sources`] | Source descriptors and text extraction |
//! | [`builder`] | Sources to artifact files |
//! | [`cache`] | Reusable retrievers keyed by artifact |
//! | [`updater`] | Append content to an existing artifact |
//! | [`transaction`] | Backup, rollback and crash recovery |
//! | [`artifact`] | Artifact path rules and per-artifact locks |
//! | [`embedding`] | Embedding provider construction |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error kinds reported to the host |
//! | [`logging`] | `tracing` subscriber setup |

pub mod artifact;
pub mod bridge;
pub mod builder;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod error;
pub mod loader;
pub mod logging;
pub mod protocol;
pub mod sources;
pub mod transaction;
pub mod updater;
