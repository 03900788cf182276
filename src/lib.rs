//! # vault-search
//!
//! Incremental hybrid retrieval over a personal markdown vault.
//!
//! Notes are pulled from a vault content API (or a local directory), hashed,
//! chunked, embedded, and stored in a SQLite vector index. Queries fuse
//! vector similarity, BM25 keyword relevance, and tag overlap into one
//! ranking; the best passages can be packed into a bounded context for an
//! answering model.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌────────────┐
//! │ Vault API / │──▶│ Indexer          │──▶│  SQLite     │
//! │ directory   │   │ hash+chunk+embed │   │ vec+FTS5    │
//! └─────────────┘   └──────────────────┘   └─────┬──────┘
//!                                                │
//!                      ┌─────────────────────────┤
//!                      ▼                         ▼
//!                ┌───────────┐            ┌─────────────┐
//!                │  Hybrid   │──context──▶│  Answering  │
//!                │  search   │            │  model      │
//!                └───────────┘            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`models`] | Core data types |
//! | [`source`] | Vault content sources (HTTP, filesystem) |
//! | [`extract`] | Frontmatter, title, and tag extraction |
//! | [`chunk`] | Heading, fixed-size, and sentence chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`cache`] | LRU + TTL embedding cache |
//! | [`embedder`] | Cached, batched embedding generation |
//! | [`store`] | Vector index trait and backends |
//! | [`state`] | Document hash state store |
//! | [`indexer`] | Incremental indexing cycle |
//! | [`search`] | Hybrid search and rank fusion |
//! | [`llm`] | Answering model client |
//! | [`answer`] | Context assembly and answering |
//! | [`service`] | Service object behind CLI and HTTP |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command runners |
//! | [`stats`] | Index statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod cache;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod search;
pub mod server;
pub mod service;
pub mod source;
pub mod state;
pub mod stats;
pub mod store;
