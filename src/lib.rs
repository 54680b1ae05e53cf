//! # Semandex
//!
//! A local-first semantic indexing and retrieval engine.
//!
//! Semandex turns a corpus of text content into a searchable vector index:
//! documents are chunked along their structure, embedded through a
//! configurable provider, and stored in SQLite alongside their metadata.
//! Ingestion runs as a phase-ordered, resumable batch pipeline; retrieval
//! is served through a CLI and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │  Content    │──▶│  Pipeline                     │──▶│  SQLite   │
//! │  source     │   │ build→chunk→embed→index→clean │   │ + vectors │
//! └─────────────┘   └──────────────────────────────┘   └────┬─────┘
//!                                                           │
//!                                          ┌────────────────┤
//!                                          ▼                ▼
//!                                     ┌──────────┐    ┌──────────┐
//!                                     │   CLI    │    │   HTTP   │
//!                                     │  (sdx)   │    │  (JSON)  │
//!                                     └──────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sdx init                        # create database
//! sdx index                       # run the ingestion pipeline
//! sdx search "deployment flow"    # semantic search
//! sdx serve                       # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`content`] | Content source abstraction |
//! | [`chunker`] | Structure-aware text chunking |
//! | [`anchor`] | Stable per-chunk citation anchors |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector storage and similarity search |
//! | [`pipeline`] | Phase-ordered batch orchestrator |
//! | [`queue`] | Durable job queue |
//! | [`state`] | Versioned pipeline state store |
//! | [`retrieval`] | Query-time search service |
//! | [`server`] | JSON HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod anchor;
pub mod chunker;
pub mod config;
pub mod content;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod retrieval;
pub mod server;
pub mod state;
pub mod stats;
pub mod token;
