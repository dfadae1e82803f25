//! # kb-sync
//!
//! Scans a dated document tree, groups files into remote knowledge bases and
//! uploads them over an encrypted, date-keyed envelope protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  scan dir    │──▶│ Orchestrator │──▶│ SignedClient │──▶ remote
//! │ <yyyy>/<mm>/ │   │ FolderBatch  │   │  (envelope)  │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │
//!          ┌────────────────┼────────────────┐
//!          ▼                ▼                ▼
//!     ┌─────────┐     ┌──────────┐     ┌──────────┐
//!     │ cache   │     │ resolver │     │ ledger   │
//!     │ markers │     │ (SQLite) │     │ (SQLite) │
//!     └─────────┘     └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbsync init                   # create database
//! kbsync token                  # check credentials
//! kbsync scan                   # one pass
//! kbsync serve                  # admin API + periodic passes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`envelope`] | Date-keyed SM4 payload cipher |
//! | [`client`] | Signed HTTP client and the [`client::KnowledgeApi`] seam |
//! | [`cache`] | Folder "already processed" markers |
//! | [`resolver`] | Group name → knowledge-base id |
//! | [`ledger`] | Upload records for per-file dedup |
//! | [`grouping`] | Period/region group names and slot naming |
//! | [`orchestrator`] | The scan pass and backup retention |
//! | [`merge`] | Folder → single text document |
//! | [`scheduler`] | Non-overlapping periodic passes |
//! | [`server`] | Admin HTTP API |
//! | [`commands`] | CLI command bodies |
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Persisted row types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod envelope;
pub mod grouping;
pub mod ledger;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod server;
