//! # Scriptoria
//!
//! Watches storage folders for scanned PDFs and pushes each one through an
//! ordered chain of transformation stages: staging, OCR, text cleanup and
//! bundling into a notes vault.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────────────────────┐   ┌──────────┐
//! │  Watcher    │──▶│ Pipeline: staging → ocr → cleanup → bundle│──▶│  Vault   │
//! │ local/Drive │   └───────────────┬──────────────────────────┘   │ notes +  │
//! └──────┬──────┘                   │ admission + status           │ attach.  │
//!        │ webhook                  ▼                              └──────────┘
//!  ┌─────┴─────┐              ┌──────────┐
//!  │ HTTP      │              │  SQLite  │
//!  │ (axum)    │              └──────────┘
//!  └───────────┘
//! ```
//!
//! A document is admitted once per `(source store, source id)`; re-discovery
//! is a no-op. Stage failures stay with their document unless they recur
//! often enough to trip the failure supervisor, which stops the pipeline.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Distinguishable pipeline errors |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Admission records and watch-channel persistence |
//! | [`supervisor`] | Cancellation scope and failure-rate supervision |
//! | [`stage`] | Stage trait and the runner around it |
//! | [`pipeline`] | Pipeline builder and coordinator |
//! | [`stage_staging`], [`stage_ocr`], [`stage_cleanup`], [`stage_bundle`] | Built-in stages |
//! | [`watcher`] | Watcher trait and backend selection |
//! | [`watcher_local`] | Polling watcher over local folders |
//! | [`watcher_drive`] | Google Drive push watcher |
//! | [`watch_channels`] | Drive watch-channel lifecycle |
//! | [`google_drive`] | Drive REST client |
//! | [`server`] | Service runner and HTTP routes |
//! | [`status`] | `status` / `channels` commands |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod db;
pub mod error;
pub mod google_drive;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod stage;
pub mod stage_bundle;
pub mod stage_cleanup;
pub mod stage_ocr;
pub mod stage_staging;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod watch_channels;
pub mod watcher;
pub mod watcher_drive;
pub mod watcher_local;
