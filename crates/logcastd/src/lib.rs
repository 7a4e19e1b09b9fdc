//! logcast daemon - file tail and WebSocket broadcast server
//!
//! This crate provides the runtime half of logcast:
//! - `detector` - change signals, by polling or by OS notifications
//! - `tail` - the per-file loop that scans, broadcasts and commits offsets
//! - `broadcast` - joined fan-out of one line to all subscribers
//! - `registry` - the concurrency-safe subscriber set
//! - `server` - the WebSocket transport that adds and removes subscribers
//! - `config` - layered daemon configuration
//! - `stats` - pipeline counters and periodic resource logging
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐ signals ┌────────────────┐ lines ┌─────────────┐
//! │ ChangeDetector │────────▶│   TailCycle    │──────▶│ Broadcaster │
//! │ (poll | event) │         │ (MonitoredFile)│       └──────┬──────┘
//! └────────────────┘         └────────────────┘              │ snapshot
//!                                                            ▼
//! ┌────────────────┐       add / remove        ┌────────────────────┐
//! │  DaemonServer  │──────────────────────────▶│ SubscriberRegistry │
//! │  (WebSocket)   │                           └────────────────────┘
//! └────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod config;
pub mod detector;
pub mod registry;
pub mod server;
pub mod stats;
pub mod tail;
