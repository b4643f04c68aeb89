//! # meshdb Core
//!
//! This crate provides the fundamental building blocks for meshdb:
//! - The document entity and its invariants
//! - Error types shared across the workspace
//! - Configuration loading
//! - JSON value utilities (path lookup, ordering, sizing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   meshdb-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • document   - The replicated entity           │
//! │  • value      - Nested JSON helpers             │
//! │  • error      - Error handling                  │
//! │  • config     - YAML configuration              │
//! │  • metrics    - Node-wide counters              │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod value;

// Re-export commonly used types
pub use config::Config;
pub use document::{Document, Operation};
pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
