//! # meshdb HTTP/WebSocket Adapter
//!
//! Thin JSON glue between clients and the store: REST for CRUD, queries,
//! backups and indexes; a WebSocket feed for mutation events. Document
//! reads go through the keyed cache, invalidated from the event bus.

mod server;
mod ws;

pub use server::{create_router, serve, AppState};
