//! HTTP and WebSocket gateway for the Weft orchestration engine.
//!
//! Exposes workflow submission, run status, audit logs, the kanban task board
//! and the resource lock manager over a JSON API, plus live event streams
//! per run or team.
//!
//! # Main types
//!
//! - [`GatewayServer`] — Builds the axum router.
//! - [`AppState`] — Shared handles to the orchestrator subsystems.
//! - [`AuthConfig`] — API-key authentication settings.
//! - [`ApiError`] — Maps engine errors onto HTTP responses.

/// Error to HTTP response mapping.
pub mod error;
/// REST handlers.
pub mod handlers;
/// API-key authentication middleware.
pub mod middleware;
/// Router construction and shared state.
pub mod server;
/// WebSocket event streaming.
pub mod stream;

pub use error::ApiError;
pub use middleware::AuthConfig;
pub use server::{AppState, GatewayServer};
