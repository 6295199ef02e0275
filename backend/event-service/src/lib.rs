//! Event Service
//!
//! Operates live interactive broadcast events: the event lifecycle state
//! machine, CDN broadcast and archive orchestration, and realtime
//! presence/admission control.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod models;
pub mod presence;
pub mod services;
pub mod state;
pub mod websocket;

// Public re-exports
pub use config::Config;
pub use error::{AppError, AppResult};
pub use logging::init_tracing;
