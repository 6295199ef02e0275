use crypto_core::Sealer;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{AdminStore, EventStore};
use crate::error::AppResult;
use crate::models::Admin;
use crate::presence::PresenceController;
use crate::services::broadcast::BroadcastOrchestrator;
use crate::services::lifecycle::EventLifecycle;
use crate::services::opentok::{PlatformCredentials, VideoPlatform};

/// Shared application state handed to every handler and websocket session.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub events: Arc<dyn EventStore>,
    pub admins: Arc<dyn AdminStore>,
    pub platform: Arc<dyn VideoPlatform>,
    pub orchestrator: Arc<BroadcastOrchestrator>,
    pub lifecycle: Arc<EventLifecycle>,
    pub presence: Arc<PresenceController>,
    pub sealer: Sealer,
}

impl AppState {
    /// Unseal an admin's vendor credentials for one call.
    pub fn credentials_for(&self, admin: &Admin) -> AppResult<PlatformCredentials> {
        Ok(PlatformCredentials {
            api_key: admin.api_key.clone(),
            api_secret: self.sealer.unseal(admin.id, &admin.api_secret_sealed)?,
        })
    }
}
