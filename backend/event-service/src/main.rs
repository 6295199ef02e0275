/// Event Service - HTTP + WebSocket server
use actix_web::{middleware as actix_middleware, web, App, HttpResponse, HttpServer};
use crypto_core::Sealer;
use std::io;
use std::sync::Arc;

use event_service::cache::RedisBroadcastStore;
use event_service::db::{self, PgAdminStore, PgEventStore};
use event_service::presence::PresenceController;
use event_service::services::broadcast::{BroadcastOrchestrator, OrchestratorTiming};
use event_service::services::lifecycle::EventLifecycle;
use event_service::services::opentok::OpenTokClient;
use event_service::state::AppState;
use event_service::{handlers, middleware, websocket, Config};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    event_service::init_tracing();

    let config = Config::from_env()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("configuration: {e}")))?;

    let pool = db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let redis_client = redis::Client::open(config.cache.redis_url.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("Invalid REDIS_URL: {e}")))?;
    let store = RedisBroadcastStore::new(redis_client).await.map_err(|e| {
        io::Error::new(io::ErrorKind::Other, format!("Failed to initialize cache: {e}"))
    })?;

    let platform: Arc<dyn event_service::services::opentok::VideoPlatform> =
        Arc::new(OpenTokClient::new(config.platform.api_url.clone()));
    let orchestrator = Arc::new(BroadcastOrchestrator::new(
        Arc::new(store),
        platform.clone(),
        OrchestratorTiming::default(),
    ));

    let events: Arc<dyn event_service::db::EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let admins: Arc<dyn event_service::db::AdminStore> = Arc::new(PgAdminStore::new(pool.clone()));
    let sealer = Sealer::new(config.auth.master_key);

    let lifecycle = Arc::new(EventLifecycle::new(
        events.clone(),
        admins.clone(),
        orchestrator.clone(),
        platform.clone(),
        sealer.clone(),
        config.broadcast.bucket_url.clone(),
    ));
    let presence = Arc::new(PresenceController::new(
        config.presence.interactive_stream_limit,
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        events,
        admins,
        platform,
        orchestrator,
        lifecycle,
        presence,
        sealer,
    };

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!(%bind_address, env = %config.app.env, "event service starting");

    let jwt_secret = config.auth.jwt_secret.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(actix_middleware::Logger::default())
            .route(
                "/health",
                web::get()
                    .to(|| async { HttpResponse::Ok().json(serde_json::json!({"status": "ok"})) }),
            )
            .route("/ws", web::get().to(websocket::ws_index))
            .service(
                web::scope("/api")
                    .wrap(middleware::JwtAuth::new(jwt_secret.clone()))
                    .service(
                        web::scope("/events")
                            .route("", web::get().to(handlers::list_events))
                            .route("", web::post().to(handlers::create_event))
                            .route("/{id}", web::get().to(handlers::get_event))
                            .route("/{id}", web::patch().to(handlers::update_event))
                            .route("/{id}", web::delete().to(handlers::delete_event))
                            .route("/{id}/status", web::post().to(handlers::change_status)),
                    )
                    .service(
                        web::scope("/admins")
                            .route("", web::get().to(handlers::list_admins))
                            .route("", web::post().to(handlers::create_admin))
                            .route("/{id}", web::get().to(handlers::get_admin))
                            .route("/{id}", web::patch().to(handlers::update_admin))
                            .route("/{id}", web::delete().to(handlers::delete_admin)),
                    ),
            )
    })
    .bind(&bind_address)?
    .run()
    .await
}
