use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use expo_server::cache::{MemoryPreReservationCache, PreReservationCache, RedisPreReservationCache};
use expo_server::clients::{HttpPaymentProvider, LogNotifier, NotificationDispatcher, PublicUrlImageStore};
use expo_server::config::Config;
use expo_server::routes::create_routes;
use expo_server::services::qr::QrLifecycle;
use expo_server::services::{AppState, Dependencies};
use expo_server::store::PgStore;
use expo_server::utils::clock::SystemClock;

const IMAGE_BACKFILL_BATCH: i64 = 100;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let cache: Arc<dyn PreReservationCache> = match &config.redis_url {
        Some(url) => match RedisPreReservationCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("Pre-reservation cache backed by Redis");
                Arc::new(cache)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, using in-process cache");
                Arc::new(MemoryPreReservationCache::new())
            }
        },
        None => Arc::new(MemoryPreReservationCache::new()),
    };

    let provider = HttpPaymentProvider::new(config.payment.clone())
        .expect("Failed to build payment provider client");

    let deps = Dependencies {
        store: Arc::new(PgStore::new(pool)),
        cache,
        provider: Arc::new(provider),
        images: Arc::new(PublicUrlImageStore::new(config.qr_image_base_url.clone())),
        notifications: NotificationDispatcher::spawn(Arc::new(LogNotifier)),
        clock: Arc::new(SystemClock),
    };
    let state = AppState::new(deps, config.reservation.clone());

    spawn_qr_maintenance(Arc::clone(&state.qr), config.qr_sweep_interval);

    let app: Router = create_routes(state);

    tracing::info!("Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}

/// Periodically reclassify QR codes by time and retry missing images.
fn spawn_qr_maintenance(qr: Arc<QrLifecycle>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;

            // Both log what they applied themselves.
            if let Err(e) = qr.sweep().await {
                tracing::error!(error = %e, "QR sweep failed");
            }
            if let Err(e) = qr.backfill_images(IMAGE_BACKFILL_BATCH).await {
                tracing::warn!(error = %e, "QR image backfill failed");
            }
        }
    });
}
