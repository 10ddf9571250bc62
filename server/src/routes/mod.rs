use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, create_security_headers_layer};
use crate::handlers::{health_check, payments, qr, reservations};
use crate::services::AppState;

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/reservations", post(reservations::start_reservation))
        .route("/reservations/:id/refund", get(reservations::refund_quote))
        .route("/reservations/:id/cancel", post(reservations::cancel_reservation))
        .route("/payments/confirm", post(payments::confirm_payment))
        .route("/payments/webhook", post(payments::payment_webhook))
        .route("/qr/check-in", post(qr::check_in))
        .route("/qr/verify/:token", get(qr::verify_qr))
        .route("/qr/:id/reissue", post(qr::reissue_qr));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(create_security_headers_layer())
        .layer(create_cors_layer())
}
