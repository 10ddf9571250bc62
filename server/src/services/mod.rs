use std::sync::Arc;

use crate::cache::PreReservationCache;
use crate::clients::notify::NotificationDispatcher;
use crate::clients::payment::PaymentProvider;
use crate::clients::qr_image::QrImageStore;
use crate::config::ReservationSettings;
use crate::store::Store;
use crate::utils::clock::Clock;

pub mod inventory;
pub mod mileage;
pub mod qr;
pub mod refund;
pub mod reservation;
pub mod verification;

use qr::QrLifecycle;
use refund::RefundService;
use reservation::ReservationService;

/// External collaborators every service is built from.
pub struct Dependencies {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn PreReservationCache>,
    pub provider: Arc<dyn PaymentProvider>,
    pub images: Arc<dyn QrImageStore>,
    pub notifications: NotificationDispatcher,
    pub clock: Arc<dyn Clock>,
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub reservations: Arc<ReservationService>,
    pub refunds: Arc<RefundService>,
    pub qr: Arc<QrLifecycle>,
}

impl AppState {
    pub fn new(deps: Dependencies, settings: ReservationSettings) -> Self {
        let qr = Arc::new(QrLifecycle::new(
            Arc::clone(&deps.store),
            deps.images,
            deps.notifications.clone(),
            Arc::clone(&deps.clock),
            settings.qr_activation_lead,
        ));
        let refunds = Arc::new(RefundService::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.provider),
            deps.notifications.clone(),
            Arc::clone(&deps.clock),
            settings.refund_policy.clone(),
        ));
        let reservations = Arc::new(ReservationService::new(
            deps.store,
            deps.cache,
            deps.provider,
            Arc::clone(&qr),
            deps.notifications,
            deps.clock,
            settings,
        ));

        Self {
            reservations,
            refunds,
            qr,
        }
    }
}
