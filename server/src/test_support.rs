//! Fixtures and fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::cache::{MemoryPreReservationCache, PreReservationCache};
use crate::clients::notify::{NotificationDispatcher, NotificationEvent, Notifier};
use crate::clients::payment::{
    PaymentProvider, ProviderPayment, ProviderPaymentStatus, VirtualAccount,
};
use crate::clients::qr_image::{PublicUrlImageStore, QrImageStore};
use crate::config::ReservationSettings;
use crate::models::expo::Expo;
use crate::models::intent::PreReservationIntent;
use crate::models::member::Member;
use crate::models::reservation::{Actor, Reservation, ReserverDetails, UserType};
use crate::models::ticket::Ticket;
use crate::services::qr::{QrLifecycle, TokenGenerator};
use crate::services::reservation::StartReservationRequest;
use crate::services::{AppState, Dependencies};
use crate::store::memory::LockedRow;
use crate::store::{MemoryStore, Store, UnitOfWork};
use crate::utils::clock::{Clock, FixedClock};
use crate::utils::error::AppError;

pub const TICKET_PRICE: i64 = 15_000;
pub const MEMBER_MILEAGE: i64 = 5_000;

pub fn expo_fixture(starts_at: DateTime<Utc>) -> Expo {
    Expo {
        id: Uuid::new_v4(),
        title: "Seoul Design Expo".to_string(),
        starts_at,
        ends_at: starts_at + Duration::days(3),
        created_at: starts_at - Duration::days(90),
        updated_at: starts_at - Duration::days(90),
    }
}

pub fn ticket_fixture(expo: &Expo, capacity: i32) -> Ticket {
    Ticket {
        id: Uuid::new_v4(),
        expo_id: expo.id,
        name: "General admission".to_string(),
        price: Decimal::from(TICKET_PRICE),
        total_quantity: capacity,
        remaining_quantity: capacity,
        valid_from: None,
        valid_until: None,
        created_at: expo.created_at,
        updated_at: expo.created_at,
    }
}

pub fn member_fixture(mileage: i64) -> Member {
    let now = Utc::now();
    Member {
        id: Uuid::new_v4(),
        name: "Kim Minji".to_string(),
        email: "minji@example.com".to_string(),
        mileage,
        created_at: now,
        updated_at: now,
    }
}

pub fn reserver_details(index: usize) -> ReserverDetails {
    ReserverDetails {
        name: format!("Visitor {}", index + 1),
        phone: format!("010-1234-{:04}", index),
        email: None,
    }
}

pub fn intent_fixture(session_id: &str) -> PreReservationIntent {
    PreReservationIntent {
        session_id: session_id.to_string(),
        expo_id: Uuid::new_v4(),
        ticket_id: Uuid::new_v4(),
        user_type: UserType::Member,
        user_id: Uuid::new_v4(),
        quantity: 2,
        mileage_used: 0,
        payable_amount: Decimal::from(TICKET_PRICE * 2),
        reservers: vec![reserver_details(0), reserver_details(1)],
        created_at: Utc::now(),
    }
}

/// Provider record that matches `intent` exactly.
pub fn provider_payment(
    intent: &PreReservationIntent,
    payment_ref: &str,
    status: ProviderPaymentStatus,
    method: &str,
) -> ProviderPayment {
    let vbank = method.eq_ignore_ascii_case("vbank").then(|| VirtualAccount {
        bank_name: "Shinhan".to_string(),
        account_number: "562-110-123456".to_string(),
        due_at: Some(intent.created_at + Duration::days(1)),
    });
    ProviderPayment {
        payment_ref: payment_ref.to_string(),
        merchant_ref: intent.session_id.clone(),
        amount: intent.payable_amount,
        status,
        method: method.to_string(),
        vbank,
    }
}

#[derive(Default)]
struct FakeProviderState {
    payments: HashMap<String, ProviderPayment>,
    refunds: Vec<(String, Decimal)>,
    unreachable: bool,
    refund_failure: bool,
}

/// In-process payment provider with switchable failures.
#[derive(Default)]
pub struct FakePaymentProvider {
    state: Mutex<FakeProviderState>,
}

impl FakePaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, payment: ProviderPayment) {
        self.state
            .lock()
            .unwrap()
            .payments
            .insert(payment.payment_ref.clone(), payment);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_refund_failure(&self, fail: bool) {
        self.state.lock().unwrap().refund_failure = fail;
    }

    pub fn refunds(&self) -> Vec<(String, Decimal)> {
        self.state.lock().unwrap().refunds.clone()
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn fetch_payment(&self, payment_ref: &str) -> Result<Option<ProviderPayment>, AppError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(AppError::ProviderUnreachable("connection refused".to_string()));
        }
        Ok(state.payments.get(payment_ref).cloned())
    }

    async fn refund(&self, payment_ref: &str, amount: Decimal, _reason: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(AppError::ProviderUnreachable("connection refused".to_string()));
        }
        if state.refund_failure {
            return Err(AppError::ExternalServiceError("refund declined".to_string()));
        }
        state.refunds.push((payment_ref.to_string(), amount));
        Ok(())
    }
}

/// Hands out pre-set tokens in order, then random-looking filler.
pub struct ScriptedTokens {
    tokens: Mutex<VecDeque<String>>,
}

impl ScriptedTokens {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: Mutex::new(tokens.into()),
        }
    }
}

impl TokenGenerator for ScriptedTokens {
    fn generate(&self) -> String {
        self.tokens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
    }
}

/// Start a reservation for `ticket` and pay for it by card through `provider`.
pub async fn purchase(
    services: &AppState,
    cache: &MemoryPreReservationCache,
    provider: &FakePaymentProvider,
    ticket: &Ticket,
    actor: &Actor,
    quantity: i32,
    mileage_used: i64,
) -> Reservation {
    let request = StartReservationRequest {
        expo_id: ticket.expo_id,
        ticket_id: ticket.id,
        quantity,
        mileage_used,
        reservers: (0..quantity).map(|i| reserver_details(i as usize)).collect(),
    };
    let started = services
        .reservations
        .start_reservation(actor, request)
        .await
        .unwrap();
    let intent = cache.get(&started.session_id).await.unwrap().unwrap();
    let payment_ref = format!("imp_{}", started.session_id);
    provider.put(provider_payment(
        &intent,
        &payment_ref,
        ProviderPaymentStatus::Paid,
        "card",
    ));

    services
        .reservations
        .confirm_payment(&started.session_id, &payment_ref, started.payable_amount)
        .await
        .unwrap()
        .reservation
}

/// Image host that can be switched off, delegating to a public-url store while up.
pub struct FlakyImageStore {
    inner: PublicUrlImageStore,
    down: AtomicBool,
}

impl FlakyImageStore {
    pub fn down() -> Self {
        Self {
            inner: PublicUrlImageStore::new("https://cdn.example.com"),
            down: AtomicBool::new(true),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl QrImageStore for FlakyImageStore {
    async fn store(&self, qr_id: Uuid, token: &str) -> Result<String, AppError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AppError::ExternalServiceError("image host unavailable".to_string()));
        }
        self.inner.store(qr_id, token).await
    }
}

/// Delivery channel that rejects everything and counts attempts.
#[derive(Default)]
pub struct FailingNotifier {
    attempts: AtomicUsize,
}

impl FailingNotifier {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn deliver(&self, _event: &NotificationEvent) -> Result<(), AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ExternalServiceError("smtp down".to_string()))
    }
}

/// Outside services a harness is wired with.
pub struct Collaborators {
    pub images: Arc<dyn QrImageStore>,
    /// Deliver through a background worker instead of queueing for `drain_events`.
    pub notifier: Option<Arc<dyn Notifier>>,
    pub settings: ReservationSettings,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            images: Arc::new(PublicUrlImageStore::new("https://cdn.example.com")),
            notifier: None,
            settings: ReservationSettings::default(),
        }
    }
}

/// Services assembled over an arbitrary store with fakes for everything else.
pub struct Wiring {
    pub cache: Arc<MemoryPreReservationCache>,
    pub provider: Arc<FakePaymentProvider>,
    pub clock: Arc<FixedClock>,
    pub images: Arc<dyn QrImageStore>,
    pub notifications: NotificationDispatcher,
    pub events: UnboundedReceiver<NotificationEvent>,
    pub services: AppState,
}

impl Wiring {
    pub fn over(store: Arc<dyn Store>, now: DateTime<Utc>, collaborators: Collaborators) -> Self {
        let cache = Arc::new(MemoryPreReservationCache::new());
        let provider = Arc::new(FakePaymentProvider::new());
        let clock = Arc::new(FixedClock::new(now));
        let (notifications, events) = match collaborators.notifier {
            Some(notifier) => {
                let (_, idle) = NotificationDispatcher::channel();
                (NotificationDispatcher::spawn(notifier), idle)
            }
            None => NotificationDispatcher::channel(),
        };

        let services = AppState::new(
            Dependencies {
                store,
                cache: cache.clone(),
                provider: provider.clone(),
                images: Arc::clone(&collaborators.images),
                notifications: notifications.clone(),
                clock: clock.clone(),
            },
            collaborators.settings,
        );

        Self {
            cache,
            provider,
            clock,
            images: collaborators.images,
            notifications,
            events,
            services,
        }
    }
}

/// Every service wired against in-memory collaborators and a fixed clock.
pub struct Harness {
    pub store: MemoryStore,
    pub cache: Arc<MemoryPreReservationCache>,
    pub provider: Arc<FakePaymentProvider>,
    pub clock: Arc<FixedClock>,
    pub images: Arc<dyn QrImageStore>,
    pub notifications: NotificationDispatcher,
    pub events: UnboundedReceiver<NotificationEvent>,
    pub services: AppState,
    pub expo: Expo,
    pub ticket: Ticket,
    pub member: Member,
}

impl Harness {
    pub async fn new(capacity: i32) -> Self {
        Self::with_collaborators(capacity, Collaborators::default()).await
    }

    pub async fn with_settings(capacity: i32, settings: ReservationSettings) -> Self {
        Self::with_collaborators(
            capacity,
            Collaborators {
                settings,
                ..Collaborators::default()
            },
        )
        .await
    }

    pub async fn with_collaborators(capacity: i32, collaborators: Collaborators) -> Self {
        let now = Utc::now();
        let store = MemoryStore::new();
        let expo = expo_fixture(now + Duration::days(30));
        let ticket = ticket_fixture(&expo, capacity);
        let member = member_fixture(MEMBER_MILEAGE);
        store.insert_expo(expo.clone()).await;
        store.insert_ticket(ticket.clone()).await;
        store.insert_member(member.clone()).await;

        let wiring = Wiring::over(Arc::new(store.clone()), now, collaborators);

        Self {
            store,
            cache: wiring.cache,
            provider: wiring.provider,
            clock: wiring.clock,
            images: wiring.images,
            notifications: wiring.notifications,
            events: wiring.events,
            services: wiring.services,
            expo,
            ticket,
            member,
        }
    }

    pub fn member_actor(&self) -> Actor {
        Actor {
            id: self.member.id,
            user_type: UserType::Member,
        }
    }

    pub fn guest_actor(&self) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            user_type: UserType::Guest,
        }
    }

    /// Start and pay for a reservation by card.
    pub async fn confirmed_reservation(
        &self,
        actor: &Actor,
        quantity: i32,
        mileage_used: i64,
    ) -> Reservation {
        purchase(
            &self.services,
            &self.cache,
            &self.provider,
            &self.ticket,
            actor,
            quantity,
            mileage_used,
        )
        .await
    }

    pub async fn member_balance(&self) -> i64 {
        self.store.snapshot().await.members[&self.member.id].mileage
    }

    pub async fn set_member_balance(&self, balance: i64) {
        let mut uow = self.store.begin().await.unwrap();
        uow.set_mileage(self.member.id, balance).await.unwrap();
        uow.commit().await.unwrap();
    }

    pub async fn any_token(&self) -> String {
        self.store
            .snapshot()
            .await
            .qr_codes
            .values()
            .next()
            .map(|qr| qr.token.clone())
            .unwrap()
    }

    pub async fn clear_qr_images(&self) {
        let codes: Vec<_> = self.store.snapshot().await.qr_codes.into_values().collect();
        let mut uow = self.store.begin().await.unwrap();
        for mut qr in codes {
            qr.image_url = None;
            uow.update_qr(&qr).await.unwrap();
        }
        uow.commit().await.unwrap();
    }

    /// A lifecycle sharing this harness's store and clock but drawing tokens from `tokens`.
    pub fn qr_with_tokens(&self, tokens: ScriptedTokens) -> QrLifecycle {
        let store: Arc<dyn Store> = Arc::new(self.store.clone());
        let clock: Arc<dyn Clock> = self.clock.clone();
        QrLifecycle::new(
            store,
            Arc::clone(&self.images),
            self.notifications.clone(),
            clock,
            Duration::minutes(60),
        )
        .with_token_generator(Arc::new(tokens))
    }

    /// Row locks each finished unit of work asked for, first acquisition of
    /// each kind only.
    pub async fn lock_sequences(&self) -> Vec<Vec<LockedRow>> {
        self.store
            .lock_history()
            .await
            .into_iter()
            .map(|locks| {
                let mut first = Vec::new();
                for row in locks {
                    if !first.contains(&row) {
                        first.push(row);
                    }
                }
                first
            })
            .collect()
    }

    /// Fails if any unit of work took a row kind after one declared later in [`LockedRow`].
    pub async fn assert_lock_order(&self) {
        for sequence in self.lock_sequences().await {
            assert!(
                sequence.windows(2).all(|pair| pair[0] < pair[1]),
                "rows locked out of order: {sequence:?}"
            );
        }
    }

    pub fn drain_events(&mut self) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
