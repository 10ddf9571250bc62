use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::models::expo::Expo;
use crate::models::member::Member;
use crate::models::payment::{PaymentStatus, ReservationPaymentInfo};
use crate::models::qr_code::QrCode;
use crate::models::reservation::{Reservation, ReservationStatus, Reserver};
use crate::models::ticket::Ticket;
use crate::utils::error::AppError;

const RESERVATION_COLUMNS: &str = "id, expo_id, ticket_id, reservation_code, user_type, user_id, \
                                   quantity, status, created_at, updated_at";

const QR_COLUMNS: &str = "id, reserver_id, token, image_url, status, activated_at, expired_at, \
                          used_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }
}

pub struct PgUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn conn(&mut self) -> Result<&mut PgConnection, AppError> {
        self.tx.as_deref_mut().ok_or_else(|| {
            AppError::InternalServerError("unit of work already finished".to_string())
        })
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn expo(&mut self, id: Uuid) -> Result<Option<Expo>, AppError> {
        let expo = sqlx::query_as::<_, Expo>(
            "SELECT id, title, starts_at, ends_at, created_at, updated_at FROM expos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(expo)
    }

    async fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, AppError> {
        let ticket = sqlx::query_as::<_, Ticket>(
            r#"
            SELECT id, expo_id, name, price, total_quantity, remaining_quantity,
                   valid_from, valid_until, created_at, updated_at
            FROM tickets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(ticket)
    }

    async fn try_decrement_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError> {
        // The row lock taken by UPDATE serializes concurrent buyers; the WHERE
        // clause is re-evaluated against the committed value once it is released.
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE tickets
            SET remaining_quantity = remaining_quantity - $2,
                updated_at = NOW()
            WHERE id = $1 AND remaining_quantity >= $2
            RETURNING remaining_quantity
            "#,
        )
        .bind(ticket_id)
        .bind(quantity)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(remaining)
    }

    async fn try_restore_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError> {
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE tickets
            SET remaining_quantity = remaining_quantity + $2,
                updated_at = NOW()
            WHERE id = $1 AND remaining_quantity + $2 <= total_quantity
            RETURNING remaining_quantity
            "#,
        )
        .bind(ticket_id)
        .bind(quantity)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(remaining)
    }

    async fn member_for_update(&mut self, id: Uuid) -> Result<Option<Member>, AppError> {
        let member = sqlx::query_as::<_, Member>(
            "SELECT id, name, email, mileage, created_at, updated_at FROM members WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(member)
    }

    async fn set_mileage(&mut self, member_id: Uuid, balance: i64) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE members SET mileage = $2, updated_at = NOW() WHERE id = $1")
                .bind(member_id)
                .bind(balance)
                .execute(self.conn()?)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("member {member_id}")));
        }
        Ok(())
    }

    async fn reservation_code_exists(&mut self, code: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM reservations WHERE reservation_code = $1)",
        )
        .bind(code)
        .fetch_one(self.conn()?)
        .await?;
        Ok(exists)
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reservations
                (id, expo_id, ticket_id, reservation_code, user_type, user_id,
                 quantity, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.expo_id)
        .bind(reservation.ticket_id)
        .bind(&reservation.reservation_code)
        .bind(reservation.user_type)
        .bind(reservation.user_id)
        .bind(reservation.quantity)
        .bind(reservation.status)
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError> {
        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(reservation)
    }

    async fn reservation_for_update(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError> {
        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(reservation)
    }

    async fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE reservations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(at)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn insert_reserver(&mut self, reserver: &Reserver) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reservers (id, reservation_id, name, phone, email, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reserver.id)
        .bind(reserver.reservation_id)
        .bind(&reserver.name)
        .bind(&reserver.phone)
        .bind(&reserver.email)
        .bind(reserver.created_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn reserver(&mut self, id: Uuid) -> Result<Option<Reserver>, AppError> {
        let reserver = sqlx::query_as::<_, Reserver>(
            "SELECT id, reservation_id, name, phone, email, created_at FROM reservers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(reserver)
    }

    async fn reservers_for(&mut self, reservation_id: Uuid) -> Result<Vec<Reserver>, AppError> {
        let reservers = sqlx::query_as::<_, Reserver>(
            r#"
            SELECT id, reservation_id, name, phone, email, created_at
            FROM reservers
            WHERE reservation_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(reservation_id)
        .fetch_all(self.conn()?)
        .await?;
        Ok(reservers)
    }

    async fn insert_payment_info(&mut self, info: &ReservationPaymentInfo) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reservation_payment_infos
                (reservation_id, payment_ref, total_amount, status, used_mileage,
                 saved_mileage, refunded_amount, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(info.reservation_id)
        .bind(&info.payment_ref)
        .bind(info.total_amount)
        .bind(info.status)
        .bind(info.used_mileage)
        .bind(info.saved_mileage)
        .bind(info.refunded_amount)
        .bind(info.created_at)
        .bind(info.updated_at)
        .execute(self.conn()?)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(AppError::DuplicatePayment(info.payment_ref.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn payment_info(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationPaymentInfo>, AppError> {
        let info = sqlx::query_as::<_, ReservationPaymentInfo>(
            r#"
            SELECT reservation_id, payment_ref, total_amount, status, used_mileage,
                   saved_mileage, refunded_amount, created_at, updated_at
            FROM reservation_payment_infos
            WHERE reservation_id = $1
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(info)
    }

    async fn payment_info_by_ref(
        &mut self,
        payment_ref: &str,
    ) -> Result<Option<ReservationPaymentInfo>, AppError> {
        let info = sqlx::query_as::<_, ReservationPaymentInfo>(
            r#"
            SELECT reservation_id, payment_ref, total_amount, status, used_mileage,
                   saved_mileage, refunded_amount, created_at, updated_at
            FROM reservation_payment_infos
            WHERE payment_ref = $1
            "#,
        )
        .bind(payment_ref)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(info)
    }

    async fn set_payment_status(
        &mut self,
        reservation_id: Uuid,
        status: PaymentStatus,
        refunded_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE reservation_payment_infos
            SET status = $2,
                refunded_amount = COALESCE($3, refunded_amount),
                updated_at = $4
            WHERE reservation_id = $1
            "#,
        )
        .bind(reservation_id)
        .bind(status)
        .bind(refunded_amount)
        .bind(at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn qr_token_exists(&mut self, token: &str) -> Result<bool, AppError> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM qr_codes WHERE token = $1)")
                .bind(token)
                .fetch_one(self.conn()?)
                .await?;
        Ok(exists)
    }

    async fn insert_qr(&mut self, qr: &QrCode) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO qr_codes
                (id, reserver_id, token, image_url, status, activated_at, expired_at,
                 used_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(qr.id)
        .bind(qr.reserver_id)
        .bind(&qr.token)
        .bind(&qr.image_url)
        .bind(qr.status)
        .bind(qr.activated_at)
        .bind(qr.expired_at)
        .bind(qr.used_at)
        .bind(qr.created_at)
        .bind(qr.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn qr(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError> {
        let qr = sqlx::query_as::<_, QrCode>(&format!(
            "SELECT {QR_COLUMNS} FROM qr_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(qr)
    }

    async fn qr_for_update(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError> {
        let qr = sqlx::query_as::<_, QrCode>(&format!(
            "SELECT {QR_COLUMNS} FROM qr_codes WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(qr)
    }

    async fn qr_by_token(&mut self, token: &str) -> Result<Option<QrCode>, AppError> {
        let qr = sqlx::query_as::<_, QrCode>(&format!(
            "SELECT {QR_COLUMNS} FROM qr_codes WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(qr)
    }

    async fn qr_by_token_for_update(&mut self, token: &str) -> Result<Option<QrCode>, AppError> {
        let qr = sqlx::query_as::<_, QrCode>(&format!(
            "SELECT {QR_COLUMNS} FROM qr_codes WHERE token = $1 FOR UPDATE"
        ))
        .bind(token)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(qr)
    }

    async fn live_qrs_for_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<QrCode>, AppError> {
        let qrs = sqlx::query_as::<_, QrCode>(
            r#"
            SELECT q.id, q.reserver_id, q.token, q.image_url, q.status, q.activated_at,
                   q.expired_at, q.used_at, q.created_at, q.updated_at
            FROM qr_codes q
            JOIN reservers r ON r.id = q.reserver_id
            WHERE r.reservation_id = $1 AND q.status IN ('APPROVED', 'ACTIVE')
            ORDER BY q.id
            FOR UPDATE OF q
            "#,
        )
        .bind(reservation_id)
        .fetch_all(self.conn()?)
        .await?;
        Ok(qrs)
    }

    async fn qrs_due_for_sweep(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QrCode>, AppError> {
        let qrs = sqlx::query_as::<_, QrCode>(&format!(
            r#"
            SELECT {QR_COLUMNS}
            FROM qr_codes
            WHERE (status = 'APPROVED' AND (activated_at <= $1 OR expired_at <= $1))
               OR (status = 'ACTIVE' AND expired_at <= $1)
            ORDER BY expired_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;
        Ok(qrs)
    }

    async fn qrs_missing_image(&mut self, limit: i64) -> Result<Vec<QrCode>, AppError> {
        let qrs = sqlx::query_as::<_, QrCode>(&format!(
            r#"
            SELECT {QR_COLUMNS}
            FROM qr_codes
            WHERE image_url IS NULL AND status IN ('APPROVED', 'ACTIVE')
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(limit)
        .fetch_all(self.conn()?)
        .await?;
        Ok(qrs)
    }

    async fn update_qr(&mut self, qr: &QrCode) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE qr_codes
            SET status = $2, image_url = $3, used_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(qr.id)
        .bind(qr.status)
        .bind(&qr.image_url)
        .bind(qr.used_at)
        .bind(qr.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), AppError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(AppError::InternalServerError(
                "unit of work already finished".to_string(),
            )),
        }
    }

    async fn rollback(&mut self) -> Result<(), AppError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::future::Future;
    use std::sync::Arc;

    use crate::cache::PreReservationCache;
    use crate::clients::payment::ProviderPaymentStatus;
    use crate::models::qr_code::QrStatus;
    use crate::models::reservation::{Actor, UserType};
    use crate::services::reservation::{StartReservationRequest, StartedReservation};
    use crate::test_support::{
        expo_fixture, member_fixture, provider_payment, purchase, reserver_details, ticket_fixture,
        Collaborators, Wiring, MEMBER_MILEAGE,
    };

    const DEADLINE: std::time::Duration = std::time::Duration::from_secs(15);

    struct Seeded {
        pool: PgPool,
        wiring: Wiring,
        expo: Expo,
        ticket: Ticket,
        member: Member,
    }

    impl Seeded {
        async fn new(pool: PgPool, capacity: i32) -> Self {
            let now = Utc::now();
            let expo = expo_fixture(now + Duration::days(30));
            let ticket = ticket_fixture(&expo, capacity);
            let member = member_fixture(MEMBER_MILEAGE);

            sqlx::query(
                "INSERT INTO expos (id, title, starts_at, ends_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(expo.id)
            .bind(&expo.title)
            .bind(expo.starts_at)
            .bind(expo.ends_at)
            .bind(expo.created_at)
            .bind(expo.updated_at)
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO tickets (id, expo_id, name, price, total_quantity, remaining_quantity, \
                 valid_from, valid_until, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(ticket.id)
            .bind(ticket.expo_id)
            .bind(&ticket.name)
            .bind(ticket.price)
            .bind(ticket.total_quantity)
            .bind(ticket.remaining_quantity)
            .bind(ticket.valid_from)
            .bind(ticket.valid_until)
            .bind(ticket.created_at)
            .bind(ticket.updated_at)
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO members (id, name, email, mileage, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(member.id)
            .bind(&member.name)
            .bind(&member.email)
            .bind(member.mileage)
            .bind(member.created_at)
            .bind(member.updated_at)
            .execute(&pool)
            .await
            .unwrap();

            let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
            let wiring = Wiring::over(store, now, Collaborators::default());
            Self {
                pool,
                wiring,
                expo,
                ticket,
                member,
            }
        }

        fn member_actor(&self) -> Actor {
            Actor {
                id: self.member.id,
                user_type: UserType::Member,
            }
        }

        fn guest_actor(&self) -> Actor {
            Actor {
                id: Uuid::new_v4(),
                user_type: UserType::Guest,
            }
        }

        async fn buy(&self, actor: &Actor, quantity: i32) -> Reservation {
            purchase(
                &self.wiring.services,
                &self.wiring.cache,
                &self.wiring.provider,
                &self.ticket,
                actor,
                quantity,
                0,
            )
            .await
        }

        /// A started, paid-for session that has not been confirmed yet.
        async fn paid_session(&self, actor: &Actor, payment_ref: &str) -> StartedReservation {
            let started = self
                .wiring
                .services
                .reservations
                .start_reservation(
                    actor,
                    StartReservationRequest {
                        expo_id: self.expo.id,
                        ticket_id: self.ticket.id,
                        quantity: 1,
                        mileage_used: 0,
                        reservers: vec![reserver_details(0)],
                    },
                )
                .await
                .unwrap();
            let intent = self
                .wiring
                .cache
                .get(&started.session_id)
                .await
                .unwrap()
                .unwrap();
            self.wiring.provider.put(provider_payment(
                &intent,
                payment_ref,
                ProviderPaymentStatus::Paid,
                "card",
            ));
            started
        }

        async fn remaining(&self) -> i32 {
            sqlx::query_scalar("SELECT remaining_quantity FROM tickets WHERE id = $1")
                .bind(self.ticket.id)
                .fetch_one(&self.pool)
                .await
                .unwrap()
        }

        async fn qr_ids(&self, reservation_id: Uuid) -> Vec<Uuid> {
            sqlx::query_scalar(
                "SELECT q.id FROM qr_codes q JOIN reservers r ON r.id = q.reserver_id \
                 WHERE r.reservation_id = $1 ORDER BY q.id",
            )
            .bind(reservation_id)
            .fetch_all(&self.pool)
            .await
            .unwrap()
        }

        async fn live_codes(&self, reservation_id: Uuid) -> i64 {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM qr_codes q JOIN reservers r ON r.id = q.reserver_id \
                 WHERE r.reservation_id = $1 AND q.status <> 'EXPIRED'",
            )
            .bind(reservation_id)
            .fetch_one(&self.pool)
            .await
            .unwrap()
        }
    }

    async fn in_time<T>(work: impl Future<Output = T>) -> T {
        tokio::time::timeout(DEADLINE, work)
            .await
            .expect("gave up waiting on row locks")
    }

    #[sqlx::test]
    async fn test_last_seat_goes_to_exactly_one_buyer(pool: PgPool) {
        let seeded = Seeded::new(pool, 1).await;
        let mut sessions = Vec::new();
        for i in 0..6 {
            let payment_ref = format!("imp_race_{i}");
            let started = seeded.paid_session(&seeded.guest_actor(), &payment_ref).await;
            sessions.push((started, payment_ref));
        }

        let mut handles = Vec::new();
        for (started, payment_ref) in sessions {
            let reservations = Arc::clone(&seeded.wiring.services.reservations);
            handles.push(tokio::spawn(async move {
                reservations
                    .confirm_payment(&started.session_id, &payment_ref, started.payable_amount)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match in_time(handle).await.unwrap() {
                Ok(_) => winners += 1,
                Err(AppError::InsufficientInventory { remaining: 0, .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(seeded.remaining().await, 0);
        let reservations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reservations")
            .fetch_one(&seeded.pool)
            .await
            .unwrap();
        assert_eq!(reservations, 1);
    }

    #[sqlx::test]
    async fn test_concurrent_scans_have_one_winner(pool: PgPool) {
        let seeded = Seeded::new(pool, 5).await;
        let reservation = seeded.buy(&seeded.guest_actor(), 1).await;
        let qr_id = seeded.qr_ids(reservation.id).await[0];
        let token: String = sqlx::query_scalar("SELECT token FROM qr_codes WHERE id = $1")
            .bind(qr_id)
            .fetch_one(&seeded.pool)
            .await
            .unwrap();
        seeded.wiring.clock.set(seeded.expo.starts_at);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let qr = Arc::clone(&seeded.wiring.services.qr);
            let token = token.clone();
            handles.push(tokio::spawn(async move { qr.mark_used(&token, Uuid::nil()).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match in_time(handle).await.unwrap() {
                Ok(_) => winners += 1,
                Err(AppError::QrInvalidTransition {
                    status: QrStatus::Used,
                    ..
                }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners, 1);
        let status: QrStatus = sqlx::query_scalar("SELECT status FROM qr_codes WHERE id = $1")
            .bind(qr_id)
            .fetch_one(&seeded.pool)
            .await
            .unwrap();
        assert_eq!(status, QrStatus::Used);
    }

    #[sqlx::test]
    async fn test_reissue_racing_cancellation_settles_cleanly(pool: PgPool) {
        let seeded = Seeded::new(pool, 20).await;
        let actor = seeded.member_actor();

        for _ in 0..5 {
            let reservation = seeded.buy(&actor, 1).await;
            let qr_id = seeded.qr_ids(reservation.id).await[0];

            let (reissued, cancelled) = tokio::join!(
                in_time(seeded.wiring.services.qr.reissue(qr_id, &actor)),
                in_time(seeded.wiring.services.refunds.cancel_reservation(
                    reservation.id,
                    &actor,
                    "plans changed"
                )),
            );

            assert!(cancelled.is_ok(), "cancellation failed: {:?}", cancelled.err());
            match reissued {
                Ok(_) | Err(AppError::ReservationStateConflict(_)) => {}
                Err(other) => panic!("unexpected reissue error: {other:?}"),
            }
            // Whichever committed first, nothing stays scannable.
            assert_eq!(seeded.live_codes(reservation.id).await, 0);
        }
    }

    #[sqlx::test]
    async fn test_purchase_racing_cancellation_settles_cleanly(pool: PgPool) {
        let seeded = Seeded::new(pool, 20).await;
        let actor = seeded.member_actor();

        for round in 0..5 {
            let earlier = seeded.buy(&actor, 1).await;
            let payment_ref = format!("imp_next_{round}");
            let next = seeded.paid_session(&actor, &payment_ref).await;

            let (confirmed, cancelled) = tokio::join!(
                in_time(seeded.wiring.services.reservations.confirm_payment(
                    &next.session_id,
                    &payment_ref,
                    next.payable_amount
                )),
                in_time(seeded.wiring.services.refunds.cancel_reservation(
                    earlier.id,
                    &actor,
                    "swapping tickets"
                )),
            );
            assert!(confirmed.is_ok(), "purchase failed: {:?}", confirmed.err());
            assert!(cancelled.is_ok(), "cancellation failed: {:?}", cancelled.err());
        }

        assert_eq!(seeded.remaining().await, 15);
    }

    #[sqlx::test]
    async fn test_quote_does_not_wait_for_a_held_reservation(pool: PgPool) {
        let seeded = Seeded::new(pool, 5).await;
        let actor = seeded.member_actor();
        let reservation = seeded.buy(&actor, 1).await;

        let store = PgStore::new(seeded.pool.clone());
        let mut holder = store.begin().await.unwrap();
        holder
            .reservation_for_update(reservation.id)
            .await
            .unwrap()
            .unwrap();

        let quote = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            seeded
                .wiring
                .services
                .refunds
                .calculate_refund(reservation.id, &actor),
        )
        .await
        .expect("quote blocked behind a row lock")
        .unwrap();
        assert!(quote.actual_refund_amount > Decimal::ZERO);

        holder.rollback().await.unwrap();
    }
}
