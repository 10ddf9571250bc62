use rust_decimal::Decimal;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::create_security_headers_layer;

use crate::services::refund::{RefundPolicy, RefundReference};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/expo";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_PROVIDER_URL: &str = "https://api.iamport.kr";

#[derive(Debug, Clone)]
pub struct PaymentProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Upper bound for every provider round trip.
    pub timeout: Duration,
}

/// Rules shared by the reservation services.
#[derive(Debug, Clone)]
pub struct ReservationSettings {
    pub pre_reservation_ttl: Duration,
    /// Percentage of the paid amount credited back as mileage.
    pub mileage_accrual_percent: Decimal,
    /// How long before the display window opens a QR code becomes usable.
    pub qr_activation_lead: chrono::Duration,
    pub refund_policy: RefundPolicy,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            pre_reservation_ttl: Duration::from_secs(30 * 60),
            mileage_accrual_percent: Decimal::ONE,
            qr_activation_lead: chrono::Duration::minutes(60),
            refund_policy: RefundPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Unset means the in-process pre-reservation cache is used.
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub payment: PaymentProviderConfig,
    pub qr_image_base_url: String,
    pub qr_sweep_interval: Duration,
    pub reservation: ReservationSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = ReservationSettings::default();

        let refund_policy = RefundPolicy {
            reference: env_or("REFUND_REFERENCE", RefundReference::BeforeExpoStart),
            tiers: match env::var("REFUND_TIERS") {
                Ok(raw) => match RefundPolicy::parse_tiers(&raw) {
                    Ok(tiers) => tiers,
                    Err(e) => {
                        tracing::warn!("Config: invalid REFUND_TIERS '{}': {}", raw, e);
                        defaults.refund_policy.tiers.clone()
                    }
                },
                Err(_) => defaults.refund_policy.tiers.clone(),
            },
        };

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            db_max_connections: env_in_range("DB_MAX_CONNECTIONS", 5, 1..=1_000),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            bind_addr: env_or(
                "BIND_ADDR",
                DEFAULT_BIND_ADDR
                    .parse()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3001))),
            ),
            payment: PaymentProviderConfig {
                base_url: env::var("PAYMENT_PROVIDER_URL")
                    .unwrap_or_else(|_| DEFAULT_PROVIDER_URL.to_string()),
                api_key: env::var("PAYMENT_PROVIDER_KEY").unwrap_or_default(),
                api_secret: env::var("PAYMENT_PROVIDER_SECRET").unwrap_or_default(),
                timeout: Duration::from_secs(env_in_range("PROVIDER_TIMEOUT_SECS", 10, 1..=300)),
            },
            qr_image_base_url: env::var("QR_IMAGE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3001/static".to_string()),
            // tokio::time::interval panics on a zero period.
            qr_sweep_interval: Duration::from_secs(env_in_range(
                "QR_SWEEP_INTERVAL_SECS",
                60,
                1..=86_400,
            )),
            reservation: ReservationSettings {
                pre_reservation_ttl: Duration::from_secs(
                    env_in_range::<u64>("PRE_RESERVATION_TTL_MINUTES", 30, 1..=1_440) * 60,
                ),
                mileage_accrual_percent: env_in_range(
                    "MILEAGE_ACCRUAL_PERCENT",
                    defaults.mileage_accrual_percent,
                    Decimal::ZERO..=Decimal::ONE_HUNDRED,
                ),
                // A week; chrono panics on minute counts far beyond that.
                qr_activation_lead: chrono::Duration::minutes(env_in_range(
                    "QR_ACTIVATION_LEAD_MINUTES",
                    60,
                    0..=10_080,
                )),
                refund_policy,
            },
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset or unparsable.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Config: ignoring invalid {}='{}': {}", key, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}

/// Like [`env_or`], but values outside `range` also fall back to `default`.
fn env_in_range<T>(key: &str, default: T, range: RangeInclusive<T>) -> T
where
    T: FromStr + PartialOrd + Display + Copy,
    T::Err: Display,
{
    let value = env_or(key, default);
    if range.contains(&value) {
        return value;
    }
    tracing::warn!(
        "Config: ignoring {}={} outside {}..={}",
        key,
        value,
        range.start(),
        range.end()
    );
    default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("EXPO_TEST_GARBAGE_NUMBER", "not-a-number");
        assert_eq!(env_or("EXPO_TEST_GARBAGE_NUMBER", 7u32), 7);
        std::env::remove_var("EXPO_TEST_GARBAGE_NUMBER");
    }

    #[test]
    fn test_env_or_reads_value() {
        std::env::set_var("EXPO_TEST_LEAD", " 45 ");
        assert_eq!(env_or("EXPO_TEST_LEAD", 60i64), 45);
        std::env::remove_var("EXPO_TEST_LEAD");
    }

    #[test]
    fn test_env_in_range_rejects_out_of_range() {
        std::env::set_var("EXPO_TEST_RANGE_ZERO", "0");
        assert_eq!(env_in_range("EXPO_TEST_RANGE_ZERO", 60u64, 1..=86_400), 60);
        std::env::set_var("EXPO_TEST_RANGE_ZERO", "86400");
        assert_eq!(env_in_range("EXPO_TEST_RANGE_ZERO", 60u64, 1..=86_400), 86_400);
        std::env::remove_var("EXPO_TEST_RANGE_ZERO");

        std::env::set_var("EXPO_TEST_RANGE_NEGATIVE", "-5");
        assert_eq!(env_in_range("EXPO_TEST_RANGE_NEGATIVE", 60i64, 0..=10_080), 60);
        std::env::remove_var("EXPO_TEST_RANGE_NEGATIVE");
    }

    #[test]
    fn test_from_env_never_builds_panicking_durations() {
        std::env::set_var("QR_SWEEP_INTERVAL_SECS", "0");
        std::env::set_var("PRE_RESERVATION_TTL_MINUTES", "18446744073709551615");
        std::env::set_var("QR_ACTIVATION_LEAD_MINUTES", "9223372036854775807");
        std::env::set_var("MILEAGE_ACCRUAL_PERCENT", "250");
        let config = Config::from_env();
        for key in [
            "QR_SWEEP_INTERVAL_SECS",
            "PRE_RESERVATION_TTL_MINUTES",
            "QR_ACTIVATION_LEAD_MINUTES",
            "MILEAGE_ACCRUAL_PERCENT",
        ] {
            std::env::remove_var(key);
        }

        assert_eq!(config.qr_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.reservation.pre_reservation_ttl, Duration::from_secs(1800));
        assert_eq!(
            config.reservation.qr_activation_lead,
            chrono::Duration::minutes(60)
        );
        assert_eq!(config.reservation.mileage_accrual_percent, Decimal::ONE);
    }

    #[test]
    fn test_default_settings() {
        let settings = ReservationSettings::default();
        assert_eq!(settings.pre_reservation_ttl, Duration::from_secs(1800));
        assert_eq!(settings.qr_activation_lead, chrono::Duration::minutes(60));
        assert!(!settings.refund_policy.tiers.is_empty());
    }
}
