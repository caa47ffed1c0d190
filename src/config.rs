use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{FixedOffset, Offset, Utc};

use crate::db::DatabaseProvider;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_provider: DatabaseProvider,
    pub database_url: String,
    pub bind_addr: String,
    pub run_migrations: bool,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_hours: i64,

    /// Offset used to decide what "today" means for bookings.
    pub business_utc_offset_hours: i32,
    pub default_country_code: String,

    pub whatsapp_gateway_url: Option<String>,
    pub email_gateway_url: Option<String>,
    pub gateway_max_attempts: u32,
    pub gateway_base_delay_ms: u64,

    pub reminder_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_provider = match get("DATABASE_PROVIDER") {
            Some(raw) => DatabaseProvider::parse(&raw)?,
            None => DatabaseProvider::Postgres,
        };
        let database_url = get("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL is required"))?;

        let jwt_secret = get("JWT_SECRET").ok_or_else(|| anyhow!("JWT_SECRET is required"))?;
        if jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 bytes");
        }

        let business_utc_offset_hours: i32 = parse_or(&get, "BUSINESS_UTC_OFFSET_HOURS", -5)?;
        if !(-12..=14).contains(&business_utc_offset_hours) {
            bail!("BUSINESS_UTC_OFFSET_HOURS must be between -12 and 14");
        }

        let default_country_code = get("DEFAULT_COUNTRY_CODE").unwrap_or_else(|| "57".to_string());
        let default_country_code = default_country_code.trim_start_matches('+').to_string();
        if default_country_code.is_empty()
            || default_country_code.len() > 3
            || !default_country_code.chars().all(|c| c.is_ascii_digit())
        {
            bail!("DEFAULT_COUNTRY_CODE must be 1-3 digits");
        }

        let gateway_max_attempts: u32 = parse_or(&get, "GATEWAY_MAX_ATTEMPTS", 3)?;
        if gateway_max_attempts == 0 {
            bail!("GATEWAY_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_provider,
            database_url,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            run_migrations: parse_or(&get, "RUN_MIGRATIONS", true)?,
            jwt_secret,
            jwt_issuer: get("JWT_ISSUER").unwrap_or_else(|| "pqr-appointments".to_string()),
            access_token_ttl_minutes: parse_or(&get, "ACCESS_TOKEN_TTL_MINUTES", 60)?,
            refresh_token_ttl_hours: parse_or(&get, "REFRESH_TOKEN_TTL_HOURS", 24 * 7)?,
            business_utc_offset_hours,
            default_country_code,
            whatsapp_gateway_url: get("WHATSAPP_GATEWAY_URL").map(|u| u.trim_end_matches('/').to_string()),
            email_gateway_url: get("EMAIL_GATEWAY_URL").map(|u| u.trim_end_matches('/').to_string()),
            gateway_max_attempts,
            gateway_base_delay_ms: parse_or(&get, "GATEWAY_BASE_DELAY_MS", 500)?,
            reminder_interval_secs: parse_or(&get, "REMINDER_INTERVAL_SECS", 15 * 60)?,
            cleanup_interval_secs: parse_or(&get, "CLEANUP_INTERVAL_SECS", 60 * 60)?,
        })
    }

    pub fn business_offset(&self) -> FixedOffset {
        // validated to -12..=14 hours in from_lookup
        FixedOffset::east_opt(self.business_utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_apply_when_only_required_keys_set() {
        let cfg = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pqr"),
            ("JWT_SECRET", SECRET),
        ]))
        .unwrap();

        assert_eq!(cfg.database_provider, DatabaseProvider::Postgres);
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.business_utc_offset_hours, -5);
        assert_eq!(cfg.default_country_code, "57");
        assert_eq!(cfg.gateway_max_attempts, 3);
        assert!(cfg.whatsapp_gateway_url.is_none());
        assert!(cfg.run_migrations);
    }

    #[test]
    fn missing_database_url_is_an_error() {
        assert!(Config::from_lookup(lookup(&[("JWT_SECRET", SECRET)])).is_err());
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let res = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pqr"),
            ("JWT_SECRET", "short"),
        ]));
        assert!(res.is_err());
    }

    #[test]
    fn malformed_number_is_not_silently_defaulted() {
        let res = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pqr"),
            ("JWT_SECRET", SECRET),
            ("GATEWAY_MAX_ATTEMPTS", "three"),
        ]));
        assert!(res.is_err());
    }

    #[test]
    fn gateway_urls_lose_trailing_slash_and_country_code_loses_plus() {
        let cfg = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pqr"),
            ("JWT_SECRET", SECRET),
            ("WHATSAPP_GATEWAY_URL", "http://localhost:3001/"),
            ("DEFAULT_COUNTRY_CODE", "+34"),
            ("DATABASE_PROVIDER", "PostgreSQL"),
        ]))
        .unwrap();

        assert_eq!(cfg.whatsapp_gateway_url.as_deref(), Some("http://localhost:3001"));
        assert_eq!(cfg.default_country_code, "34");
        assert_eq!(cfg.business_offset().local_minus_utc(), -5 * 3600);
    }
}
