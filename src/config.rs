use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use std::time::Duration;

use crate::location::Position;

const DEFAULT_API_BASE: &str = "http://api.pugetsound.onebusaway.org";
const DEFAULT_PEER_HOST: &str = "127.0.0.1";
const DEFAULT_PEER_PORT: u16 = 61613;
const DEFAULT_STATUS_PORT: u16 = 3000;

/// Tunables for one relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_base_url: String,
    pub api_key: String,
    pub search_radius_m: u32,
    pub timezone: Tz,

    pub gps_timeout: Duration,
    pub gps_max_age: Duration,

    pub link_max_attempts: u32,
    pub link_retry_base: Duration,
    pub link_ack_timeout: Duration,

    pub http_max_attempts: u32,
    pub http_retry_base: Duration,
    pub http_request_timeout: Duration,

    pub max_stops: usize,

    pub peer_host: String,
    pub peer_port: u16,
    pub status_port: u16,
    pub fixed_position: Option<Position>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            search_radius_m: 250,
            timezone: chrono_tz::America::Los_Angeles,
            gps_timeout: Duration::from_millis(15_000),
            gps_max_age: Duration::from_millis(60_000),
            link_max_attempts: 7,
            link_retry_base: Duration::from_millis(2_000),
            link_ack_timeout: Duration::from_millis(2_000),
            http_max_attempts: 7,
            http_retry_base: Duration::from_millis(2_000),
            http_request_timeout: Duration::from_millis(7_500),
            max_stops: 50,
            peer_host: DEFAULT_PEER_HOST.to_string(),
            peer_port: DEFAULT_PEER_PORT,
            status_port: DEFAULT_STATUS_PORT,
            fixed_position: None,
        }
    }
}

impl RelayConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.api_key = lookup("OBA_API_KEY").context("OBA_API_KEY not set")?;
        if let Some(base) = lookup("OBA_BASE_URL") {
            config.api_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(radius) = lookup("BUSRELAY_RADIUS") {
            config.search_radius_m = radius
                .parse()
                .with_context(|| format!("Invalid BUSRELAY_RADIUS: {}", radius))?;
        }
        if let Some(tz) = lookup("BUSRELAY_TZ") {
            config.timezone = tz
                .parse::<Tz>()
                .map_err(|e| anyhow!("Invalid BUSRELAY_TZ {}: {}", tz, e))?;
        }
        if let Some(host) = lookup("BUSRELAY_PEER_HOST") {
            config.peer_host = host;
        }
        if let Some(port) = lookup("BUSRELAY_PEER_PORT") {
            config.peer_port = port
                .parse()
                .with_context(|| format!("Invalid BUSRELAY_PEER_PORT: {}", port))?;
        }
        if let Some(port) = lookup("PORT") {
            config.status_port = port
                .parse()
                .with_context(|| format!("Invalid PORT: {}", port))?;
        }

        config.fixed_position = match (lookup("BUSRELAY_LAT"), lookup("BUSRELAY_LON")) {
            (Some(lat), Some(lon)) => Some(Position {
                lat: lat
                    .parse()
                    .with_context(|| format!("Invalid BUSRELAY_LAT: {}", lat))?,
                lon: lon
                    .parse()
                    .with_context(|| format!("Invalid BUSRELAY_LON: {}", lon))?,
            }),
            (None, None) => None,
            _ => return Err(anyhow!("BUSRELAY_LAT and BUSRELAY_LON must be set together")),
        };

        Ok(config)
    }
}
