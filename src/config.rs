use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::{Minutes, OpeningHours};

/// Id used for the room when `ROOMHOLD_ROOM_ID` is unset.
pub const DEFAULT_ROOM_ID: Ulid = Ulid(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Rules applied to every booking request.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Start times and durations are multiples of this.
    pub slot_minutes: Minutes,
    pub min_duration_minutes: Minutes,
    pub max_duration_minutes: Minutes,
    /// How many days ahead a booking may start.
    pub max_lead_days: i64,
    pub non_member_hourly_rate: u64,
    /// Upper bound on each calendar/payment/directory call.
    pub gateway_timeout: Duration,
    /// Release unpaid non-member reservations after this long. `None` keeps them.
    pub pending_payment_ttl: Option<Duration>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            slot_minutes: 30,
            min_duration_minutes: 30,
            max_duration_minutes: 8 * 60,
            max_lead_days: 90,
            non_member_hourly_rate: 2_000,
            gateway_timeout: Duration::from_secs(3),
            pending_payment_ttl: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub id: Ulid,
    pub name: String,
    pub calendar_id: String,
    pub hours: OpeningHours,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_ROOM_ID,
            name: "Meeting room".into(),
            calendar_id: "meeting-room".into(),
            hours: OpeningHours {
                opens: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
                closes: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// JSON file with the membership directory. Empty directory when unset.
    pub members_file: Option<PathBuf>,
    pub cache_refresh_interval: Duration,
    pub cache_horizon_days: i64,
    pub room: RoomConfig,
    pub policy: BookingPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7450,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            members_file: None,
            cache_refresh_interval: Duration::from_secs(60),
            cache_horizon_days: 14,
            room: RoomConfig::default(),
            policy: BookingPolicy::default(),
        }
    }
}

impl Config {
    /// Read `ROOMHOLD_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let hours = OpeningHours {
            opens: match get("ROOMHOLD_OPENS") {
                Some(v) => parse_time("ROOMHOLD_OPENS", &v)?,
                None => d.room.hours.opens,
            },
            closes: match get("ROOMHOLD_CLOSES") {
                Some(v) => parse_time("ROOMHOLD_CLOSES", &v)?,
                None => d.room.hours.closes,
            },
        };
        if hours.opens >= hours.closes {
            return Err(ConfigError::Inconsistent("opening time must be before closing time"));
        }

        let policy = BookingPolicy {
            slot_minutes: parse_or("ROOMHOLD_SLOT_MINUTES", get("ROOMHOLD_SLOT_MINUTES"), d.policy.slot_minutes)?,
            min_duration_minutes: parse_or(
                "ROOMHOLD_MIN_DURATION_MINUTES",
                get("ROOMHOLD_MIN_DURATION_MINUTES"),
                d.policy.min_duration_minutes,
            )?,
            max_duration_minutes: parse_or(
                "ROOMHOLD_MAX_DURATION_MINUTES",
                get("ROOMHOLD_MAX_DURATION_MINUTES"),
                d.policy.max_duration_minutes,
            )?,
            max_lead_days: parse_or("ROOMHOLD_MAX_LEAD_DAYS", get("ROOMHOLD_MAX_LEAD_DAYS"), d.policy.max_lead_days)?,
            non_member_hourly_rate: parse_or(
                "ROOMHOLD_NON_MEMBER_RATE",
                get("ROOMHOLD_NON_MEMBER_RATE"),
                d.policy.non_member_hourly_rate,
            )?,
            gateway_timeout: Duration::from_millis(parse_or(
                "ROOMHOLD_GATEWAY_TIMEOUT_MS",
                get("ROOMHOLD_GATEWAY_TIMEOUT_MS"),
                d.policy.gateway_timeout.as_millis() as u64,
            )?),
            pending_payment_ttl: get("ROOMHOLD_PENDING_TTL_SECS")
                .map(|v| parse("ROOMHOLD_PENDING_TTL_SECS", &v).map(Duration::from_secs))
                .transpose()?,
        };
        if policy.slot_minutes == 0 || policy.min_duration_minutes == 0 {
            return Err(ConfigError::Inconsistent("slot and minimum duration must be positive"));
        }
        if policy.min_duration_minutes > policy.max_duration_minutes {
            return Err(ConfigError::Inconsistent("minimum duration exceeds maximum duration"));
        }

        let room = RoomConfig {
            id: parse_or("ROOMHOLD_ROOM_ID", get("ROOMHOLD_ROOM_ID"), d.room.id)?,
            name: get("ROOMHOLD_ROOM_NAME").unwrap_or(d.room.name),
            calendar_id: get("ROOMHOLD_CALENDAR_ID").unwrap_or(d.room.calendar_id),
            hours,
        };

        Ok(Self {
            bind: get("ROOMHOLD_BIND").unwrap_or(d.bind),
            port: parse_or("ROOMHOLD_PORT", get("ROOMHOLD_PORT"), d.port)?,
            data_dir: get("ROOMHOLD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: get("ROOMHOLD_METRICS_PORT")
                .map(|v| parse("ROOMHOLD_METRICS_PORT", &v))
                .transpose()?,
            max_connections: parse_or(
                "ROOMHOLD_MAX_CONNECTIONS",
                get("ROOMHOLD_MAX_CONNECTIONS"),
                d.max_connections,
            )?,
            compact_threshold: parse_or(
                "ROOMHOLD_COMPACT_THRESHOLD",
                get("ROOMHOLD_COMPACT_THRESHOLD"),
                d.compact_threshold,
            )?,
            members_file: get("ROOMHOLD_MEMBERS_FILE").map(PathBuf::from),
            cache_refresh_interval: Duration::from_secs(parse_or(
                "ROOMHOLD_CACHE_REFRESH_SECS",
                get("ROOMHOLD_CACHE_REFRESH_SECS"),
                d.cache_refresh_interval.as_secs(),
            )?),
            cache_horizon_days: parse_or(
                "ROOMHOLD_CACHE_HORIZON_DAYS",
                get("ROOMHOLD_CACHE_HORIZON_DAYS"),
                d.cache_horizon_days,
            )?,
            room,
            policy,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => parse(key, &v),
        None => Ok(default),
    }
}

fn parse_time(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
