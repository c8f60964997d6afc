//! Engine configuration that the decorator crate reads.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VeneerConfig {
    /// Timezone applied to date bucketing when a filter carries none.
    pub default_timezone: String,

    /// Page size used by `BatchCollection` when walking a collection.
    pub batch_size: usize,

    /// Emulated full scans larger than this are logged as warnings.
    pub emulation_warn_rows: usize,

    /// Optional cap on the number of keys in one batched relation fetch.
    pub max_relation_batch: Option<usize>,
}

impl Default for VeneerConfig {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            batch_size: 500,
            emulation_warn_rows: 10_000,
            max_relation_batch: None,
        }
    }
}

impl VeneerConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `VENEER_DEFAULT_TIMEZONE`: `UTC`, a fixed offset such as `+02:00`,
    ///   or an IANA name such as `Europe/Paris`
    /// - `VENEER_BATCH_SIZE`: batch page size
    /// - `VENEER_EMULATION_WARN_ROWS`: full-scan warning threshold
    /// - `VENEER_MAX_RELATION_BATCH`: max keys per relation fetch
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("VENEER_DEFAULT_TIMEZONE") {
            if parse_timezone(&s).is_ok() {
                cfg.default_timezone = s;
            }
        }

        if let Ok(s) = std::env::var("VENEER_BATCH_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                if v > 0 {
                    cfg.batch_size = v;
                }
            }
        }

        if let Ok(s) = std::env::var("VENEER_EMULATION_WARN_ROWS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.emulation_warn_rows = v;
            }
        }

        if let Ok(s) = std::env::var("VENEER_MAX_RELATION_BATCH") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_relation_batch = Some(v).filter(|&v| v > 0);
            }
        }

        cfg
    }

    /// Parse a YAML document; absent keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: VeneerConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.max_relation_batch == Some(0) {
            return Err(Error::Config(
                "max_relation_batch must be greater than 0 when set".into(),
            ));
        }
        parse_timezone(&self.default_timezone)?;
        Ok(())
    }
}

/// A timezone date bucketing runs in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timezone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Timezone {
    /// Calendar date of `instant` in this zone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Timezone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            Timezone::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }
}

/// `UTC`, `Z`, a fixed `±HH:MM` / `±HHMM` offset, or an IANA zone name.
pub fn parse_timezone(tz: &str) -> Result<Timezone> {
    let tz = tz.trim();
    let invalid = || Error::InvalidTimezone(tz.to_string());
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0).map(Timezone::Fixed).ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return tz.parse::<Tz>().map(Timezone::Named).map_err(|_| invalid()),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(Timezone::Fixed)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(seconds: i32) -> Timezone {
        Timezone::Fixed(FixedOffset::east_opt(seconds).unwrap())
    }

    #[test]
    fn parses_offsets_and_named_zones() {
        assert_eq!(parse_timezone("UTC").unwrap(), offset(0));
        assert_eq!(parse_timezone("+02:00").unwrap(), offset(7200));
        assert_eq!(parse_timezone("-0530").unwrap(), offset(-(5 * 3600 + 30 * 60)));
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap(),
            Timezone::Named(chrono_tz::Europe::Paris)
        );
        assert!(matches!(
            parse_timezone("Mars/Base"),
            Err(Error::InvalidTimezone(_))
        ));
        assert!(matches!(parse_timezone("+25:00"), Err(Error::InvalidTimezone(_))));
    }

    #[test]
    fn named_zones_follow_daylight_saving() {
        let paris = parse_timezone("Europe/Paris").unwrap();
        // 23:30 UTC is already the next day in Paris, winter (+01) and summer (+02).
        let winter = "2024-01-15T23:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let summer = "2024-07-15T22:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(paris.local_date(winter), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
        assert_eq!(paris.local_date(summer), NaiveDate::from_ymd_opt(2024, 7, 16).unwrap());
        let early = "2024-07-15T21:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(paris.local_date(early), NaiveDate::from_ymd_opt(2024, 7, 15).unwrap());
    }

    #[test]
    fn env_ignores_zero_sizes() {
        std::env::set_var("VENEER_BATCH_SIZE", "0");
        std::env::set_var("VENEER_MAX_RELATION_BATCH", "0");
        let cfg = VeneerConfig::from_env();
        std::env::remove_var("VENEER_BATCH_SIZE");
        std::env::remove_var("VENEER_MAX_RELATION_BATCH");
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.max_relation_batch, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn yaml_keeps_defaults_for_missing_keys() {
        let cfg = VeneerConfig::from_yaml_str("batch_size: 20\nmax_relation_batch: 100\n").unwrap();
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.max_relation_batch, Some(100));
        assert_eq!(cfg.default_timezone, "UTC");
        assert_eq!(cfg.emulation_warn_rows, 10_000);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(VeneerConfig::from_yaml_str("batch_size: 0").is_err());
        assert!(VeneerConfig::from_yaml_str("max_relation_batch: 0").is_err());
        assert!(VeneerConfig::from_yaml_str("default_timezone: Mars/Base").is_err());
        assert!(VeneerConfig::default().validate().is_ok());
    }
}
