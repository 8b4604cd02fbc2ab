//! User configuration file handling.
//!
//! The JSON file is produced by the companion desktop UI, so the field
//! names follow its PascalCase model and every field is optional with a
//! sensible default.

use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tixrace_cdp_session::Credentials;
use tixrace_core_types::{DesiredTicket, SeatMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("SaleTime {0:?} is not an ISO-8601 timestamp")]
    BadSaleTime(String),
    #[error("TicketUrl is missing")]
    MissingUrl,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub ticket_name1: String,
    pub ticket_name2: String,
    pub ticket_price: String,
    pub ticket_quantity: String,
    pub ticket_url: String,
    pub is_auto_allocation: bool,
    pub is_auto_payment: bool,
    pub sale_time: String,
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn ticket_url(&self) -> Result<&str, ConfigError> {
        let url = self.ticket_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        Ok(url)
    }

    pub fn desired_ticket(&self) -> DesiredTicket {
        let seat_mode = if self.is_auto_allocation {
            SeatMode::AutoAllocate
        } else {
            SeatMode::ManualSeat
        };
        DesiredTicket::from_user_input(
            &self.ticket_name1,
            &self.ticket_name2,
            &self.ticket_price,
            &self.ticket_quantity,
            seat_mode,
        )
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.username.trim();
        let password = self.password.trim();
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Sale-open instant as unix milliseconds. RFC 3339 with an offset (or
    /// `Z`) is canonical; a bare local timestamp is accepted as a fallback.
    pub fn sale_target_ms(&self) -> Result<Option<i64>, ConfigError> {
        let raw = self.sale_time.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(instant.timestamp_millis()));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                if let Some(local) = Local.from_local_datetime(&naive).single() {
                    return Ok(Some(local.timestamp_millis()));
                }
            }
        }
        Err(ConfigError::BadSaleTime(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UserConfig {
        serde_json::from_str(
            r#"{
                "Username": "buyer@example.com",
                "Password": "hunter2",
                "TicketName1": "VIP",
                "TicketName2": "",
                "TicketPrice": "1800",
                "TicketQuantity": "2",
                "TicketUrl": "https://kktix.com/events/x/registrations/new",
                "IsAutoAllocation": true,
                "IsAutoPayment": false,
                "SaleTime": "2026-09-01T12:00:00+08:00"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_the_ui_field_names() {
        let cfg = sample();
        assert_eq!(cfg.ticket_name1, "VIP");
        assert_eq!(cfg.ticket_quantity, "2");
        assert!(cfg.is_auto_allocation);
        assert!(!cfg.is_auto_payment);
    }

    #[test]
    fn missing_fields_default() {
        let cfg: UserConfig = serde_json::from_str(r#"{"TicketUrl": "https://kktix.com/x"}"#).unwrap();
        assert_eq!(cfg.ticket_quantity, "");
        assert!(cfg.credentials().is_none());
        assert!(cfg.sale_target_ms().unwrap().is_none());
    }

    #[test]
    fn desired_ticket_reflects_the_config() {
        let desired = sample().desired_ticket();
        assert_eq!(desired.name1.as_deref(), Some("VIP"));
        assert_eq!(desired.name2, None);
        assert_eq!(desired.price, Some(1800));
        assert_eq!(desired.seat_mode, SeatMode::AutoAllocate);
        assert_eq!(desired.quantity, "2");
    }

    #[test]
    fn sale_time_accepts_offset_and_zulu() {
        let mut cfg = sample();
        let with_offset = cfg.sale_target_ms().unwrap().unwrap();

        cfg.sale_time = "2026-09-01T04:00:00Z".to_string();
        let zulu = cfg.sale_target_ms().unwrap().unwrap();
        assert_eq!(with_offset, zulu);
    }

    #[test]
    fn garbage_sale_time_is_rejected() {
        let mut cfg = sample();
        cfg.sale_time = "next tuesday".to_string();
        assert!(matches!(
            cfg.sale_target_ms(),
            Err(ConfigError::BadSaleTime(_))
        ));
    }

    #[test]
    fn blank_url_is_rejected() {
        let cfg = UserConfig::default();
        assert!(matches!(cfg.ticket_url(), Err(ConfigError::MissingUrl)));
    }
}
