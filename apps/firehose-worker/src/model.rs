use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Registered tenant, one row of the `tenants` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    /// Opaque upstream credential. Empty means the tenant cannot stream.
    pub api_key: String,
    pub is_active: bool,
    pub last_seen: i64,
}

impl Tenant {
    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalType {
    #[serde(rename = "UWB")]
    Uwb,
    #[serde(rename = "BLE")]
    Ble,
}

/// A classified event waiting to be written by the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub tenant_id: String,
    pub device_id: String,
    pub timestamp: i64,
    pub event_type: String,
    pub compute_type: String,
    pub signal_type: SignalType,
    pub details: JsonValue,
}

/// Stored event as returned to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEvent {
    pub id: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub timestamp: i64,
    pub event_type: String,
    pub compute_type: String,
    pub details: JsonValue,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Trims whitespace and strips quote characters pasted along with tenant ids.
pub fn clean_tenant_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|ch| *ch != '"' && *ch != '\'')
        .collect::<String>()
        .trim()
        .to_string()
}
