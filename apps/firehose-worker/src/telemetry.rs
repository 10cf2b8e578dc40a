use crate::model::{EventRow, SignalType};
use serde_json::{json, Map, Value as JsonValue};

pub const TELEMETRY_EVENT_TYPE: &str = "IOT_TELEMETRY";
pub const RANGING_COMPUTE_TYPE: &str = "CT_TDOA";
pub const DEFAULT_COMPUTE_TYPE: &str = "CT_RSSI";

const RANGING_TAGS: &[&str] = &[RANGING_COMPUTE_TYPE, "TDoA"];

/// The position chosen as authoritative for one telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSelection<'a> {
    pub position: Option<&'a JsonValue>,
    pub compute_type: String,
}

/// Turns one upstream record into an event row, or `None` when the record does
/// not describe a locatable device. Never panics on unexpected shapes.
pub fn classify(tenant_id: &str, record: &JsonValue, received_at_ms: i64) -> Option<EventRow> {
    let event_type = record.get("eventType").and_then(JsonValue::as_str)?;
    if event_type != TELEMETRY_EVENT_TYPE {
        return None;
    }
    let telemetry = record.get("iotTelemetry").and_then(JsonValue::as_object)?;
    let device_id = device_id(telemetry)?;

    let timestamp = record
        .get("recordTimestamp")
        .and_then(timestamp_millis)
        .unwrap_or(received_at_ms);

    let selection = select_position(telemetry);
    let precise = telemetry.get("precisePosition");
    let signal_type = if selection.position.is_some_and(is_strict_ranging)
        || precise.is_some_and(is_strict_ranging)
    {
        SignalType::Uwb
    } else {
        SignalType::Ble
    };

    let mut payload = telemetry.clone();
    if let Some(position) = selection.position {
        payload.insert("detectedPosition".to_string(), position.clone());
    }

    Some(EventRow {
        tenant_id: tenant_id.to_string(),
        device_id,
        timestamp,
        event_type: event_type.to_string(),
        compute_type: selection.compute_type,
        signal_type,
        details: json!({
            "iotTelemetry": JsonValue::Object(payload),
            "signalType": signal_type,
        }),
    })
}

/// Prefers a ranging fix from `allComputedPositions` over the primary
/// `detectedPosition`, which upstream often fills with a proximity estimate.
pub fn select_position(telemetry: &Map<String, JsonValue>) -> PositionSelection<'_> {
    let ranging = telemetry
        .get("allComputedPositions")
        .and_then(JsonValue::as_array)
        .and_then(|candidates| {
            candidates
                .iter()
                .filter(|candidate| candidate.is_object())
                .find(|candidate| compute_type(candidate).is_some_and(is_ranging_tag))
        });
    if let Some(position) = ranging {
        return PositionSelection {
            position: Some(position),
            compute_type: RANGING_COMPUTE_TYPE.to_string(),
        };
    }

    let detected = telemetry
        .get("detectedPosition")
        .filter(|value| value.is_object());
    let compute_type = detected
        .and_then(compute_type)
        .unwrap_or(DEFAULT_COMPUTE_TYPE)
        .to_string();
    PositionSelection {
        position: detected,
        compute_type,
    }
}

/// A ranging fix only counts when it carries a non-zero planar coordinate;
/// upstream reports `0,0` while a tag is still being located.
pub fn is_strict_ranging(position: &JsonValue) -> bool {
    if !compute_type(position).is_some_and(is_ranging_tag) {
        return false;
    }
    coordinate(position, "xPos") != 0.0 || coordinate(position, "yPos") != 0.0
}

fn is_ranging_tag(tag: &str) -> bool {
    RANGING_TAGS.contains(&tag)
}

fn compute_type(position: &JsonValue) -> Option<&str> {
    position
        .get("computeType")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn coordinate(position: &JsonValue, key: &str) -> f64 {
    position
        .get(key)
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)
}

fn device_id(telemetry: &Map<String, JsonValue>) -> Option<String> {
    let info = telemetry.get("deviceInfo").and_then(JsonValue::as_object)?;
    ["deviceMacAddress", "deviceId"]
        .iter()
        .filter_map(|key| info.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_lowercase)
}

fn timestamp_millis(value: &JsonValue) -> Option<i64> {
    let millis = match value {
        JsonValue::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|ms| ms as i64)),
        JsonValue::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (millis > 0).then_some(millis)
}
