//! Readable decoration of vendor payloads.
//!
//! The vendor reports millisecond epoch timestamps and numeric enum codes.
//! Device-facing consoles for this platform run in UTC+8, so formatted
//! timestamps carry both UTC and UTC+8 renderings, matching what operators
//! see in the vendor console.

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Value, json};

const UTC8_OFFSET_SECS: i32 = 8 * 3600;

/// Formats a millisecond epoch timestamp as `"… UTC / … UTC+8"`.
/// Zero and absent timestamps render as `"N/A"` — the vendor uses 0 for
/// "never".
pub fn format_timestamp_ms(timestamp_ms: Option<i64>) -> String {
    let Some(ms) = timestamp_ms.filter(|ms| *ms != 0) else {
        return "N/A".to_string();
    };
    let Some(utc) = DateTime::<Utc>::from_timestamp_millis(ms) else {
        return format!("Error: Invalid timestamp ({ms})");
    };
    let Some(offset) = FixedOffset::east_opt(UTC8_OFFSET_SECS) else {
        return format!("{} UTC", utc.format("%Y-%m-%d %H:%M:%S"));
    };
    let utc8 = utc.with_timezone(&offset);
    format!(
        "{} UTC / {} UTC+8",
        utc.format("%Y-%m-%d %H:%M:%S"),
        utc8.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Pulls a millisecond timestamp out of a vendor JSON field, which may be a
/// number or a numeric string depending on the endpoint.
pub fn timestamp_ms(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            s.parse::<f64>().ok().map(|f| f as i64)
        }),
        _ => None,
    }
}

pub fn auth_mode_label(code: Option<i64>) -> String {
    match code {
        Some(0) => "Dynamic Authentication".to_string(),
        Some(1) => "Static Authentication".to_string(),
        Some(2) => "X509 Authentication".to_string(),
        other => unknown_label(other),
    }
}

pub fn data_format_label(code: Option<i64>) -> String {
    match code {
        Some(0) => "Transparent Transmission".to_string(),
        Some(3) => "Thing Model".to_string(),
        other => unknown_label(other),
    }
}

pub fn access_type_label(code: Option<i64>) -> String {
    match code {
        Some(0) => "Direct Device".to_string(),
        Some(1) => "Gateway Device".to_string(),
        Some(2) => "Gateway Sub-device".to_string(),
        other => unknown_label(other),
    }
}

/// Network way arrives as a string code from the vendor.
pub fn network_way_label(code: Option<&str>) -> String {
    match code {
        Some("1") => "WiFi".to_string(),
        Some("2") => "Cellular (2G/3G/4G/5G)".to_string(),
        Some("3") => "NB-IoT".to_string(),
        Some("4") => "LoRa".to_string(),
        Some("5") => "Ethernet".to_string(),
        Some("6") => "Other".to_string(),
        None => "Not Specified".to_string(),
        Some(other) => format!("Unknown ({other})"),
    }
}

pub fn direction_label(code: Option<i64>) -> String {
    match code {
        Some(1) => "Uplink".to_string(),
        Some(2) => "Downlink".to_string(),
        other => unknown_label(other),
    }
}

pub fn send_status_label(code: Option<i64>) -> String {
    match code {
        Some(0) => "Not Sent".to_string(),
        Some(1) => "Sent".to_string(),
        Some(-1) => "Send Failed".to_string(),
        other => unknown_label(other),
    }
}

pub fn event_type_label(code: Option<i64>) -> String {
    match code {
        Some(0) => "Offline".to_string(),
        Some(1) => "Online".to_string(),
        Some(2) => "Reconnect".to_string(),
        Some(3) => "Information".to_string(),
        Some(4) => "Alert".to_string(),
        Some(5) => "Fault".to_string(),
        Some(6) => "Reset".to_string(),
        other => unknown_label(other),
    }
}

fn unknown_label(code: Option<i64>) -> String {
    match code {
        Some(code) => format!("Unknown ({code})"),
        None => "Not Specified".to_string(),
    }
}

/// Adds `formatted<Field>` companions for the named millisecond-timestamp
/// fields of a vendor object. Non-object values pass through untouched.
pub fn decorate_timestamps(value: &mut Value, fields: &[&str]) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    let mut formatted = Map::new();
    for field in fields {
        if object.contains_key(*field) {
            let rendered = format_timestamp_ms(timestamp_ms(object.get(*field)));
            formatted.insert(formatted_key(field), Value::String(rendered));
        }
    }
    object.extend(formatted);
}

/// Adds human-readable labels for a product's enum-coded fields.
pub fn decorate_product(product: &mut Value) {
    decorate_timestamps(product, &["createTime", "updateTime"]);
    let Some(object) = product.as_object_mut() else {
        return;
    };
    let labels = json!({
        "accessType": access_type_label(object.get("accessType").and_then(Value::as_i64)),
        "dataFmt": data_format_label(object.get("dataFmt").and_then(Value::as_i64)),
        "netWay": network_way_label(object.get("netWay").and_then(Value::as_str)),
    });
    object.insert("labels".to_string(), labels);
}

/// Adds formatted timestamps and auth-mode label to a device overview or
/// detail object.
pub fn decorate_device(device: &mut Value) {
    decorate_timestamps(
        device,
        &[
            "createTime",
            "activedTime",
            "updateTime",
            "firstConnTime",
            "lastConnTime",
            "lastOfflineTime",
        ],
    );
    let Some(object) = device.as_object_mut() else {
        return;
    };
    if object.contains_key("authMode") {
        let label = auth_mode_label(object.get("authMode").and_then(Value::as_i64));
        object.insert("authModeLabel".to_string(), Value::String(label));
    }
}

pub fn decorate_location(location: &mut Value) {
    decorate_timestamps(location, &["locateTime"]);
}

/// `createTime` → `formattedCreateTime`, the key shape downstream consumers
/// of this server already rely on.
fn formatted_key(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => format!("formatted{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => "formatted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timestamp_renders_both_zones() {
        let rendered = format_timestamp_ms(Some(1_700_000_000_000));
        assert_eq!(rendered, "2023-11-14 22:13:20 UTC / 2023-11-15 06:13:20 UTC+8");
    }

    #[test]
    fn zero_and_absent_timestamps_render_not_available() {
        assert_eq!(format_timestamp_ms(Some(0)), "N/A");
        assert_eq!(format_timestamp_ms(None), "N/A");
    }

    #[test]
    fn timestamp_ms_accepts_numbers_and_numeric_strings() {
        assert_eq!(timestamp_ms(Some(&json!(1700000000000_i64))), Some(1_700_000_000_000));
        assert_eq!(timestamp_ms(Some(&json!("1700000000000"))), Some(1_700_000_000_000));
        assert_eq!(timestamp_ms(Some(&json!(1.7e12))), Some(1_700_000_000_000));
        assert_eq!(timestamp_ms(Some(&json!(true))), None);
        assert_eq!(timestamp_ms(None), None);
    }

    #[test]
    fn vendor_code_labels_match_console_wording() {
        assert_eq!(auth_mode_label(Some(1)), "Static Authentication");
        assert_eq!(access_type_label(Some(2)), "Gateway Sub-device");
        assert_eq!(data_format_label(Some(3)), "Thing Model");
        assert_eq!(network_way_label(Some("3")), "NB-IoT");
        assert_eq!(network_way_label(None), "Not Specified");
        assert_eq!(direction_label(Some(1)), "Uplink");
        assert_eq!(send_status_label(Some(-1)), "Send Failed");
        assert_eq!(auth_mode_label(Some(9)), "Unknown (9)");
    }

    #[test]
    fn decorate_device_adds_formatted_companions() {
        let mut device = json!({
            "deviceKey": "d1",
            "createTime": 1_700_000_000_000_i64,
            "lastConnTime": 0,
            "authMode": 0
        });
        decorate_device(&mut device);
        assert_eq!(
            device["formattedCreateTime"],
            "2023-11-14 22:13:20 UTC / 2023-11-15 06:13:20 UTC+8"
        );
        assert_eq!(device["formattedLastConnTime"], "N/A");
        assert_eq!(device["authModeLabel"], "Dynamic Authentication");
        // Fields the payload never had are not invented.
        assert!(device.get("formattedUpdateTime").is_none());
    }

    #[test]
    fn decorate_product_adds_label_block() {
        let mut product = json!({
            "productKey": "p1",
            "accessType": 0,
            "dataFmt": 3,
            "netWay": "2",
            "createTime": 1_700_000_000_000_i64
        });
        decorate_product(&mut product);
        assert_eq!(product["labels"]["accessType"], "Direct Device");
        assert_eq!(product["labels"]["dataFmt"], "Thing Model");
        assert_eq!(product["labels"]["netWay"], "Cellular (2G/3G/4G/5G)");
        assert!(product["formattedCreateTime"].is_string());
    }

    #[test]
    fn decorate_tolerates_non_object_payloads() {
        let mut value = json!("not an object");
        decorate_device(&mut value);
        assert_eq!(value, json!("not an object"));
    }
}
