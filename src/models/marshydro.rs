//! Wire models for the Mars Hydro / iFresh cloud API.
//!
//! Scope: types only, plus the conversion from raw vendor records into the
//! typed [`Device`] union.
//!
//! Notes
//! - The vendor is loose with scalar types (ids and readings arrive as numbers
//!   or strings, flags as booleans or 0/1). The visitors below accept both and
//!   reject anything else at the decode boundary.
//! - Response codes are opaque strings and never parsed as integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================
// Scalar newtypes
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = DeviceId;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "an integer or a string holding an integer for DeviceId")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(DeviceId(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                i64::try_from(value)
                    .map(DeviceId)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Unsigned(value), &self))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value
                    .trim()
                    .parse::<i64>()
                    .map(DeviceId)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// A raw sensor reading, kept verbatim as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Reading(pub String);

impl Reading {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.trim().parse::<f64>().ok()
    }
}

impl From<&str> for Reading {
    fn from(value: &str) -> Self {
        Reading(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Reading;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a string or a number for a sensor reading")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Reading(value.to_string()))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Reading(value.to_string()))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Reading(value.to_string()))
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Reading(value.to_string()))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Flag that arrives as `true`/`false` or `1`/`0`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Flag(pub bool);

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Flag;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a boolean or 0/1")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Flag(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value {
                    0 => Ok(Flag(false)),
                    1 => Ok(Flag(true)),
                    other => Err(E::invalid_value(serde::de::Unexpected::Signed(other), &self)),
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value {
                    0 => Ok(Flag(false)),
                    1 => Ok(Flag(true)),
                    other => Err(E::invalid_value(serde::de::Unexpected::Unsigned(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// Percentage (0..=100) that arrives as a number or a numeric string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Percent(pub u8);

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = Percent;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a percentage between 0 and 100")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value <= 100 {
                    Ok(Percent(value as u8))
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Unsigned(value), &self))
                }
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if (0..=100).contains(&value) {
                    Ok(Percent(value as u8))
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Signed(value), &self))
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if (0.0..=100.0).contains(&value) {
                    Ok(Percent(value.round() as u8))
                } else {
                    Err(E::invalid_value(serde::de::Unexpected::Float(value), &self))
                }
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value.trim().parse::<u8>() {
                    Ok(n) if n <= 100 => Ok(Percent(n)),
                    _ => Err(E::invalid_value(serde::de::Unexpected::Str(value), &self)),
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}

// =====================
// Envelopes
// =====================

/// Per-request metadata sent in the `systemData` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    pub req_id: i64,
    pub app_version: String,
    pub os_type: String,
    pub os_version: String,
    pub device_type: String,
    pub net_type: String,
    pub wifi_name: String,
    pub timestamp: i64,
    pub timezone: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The app identity the client presents to the vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub app_version: String,
    pub os_type: String,
    pub os_version: String,
    pub device_type: String,
    pub net_type: String,
    pub wifi_name: String,
    pub timezone: String,
    pub language: String,
}

impl Default for ClientProfile {
    fn default() -> Self {
        ClientProfile {
            app_version: "1.2.0".into(),
            os_type: "android".into(),
            os_version: "14".into(),
            device_type: "SM-S928C".into(),
            net_type: "wifi".into(),
            wifi_name: "123".into(),
            timezone: "UTC".into(),
            language: "English".into(),
        }
    }
}

impl SystemData {
    /// Builds the request envelope. Pure: everything variable is a parameter.
    pub fn build(
        now: DateTime<Utc>,
        token: Option<&str>,
        device_id: Option<DeviceId>,
        profile: &ClientProfile,
    ) -> Self {
        SystemData {
            req_id: now.timestamp_millis(),
            app_version: profile.app_version.clone(),
            os_type: profile.os_type.clone(),
            os_version: profile.os_version.clone(),
            device_type: profile.device_type.clone(),
            net_type: profile.net_type.clone(),
            wifi_name: profile.wifi_name.clone(),
            timestamp: now.timestamp(),
            timezone: profile.timezone.clone(),
            language: profile.language.clone(),
            device_id,
            token: token.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    InvalidCredentials,
    TokenExpired,
    Other(String),
}

impl ResponseCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "000" => ResponseCode::Success,
            "100" => ResponseCode::InvalidCredentials,
            "102" => ResponseCode::TokenExpired,
            other => ResponseCode::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ResponseCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = ResponseCode;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "a response code")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ResponseCode::from_wire(value))
            }

            // Numeric codes lose their leading zeros, so they never match a known code.
            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ResponseCode::Other(value.to_string()))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ResponseCode::Other(value.to_string()))
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiResponse {
    pub code: ResponseCode,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

// =====================
// Request bodies
// =====================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub login_method: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListRequest {
    pub current_page: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetailRequest {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustLightRequest {
    pub light: u8,
    pub device_id: DeviceId,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LampSwitchRequest {
    pub is_close: bool,
    pub device_id: DeviceId,
    pub group_id: Option<i64>,
}

// =====================
// Response payloads
// =====================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginData {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceListPage {
    #[serde(default)]
    pub list: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductType {
    Light,
    Wind,
    Other(String),
}

impl ProductType {
    pub fn as_wire(&self) -> &str {
        match self {
            ProductType::Light => "LIGHT",
            ProductType::Wind => "WIND",
            ProductType::Other(s) => s,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ProductType::Other(_))
    }
}

impl Serialize for ProductType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for ProductType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "LIGHT" => ProductType::Light,
            "WIND" => ProductType::Wind,
            _ => ProductType::Other(s),
        })
    }
}

/// Device record as delivered by the list and detail endpoints.
/// Every field is optional here; [`Device::try_from_record`] decides what is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: Option<DeviceId>,
    pub product_type: Option<ProductType>,
    pub device_name: Option<String>,
    pub device_image: Option<String>,
    pub device_serialnum: Option<String>,
    pub device_version: Option<String>,
    pub connect_status: Option<Flag>,
    pub is_close: Option<Flag>,
    pub device_light_rate: Option<Percent>,
    pub speed: Option<u32>,
    pub temperature: Option<Reading>,
    pub humidity: Option<Reading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightState {
    pub is_close: bool,
    pub light_rate: Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanState {
    pub is_close: bool,
    pub speed_rate: Option<Percent>,
    pub speed: Option<u32>,
    /// Degrees Fahrenheit, as delivered.
    pub temperature: Option<Reading>,
    pub humidity: Option<Reading>,
}

impl FanState {
    pub fn temperature_celsius(&self) -> Option<f64> {
        let f = self.temperature.as_ref()?.as_f64()?;
        Some(((f - 32.0) * 5.0 / 9.0 * 10.0).round() / 10.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceKind {
    Light(LightState),
    Fan(FanState),
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub product_type: ProductType,
    pub serial: Option<String>,
    pub version: Option<String>,
    pub image: Option<String>,
    /// `None` when the vendor did not report connectivity.
    pub connected: Option<bool>,
    pub kind: DeviceKind,
}

/// A record lacked a field its product type requires, or could not be decoded at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub device: Option<DeviceId>,
    pub message: String,
}

impl core::fmt::Display for RecordError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.device {
            Some(id) => write!(f, "device {}: {}", id, self.message),
            None => write!(f, "device record: {}", self.message),
        }
    }
}

impl std::error::Error for RecordError {}

impl Device {
    /// Decodes a raw JSON record, reporting the JSON path of any type mismatch.
    pub fn from_value(value: &Value, fallback_id: Option<DeviceId>) -> Result<Self, RecordError> {
        let record: DeviceRecord = serde_path_to_error::deserialize(value).map_err(|e| RecordError {
            device: fallback_id,
            message: format!("invalid value at `{}`: {}", e.path(), e.inner()),
        })?;
        Device::try_from_record(record, fallback_id)
    }

    pub fn try_from_record(record: DeviceRecord, fallback_id: Option<DeviceId>) -> Result<Self, RecordError> {
        let id = record.id.or(fallback_id).ok_or_else(|| RecordError {
            device: None,
            message: "missing field `id`".to_string(),
        })?;
        let missing = |field: &str| RecordError {
            device: Some(id),
            message: format!("missing field `{}`", field),
        };

        let product_type = record.product_type.ok_or_else(|| missing("productType"))?;
        let kind = match &product_type {
            ProductType::Light => DeviceKind::Light(LightState {
                is_close: record.is_close.ok_or_else(|| missing("isClose"))?.0,
                light_rate: record.device_light_rate.ok_or_else(|| missing("deviceLightRate"))?,
            }),
            ProductType::Wind => DeviceKind::Fan(FanState {
                is_close: record.is_close.ok_or_else(|| missing("isClose"))?.0,
                speed_rate: record.device_light_rate,
                speed: record.speed,
                temperature: record.temperature,
                humidity: record.humidity,
            }),
            ProductType::Other(_) => DeviceKind::Unsupported,
        };

        Ok(Device {
            id,
            name: record.device_name.unwrap_or_else(|| format!("Mars Hydro {}", id)),
            product_type,
            serial: record.device_serialnum,
            version: record.device_version,
            image: record.device_image,
            connected: record.connect_status.map(|f| f.0),
            kind,
        })
    }

    /// Power state; `None` for unsupported product types.
    pub fn is_on(&self) -> Option<bool> {
        match &self.kind {
            DeviceKind::Light(l) => Some(!l.is_close),
            DeviceKind::Fan(f) => Some(!f.is_close),
            DeviceKind::Unsupported => None,
        }
    }

    pub fn as_fan(&self) -> Option<&FanState> {
        match &self.kind {
            DeviceKind::Fan(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<&LightState> {
        match &self.kind {
            DeviceKind::Light(l) => Some(l),
            _ => None,
        }
    }
}

/// Host-facing brightness (0..=255) to vendor percentage.
pub fn brightness_to_percent(value: u8) -> u8 {
    ((u32::from(value) * 100 + 127) / 255) as u8
}

/// Vendor percentage to host-facing brightness (0..=255), truncating.
pub fn percent_to_brightness(percent: Percent) -> u8 {
    (u32::from(percent.0.min(100)) * 255 / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn load_fixture(name: &str) -> Value {
        let json = std::fs::read_to_string(format!("tests/data/{}", name)).expect("fixture present");
        serde_json::from_str(&json).expect("parse fixture")
    }

    #[test]
    fn device_id_accepts_integer_and_numeric_string() {
        let a: DeviceId = serde_json::from_value(json!(42)).unwrap();
        let b: DeviceId = serde_json::from_value(json!("42")).unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_value::<DeviceId>(json!("abc")).is_err());
        assert!(serde_json::from_value::<DeviceId>(json!(true)).is_err());
    }

    #[test]
    fn readings_keep_their_text() {
        let r: Reading = serde_json::from_value(json!("-")).unwrap();
        assert_eq!(r.as_str(), "-");
        let r: Reading = serde_json::from_value(json!(71)).unwrap();
        assert_eq!(r.as_str(), "71");
        assert_eq!(r.as_f64(), Some(71.0));
    }

    #[test]
    fn response_code_is_opaque() {
        let resp: ApiResponse = serde_json::from_value(json!({"code": "102", "msg": "expired"})).unwrap();
        assert_eq!(resp.code, ResponseCode::TokenExpired);
        assert_eq!(resp.data, None);

        let resp: ApiResponse = serde_json::from_value(json!({"code": 0, "data": {}})).unwrap();
        assert_eq!(resp.code, ResponseCode::Other("0".into()));
    }

    #[test]
    fn system_data_is_built_from_parameters() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let profile = ClientProfile::default();
        let sd = SystemData::build(now, Some("tok"), Some(DeviceId(7)), &profile);
        assert_eq!(sd.req_id, now.timestamp() * 1000);
        assert_eq!(sd.timestamp, now.timestamp());

        let v = serde_json::to_value(&sd).unwrap();
        assert_eq!(v["reqId"], json!(now.timestamp_millis()));
        assert_eq!(v["osType"], json!("android"));
        assert_eq!(v["deviceId"], json!(7));
        assert_eq!(v["token"], json!("tok"));

        let anon = serde_json::to_value(SystemData::build(now, None, None, &profile)).unwrap();
        assert!(anon.get("token").is_none());
        assert!(anon.get("deviceId").is_none());
    }

    #[test]
    fn light_record_becomes_light_device() {
        let device = Device::from_value(&load_fixture("light-detail.json"), None).unwrap();
        assert_eq!(device.id, DeviceId(1));
        assert_eq!(device.product_type, ProductType::Light);
        assert_eq!(device.is_on(), Some(true));
        assert_eq!(device.as_light().unwrap().light_rate, Percent(80));
        assert_eq!(device.connected, Some(true));
    }

    #[test]
    fn fan_record_keeps_sensor_readings() {
        let device = Device::from_value(&load_fixture("fan-detail.json"), None).unwrap();
        let fan = device.as_fan().expect("fan");
        assert_eq!(fan.temperature.as_ref().map(Reading::as_str), Some("77"));
        assert_eq!(fan.humidity.as_ref().map(Reading::as_str), Some("55"));
        assert_eq!(fan.temperature_celsius(), Some(25.0));
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let err = Device::from_value(&json!({"id": 3, "productType": "LIGHT", "isClose": false}), None).unwrap_err();
        assert_eq!(err.device, Some(DeviceId(3)));
        assert!(err.message.contains("deviceLightRate"), "{}", err);
    }

    #[test]
    fn bad_scalar_reports_json_path() {
        let err = Device::from_value(&json!({"id": 3, "productType": "WIND", "isClose": 7}), None).unwrap_err();
        assert!(err.message.contains("isClose"), "{}", err);
    }

    #[test]
    fn fallback_id_fills_missing_id() {
        let device = Device::from_value(&json!({"productType": "OVEN"}), Some(DeviceId(9))).unwrap();
        assert_eq!(device.id, DeviceId(9));
        assert_eq!(device.kind, DeviceKind::Unsupported);
        assert!(!device.product_type.is_supported());
    }

    #[test]
    fn brightness_conversions() {
        assert_eq!(brightness_to_percent(255), 100);
        assert_eq!(brightness_to_percent(0), 0);
        assert_eq!(brightness_to_percent(128), 50);
        assert_eq!(percent_to_brightness(Percent(100)), 255);
        assert_eq!(percent_to_brightness(Percent(50)), 127);
    }
}
