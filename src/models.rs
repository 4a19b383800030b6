//! Data models.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AvlRecorderError;

/// International Mobile Equipment Identity.
///
/// Teltonika trackers identify themselves with a 15-digit decimal IMEI in
/// the login frame. The IMEI is the device's stable identity and the
/// primary key of the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Imei(String);

impl Imei {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Imei {
    type Error = AvlRecorderError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() == 15 && value.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Imei(value.to_string()))
        } else {
            Err(AvlRecorderError::InvalidImei(value.to_string()))
        }
    }
}

impl TryFrom<String> for Imei {
    type Error = AvlRecorderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Imei::try_from(value.as_str())
    }
}

impl From<Imei> for String {
    fn from(imei: Imei) -> Self {
        imei.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracker known to the operator.
///
/// Only devices with `approved == true` may transmit data; everything else
/// is rejected at login. Operator-supplied fields are free-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub imei: Imei,
    #[serde(default = "default_modem_type")]
    pub modem_type: String,
    /// Vehicle Identification Number, observed from IO element 256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_millis_opt"
    )]
    pub last_seen: Option<DateTime<Utc>>,
}

pub fn default_modem_type() -> String {
    "FMC003".to_string()
}

impl Device {
    /// New unapproved device with server-clock timestamps.
    pub fn new(imei: Imei, now: DateTime<Utc>) -> Self {
        Self {
            imei,
            modem_type: default_modem_type(),
            vin: None,
            approved: false,
            car_brand: None,
            car_model: None,
            plate_number: None,
            notes: None,
            created_at: now,
            updated_at: now,
            last_seen: None,
        }
    }
}

/// Captured frame bytes, kept verbatim for forensics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    pub imei: Imei,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    pub modem_type: String,
    pub raw_hex: String,
    /// Server receive time.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// GPS element of an AVL record.
///
/// Latitude and longitude arrive as signed integers scaled by 10^7; they
/// are stored in decimal degrees. `speed` is the GPS-derived speed in
/// km/h, distinct from the OBD vehicle speed (IO 37).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: i32,
    /// Heading in degrees, 0-359.
    pub angle: u16,
    /// Number of visible satellites, 0-32. Zero means no fix.
    pub satellites: u8,
    /// GPS speed in km/h.
    pub speed: u16,
}

/// A single decoded IO element value.
///
/// 8-byte IO groups can exceed 2^53, so integers are carried as native
/// 64-bit values rather than doubles; serde_json emits them losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IoValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl IoValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            IoValue::Unsigned(v) => Some(*v),
            IoValue::Signed(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IoValue::Unsigned(v) => i64::try_from(*v).ok(),
            IoValue::Signed(v) => Some(*v),
            IoValue::Text(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_i64().map(|v| v as f64)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            IoValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One IO element as emitted by the device, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoElement {
    pub id: u16,
    pub name: String,
    pub value: IoValue,
    /// Payload width in bytes. Variable-length (NX) elements carry their
    /// actual payload length.
    pub size: u16,
}

/// One decoded and normalized AVL sample.
///
/// `(imei, timestamp)` is unique; replays of the same sample are skipped
/// silently at the store. Known IO ids are additionally projected to named
/// top-level fields (see `normalizer::IO_DEFINITIONS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub imei: Imei,
    /// Device-supplied sample time, canonical `YYYY-MM-DDTHH:MM:SS.sssZ`
    /// so lexicographic order equals chronological order.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    /// 0 = low, 1 = high, 2 = panic.
    pub priority: u8,
    pub gps: GpsPosition,
    pub io_elements: Vec<IoElement>,
    /// Named projections of known IO ids.
    #[serde(flatten)]
    pub fields: BTreeMap<String, IoValue>,
}

impl Record {
    fn field_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(IoValue::as_i64)
    }

    pub fn ignition(&self) -> Option<i64> {
        self.field_i64("ignition")
    }

    pub fn movement(&self) -> Option<i64> {
        self.field_i64("movement")
    }

    pub fn engine_rpm(&self) -> Option<i64> {
        self.field_i64("obdEngineRpm")
    }

    pub fn total_odometer(&self) -> Option<i64> {
        self.field_i64("totalOdometer")
    }

    pub fn fuel_used_gps(&self) -> Option<i64> {
        self.field_i64("fuelUsedGps")
    }

    pub fn accelerometer_x(&self) -> Option<i64> {
        self.field_i64("accelerometerX")
    }

    pub fn accelerometer_y(&self) -> Option<i64> {
        self.field_i64("accelerometerY")
    }

    pub fn vin(&self) -> Option<&str> {
        self.fields.get("vin").and_then(IoValue::as_text)
    }

    /// Engine-on predicate used by trip segmentation.
    pub fn engine_on(&self) -> bool {
        self.ignition() == Some(1) || self.engine_rpm().map_or(false, |rpm| rpm > 0)
    }

    /// Speed in km/h, preferring the OBD vehicle speed over the GPS one.
    pub fn speed(&self) -> f64 {
        self.field_i64("obdVehicleSpeed")
            .map(|v| v as f64)
            .unwrap_or(f64::from(self.gps.speed))
    }
}

/// Serde helper: fixed-width millisecond ISO-8601 UTC timestamps.
///
/// The canonical form is required so that string comparison in the store
/// matches chronological order.
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn to_string(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_string(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Serde helper: optional variant of [`iso_millis`].
pub mod iso_millis_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => serializer.serialize_str(&super::iso_millis::to_string(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
