//! Normalization of decoded IO elements to stable semantic field names.
//!
//! The canonical FMC003 mapping is defined as data: one row per known IO
//! id, with the projection name and how the raw payload is interpreted.
//! Unknown ids are retained in `ioElements` under a synthetic `IO_<id>`
//! name and are not projected.

use chrono::{DateTime, TimeZone, Utc};

use crate::codec::{AvlRecord, IoPayload, RawIo};
use crate::models::{GpsPosition, Imei, IoElement, IoValue, Record};

/// How the raw payload of a known IO id is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// Unsigned big-endian integer, kept as-is.
    Unsigned,
    /// 16-bit two's complement carried in an unsigned group
    /// (accelerometer axes).
    Signed16,
    /// ASCII payload with trailing NULs stripped (NX elements).
    Ascii,
}

/// One row of the canonical IO map.
#[derive(Debug, Clone, Copy)]
pub struct IoDefinition {
    pub id: u16,
    pub name: &'static str,
    pub kind: IoKind,
}

const fn def(id: u16, name: &'static str, kind: IoKind) -> IoDefinition {
    IoDefinition { id, name, kind }
}

/// Canonical FMC003 IO map, sorted by id.
///
/// Non-exhaustive by design: devices emit ids outside this table and they
/// are preserved verbatim. OBD-II parameters occupy 30..60 plus the OEM
/// pair 389/390.
pub static IO_DEFINITIONS: &[IoDefinition] = &[
    def(1, "digitalInput1", IoKind::Unsigned),
    def(11, "iccid1", IoKind::Unsigned),
    def(12, "fuelUsedGps", IoKind::Unsigned),
    def(13, "fuelRateGps", IoKind::Unsigned),
    def(14, "iccid2", IoKind::Unsigned),
    def(16, "totalOdometer", IoKind::Unsigned),
    def(17, "accelerometerX", IoKind::Signed16),
    def(18, "accelerometerY", IoKind::Signed16),
    def(19, "accelerometerZ", IoKind::Signed16),
    def(21, "gsmSignal", IoKind::Unsigned),
    def(24, "speedIO", IoKind::Unsigned),
    def(30, "obdDtcCount", IoKind::Unsigned),
    def(31, "obdEngineLoad", IoKind::Unsigned),
    def(32, "obdCoolantTemp", IoKind::Signed16),
    def(33, "obdShortFuelTrim", IoKind::Signed16),
    def(34, "obdFuelPressure", IoKind::Unsigned),
    def(35, "obdIntakeMap", IoKind::Unsigned),
    def(36, "obdEngineRpm", IoKind::Unsigned),
    def(37, "obdVehicleSpeed", IoKind::Unsigned),
    def(38, "obdTimingAdvance", IoKind::Signed16),
    def(39, "obdIntakeAirTemp", IoKind::Signed16),
    def(40, "obdMafRate", IoKind::Unsigned),
    def(41, "obdThrottlePosition", IoKind::Unsigned),
    def(42, "obdRuntimeSinceStart", IoKind::Unsigned),
    def(43, "obdDistanceWithMil", IoKind::Unsigned),
    def(44, "obdRelativeFuelRailPressure", IoKind::Unsigned),
    def(45, "obdDirectFuelRailPressure", IoKind::Unsigned),
    def(46, "obdCommandedEgr", IoKind::Unsigned),
    def(47, "obdEgrError", IoKind::Signed16),
    def(48, "obdFuelLevelInput", IoKind::Unsigned),
    def(49, "obdDistanceSinceCodesClear", IoKind::Unsigned),
    def(50, "obdBarometricPressure", IoKind::Unsigned),
    def(51, "obdControlModuleVoltage", IoKind::Unsigned),
    def(52, "obdAbsoluteLoad", IoKind::Unsigned),
    def(53, "obdAmbientAirTemp", IoKind::Signed16),
    def(54, "obdTimeWithMilOn", IoKind::Unsigned),
    def(55, "obdTimeSinceCodesClear", IoKind::Unsigned),
    def(56, "obdAbsoluteFuelRailPressure", IoKind::Unsigned),
    def(57, "obdHybridBatteryLife", IoKind::Unsigned),
    def(58, "obdEngineOilTemp", IoKind::Signed16),
    def(59, "obdFuelInjectionTiming", IoKind::Signed16),
    def(60, "obdFuelRate", IoKind::Unsigned),
    def(66, "externalVoltage", IoKind::Unsigned),
    def(67, "batteryVoltage", IoKind::Unsigned),
    def(68, "batteryCurrent", IoKind::Unsigned),
    def(80, "dataMode", IoKind::Unsigned),
    def(113, "batteryLevel", IoKind::Unsigned),
    def(181, "gnssPdop", IoKind::Unsigned),
    def(182, "gnssHdop", IoKind::Unsigned),
    def(199, "tripOdometer", IoKind::Unsigned),
    def(200, "sleepMode", IoKind::Unsigned),
    def(239, "ignition", IoKind::Unsigned),
    def(240, "movement", IoKind::Unsigned),
    def(241, "activeGsmOperator", IoKind::Unsigned),
    def(256, "vin", IoKind::Ascii),
    def(281, "faultCodes", IoKind::Ascii),
    def(385, "beacon", IoKind::Ascii),
    def(389, "obdTotalMileage", IoKind::Unsigned),
    def(390, "obdFuelLevel", IoKind::Unsigned),
];

/// Look up a known IO id.
pub fn lookup(id: u16) -> Option<&'static IoDefinition> {
    IO_DEFINITIONS
        .binary_search_by_key(&id, |d| d.id)
        .ok()
        .map(|idx| &IO_DEFINITIONS[idx])
}

/// Signed 16-bit reinterpretation of an unsigned group value.
fn signed16(value: u64) -> i64 {
    let v = (value & 0xFFFF) as i64;
    if v > 32767 {
        v - 65536
    } else {
        v
    }
}

fn ascii_value(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    bytes[..end]
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn interpret(io: &RawIo) -> (String, IoValue) {
    match (&io.payload, lookup(io.id)) {
        (IoPayload::Int(v), Some(d)) => {
            let value = match d.kind {
                IoKind::Signed16 => IoValue::Signed(signed16(*v)),
                _ => IoValue::Unsigned(*v),
            };
            (d.name.to_string(), value)
        }
        (IoPayload::Int(v), None) => (format!("IO_{}", io.id), IoValue::Unsigned(*v)),
        (IoPayload::Bytes(bytes), Some(d)) if d.kind == IoKind::Ascii => {
            (d.name.to_string(), IoValue::Text(ascii_value(bytes)))
        }
        (IoPayload::Bytes(bytes), Some(d)) => (d.name.to_string(), IoValue::Text(hex::encode(bytes))),
        (IoPayload::Bytes(bytes), None) => {
            (format!("IO_{}", io.id), IoValue::Text(hex::encode(bytes)))
        }
    }
}

/// Build a storable [`Record`] from one decoded AVL record.
///
/// Device timestamps that fall outside chrono's representable range are
/// clamped to the epoch rather than dropped; the raw capture still holds
/// the original bytes.
pub fn normalize(imei: &Imei, avl: &AvlRecord) -> Record {
    let timestamp = timestamp_from_ms(avl.timestamp_ms);

    let mut io_elements = Vec::with_capacity(avl.io.len());
    let mut fields = std::collections::BTreeMap::new();

    for io in &avl.io {
        let (name, value) = interpret(io);
        if !name.starts_with("IO_") {
            fields.insert(name.clone(), value.clone());
        }
        io_elements.push(IoElement {
            id: io.id,
            name,
            value,
            size: io.size,
        });
    }

    Record {
        imei: imei.clone(),
        timestamp,
        priority: avl.priority,
        gps: GpsPosition {
            latitude: f64::from(avl.gps.latitude) / 1e7,
            longitude: f64::from(avl.gps.longitude) / 1e7,
            altitude: i32::from(avl.gps.altitude),
            angle: avl.gps.angle,
            satellites: avl.gps.satellites,
            speed: avl.gps.speed,
        },
        io_elements,
        fields,
    }
}

pub fn timestamp_from_ms(ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

#[cfg(test)]
mod tests {
    use crate::codec::RawGps;

    use super::*;

    fn imei() -> Imei {
        Imei::try_from("864275079658715").unwrap()
    }

    fn avl_with_io(io: Vec<RawIo>) -> AvlRecord {
        AvlRecord {
            timestamp_ms: 1_704_067_200_000,
            priority: 1,
            gps: RawGps {
                longitude: 260_000_000,
                latitude: 440_000_000,
                altitude: 100,
                angle: 90,
                satellites: 9,
                speed: 50,
            },
            event_io_id: 0,
            io,
        }
    }

    #[test]
    fn table_is_sorted_by_id() {
        for pair in IO_DEFINITIONS.windows(2) {
            assert!(pair[0].id < pair[1].id, "table out of order at {}", pair[1].id);
        }
    }

    #[test]
    fn canonical_ids_are_present() {
        for (id, name) in [
            (16, "totalOdometer"),
            (17, "accelerometerX"),
            (18, "accelerometerY"),
            (19, "accelerometerZ"),
            (21, "gsmSignal"),
            (24, "speedIO"),
            (31, "obdEngineLoad"),
            (32, "obdCoolantTemp"),
            (36, "obdEngineRpm"),
            (37, "obdVehicleSpeed"),
            (48, "obdFuelLevelInput"),
            (60, "obdFuelRate"),
            (66, "externalVoltage"),
            (67, "batteryVoltage"),
            (113, "batteryLevel"),
            (181, "gnssPdop"),
            (182, "gnssHdop"),
            (199, "tripOdometer"),
            (239, "ignition"),
            (240, "movement"),
            (256, "vin"),
            (389, "obdTotalMileage"),
        ] {
            assert_eq!(lookup(id).map(|d| d.name), Some(name), "id {id}");
        }
    }

    #[test]
    fn accelerometer_values_are_signed() {
        let record = avl_with_io(vec![
            RawIo {
                id: 17,
                size: 2,
                payload: IoPayload::Int(65136), // -400 mG
            },
            RawIo {
                id: 18,
                size: 2,
                payload: IoPayload::Int(152),
            },
        ]);
        let normalized = normalize(&imei(), &record);
        assert_eq!(normalized.accelerometer_x(), Some(-400));
        assert_eq!(normalized.accelerometer_y(), Some(152));
    }

    #[test]
    fn gps_is_scaled_and_timestamp_canonical() {
        let record = avl_with_io(vec![]);
        let normalized = normalize(&imei(), &record);
        assert!((normalized.gps.latitude - 44.0).abs() < 1e-9);
        assert!((normalized.gps.longitude - 26.0).abs() < 1e-9);
        assert_eq!(
            crate::models::iso_millis::to_string(&normalized.timestamp),
            "2024-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn unknown_ids_keep_synthetic_names() {
        let record = avl_with_io(vec![RawIo {
            id: 999,
            size: 1,
            payload: IoPayload::Int(7),
        }]);
        let normalized = normalize(&imei(), &record);
        assert_eq!(normalized.io_elements[0].name, "IO_999");
        // Unknown ids are not projected to top-level fields.
        assert!(normalized.fields.is_empty());
    }

    #[test]
    fn vin_is_ascii_with_trailing_nuls_stripped() {
        let record = avl_with_io(vec![RawIo {
            id: 256,
            size: 19,
            payload: IoPayload::Bytes(b"WVWZZZ1JZ3W386752\0\0".to_vec()),
        }]);
        let normalized = normalize(&imei(), &record);
        assert_eq!(normalized.vin(), Some("WVWZZZ1JZ3W386752"));
    }

    #[test]
    fn opaque_nx_payloads_become_hex() {
        let record = avl_with_io(vec![RawIo {
            id: 387,
            size: 3,
            payload: IoPayload::Bytes(vec![0xDE, 0xAD, 0x01]),
        }]);
        let normalized = normalize(&imei(), &record);
        assert_eq!(normalized.io_elements[0].name, "IO_387");
        assert_eq!(
            normalized.io_elements[0].value,
            IoValue::Text("dead01".to_string())
        );
    }

    #[test]
    fn ignition_and_odometer_project_to_fields() {
        let record = avl_with_io(vec![
            RawIo {
                id: 239,
                size: 1,
                payload: IoPayload::Int(1),
            },
            RawIo {
                id: 16,
                size: 4,
                payload: IoPayload::Int(123_456),
            },
        ]);
        let normalized = normalize(&imei(), &record);
        assert_eq!(normalized.ignition(), Some(1));
        assert_eq!(normalized.total_odometer(), Some(123_456));
        assert!(normalized.engine_on());
    }
}
