use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

use avl_recorder::database::{DbBuilder, DbDropGuard};
use avl_recorder::models::{Device, GpsPosition, Imei, IoValue, RawFrame, Record};

fn setup_test_db() -> (tempfile::TempDir, DbDropGuard) {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let guard = DbBuilder::new()
        .path(db_path)
        .build()
        .expect("Failed to open test database");
    (temp_dir, guard)
}

fn imei() -> Imei {
    Imei::try_from("864275079658715").unwrap()
}

fn record_at(minute: u32, second: u32) -> Record {
    let mut fields = BTreeMap::new();
    fields.insert("ignition".to_string(), IoValue::Unsigned(1));
    fields.insert("totalOdometer".to_string(), IoValue::Unsigned(123_456));
    Record {
        imei: imei(),
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 8, minute, second).unwrap(),
        priority: 1,
        gps: GpsPosition {
            latitude: 44.0,
            longitude: 26.0,
            altitude: 100,
            angle: 90,
            satellites: 9,
            speed: 50,
        },
        io_elements: vec![],
        fields,
    }
}

#[test]
fn insert_and_read_back_record() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();

    let record = record_at(0, 0);
    db.insert_record("FMC003", &record).unwrap();

    let stored = db.find_latest("FMC003", &imei()).unwrap().unwrap();
    assert_eq!(stored, record);
    assert_eq!(stored.total_odometer(), Some(123_456));
}

#[test]
fn replayed_records_are_idempotent() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();

    let record = record_at(0, 0);
    for _ in 0..3 {
        db.insert_record("FMC003", &record).unwrap();
    }
    assert_eq!(db.count_records("FMC003", &imei()).unwrap(), 1);
}

#[test]
fn range_and_recent_agree_on_ordering() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();

    for minute in [2u32, 0, 1, 4, 3] {
        db.insert_record("FMC003", &record_at(minute, 0)).unwrap();
    }

    let from = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 1, 1, 8, 4, 0).unwrap();
    let ascending = db.find_range("FMC003", &imei(), from, to).unwrap();
    let minutes: Vec<u32> = ascending
        .iter()
        .map(|r| (r.timestamp.timestamp() / 60 % 60) as u32)
        .collect();
    assert_eq!(minutes, vec![0, 1, 2, 3, 4]);

    let descending = db.find_recent("FMC003", &imei(), 10, 0).unwrap();
    let minutes: Vec<u32> = descending
        .iter()
        .map(|r| (r.timestamp.timestamp() / 60 % 60) as u32)
        .collect();
    assert_eq!(minutes, vec![4, 3, 2, 1, 0]);
}

#[test]
fn collections_are_isolated_per_device_type() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();

    db.insert_record("FMC003", &record_at(0, 0)).unwrap();
    assert_eq!(db.count_records("FMC003", &imei()).unwrap(), 1);
    assert_eq!(db.count_records("FMB920", &imei()).unwrap(), 0);
}

#[test]
fn raw_frames_append_without_dedup() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();

    let frame = RawFrame {
        imei: imei(),
        vin: None,
        modem_type: "FMC003".to_string(),
        raw_hex: "00000000deadbeef".to_string(),
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap(),
    };
    db.insert_raw(&frame).unwrap();
    db.insert_raw(&frame).unwrap();

    let frames = db.find_raw_recent("FMC003", &imei(), 10).unwrap();
    assert_eq!(frames.len(), 2);
}

#[test]
fn allow_list_drives_admission_reads() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    assert!(db.get_device(&imei()).unwrap().is_none());

    let mut device = Device::new(imei(), now);
    db.create_device(&device).unwrap();
    assert!(!db.get_device(&imei()).unwrap().unwrap().approved);

    device.approved = true;
    device.updated_at = now + Duration::seconds(5);
    db.upsert_device(&device).unwrap();
    assert!(db.get_device(&imei()).unwrap().unwrap().approved);
}

#[test]
fn device_documents_survive_round_trip() {
    let (_tmp, guard) = setup_test_db();
    let db = guard.db();
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let mut device = Device::new(imei(), now);
    device.approved = true;
    device.car_brand = Some("Skoda".to_string());
    device.plate_number = Some("B-123-XYZ".to_string());
    db.create_device(&device).unwrap();

    db.touch_last_seen(&imei(), now + Duration::minutes(10)).unwrap();
    db.record_vin(&imei(), "WVWZZZ1JZ3W386752", now + Duration::minutes(10))
        .unwrap();

    let stored = db.get_device(&imei()).unwrap().unwrap();
    assert_eq!(stored.car_brand.as_deref(), Some("Skoda"));
    assert_eq!(stored.vin.as_deref(), Some("WVWZZZ1JZ3W386752"));
    assert_eq!(stored.last_seen, Some(now + Duration::minutes(10)));
    assert_eq!(stored.created_at, now);
}
