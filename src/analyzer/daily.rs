//! Daily aggregation of synthesized trips.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{iso_millis_opt, Record};

use super::{round1, round2, segment_trips, Trip};

/// Aggregates over one UTC day of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: NaiveDate,
    pub trip_count: usize,
    pub total_distance_km: f64,
    pub total_driving_minutes: i64,
    pub max_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_driver_score: Option<i64>,
    pub perfect_trips: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_used_liters: Option<f64>,
    pub total_idle_minutes: i64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_millis_opt"
    )]
    pub first_trip_start: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso_millis_opt"
    )]
    pub last_trip_end: Option<DateTime<Utc>>,
}

/// Fold one day of records into a summary.
///
/// `records` must be chronologically ascending and confined to `date`;
/// the HTTP surface queries the store with day bounds before calling.
pub fn summarize_day(date: NaiveDate, records: &[Record]) -> DailySummary {
    let trips = segment_trips(records);
    summarize_trips(date, &trips)
}

fn summarize_trips(date: NaiveDate, trips: &[Trip]) -> DailySummary {
    let total_distance_km = round1(trips.iter().map(|t| t.distance_km).sum());
    let total_driving_minutes = trips.iter().map(|t| t.duration_minutes).sum();
    let max_speed = trips.iter().map(|t| t.max_speed).fold(0.0, f64::max);

    let scores: Vec<i64> = trips
        .iter()
        .filter_map(|t| t.driver_behavior.as_ref())
        .map(|b| b.driver_score)
        .collect();
    let avg_driver_score = (!scores.is_empty())
        .then(|| (scores.iter().sum::<i64>() as f64 / scores.len() as f64).round() as i64);

    let perfect_trips = trips
        .iter()
        .filter_map(|t| t.driver_behavior.as_ref())
        .filter(|b| b.perfect_trip)
        .count();

    let fuel: f64 = trips.iter().filter_map(|t| t.fuel_used_liters).sum();
    let fuel_used_liters = (fuel > 0.0).then(|| round2(fuel));

    let total_idle_minutes = trips
        .iter()
        .filter_map(|t| t.driver_behavior.as_ref())
        .map(|b| b.idle_minutes)
        .sum();

    DailySummary {
        date,
        trip_count: trips.len(),
        total_distance_km,
        total_driving_minutes,
        max_speed,
        avg_driver_score,
        perfect_trips,
        fuel_used_liters,
        total_idle_minutes,
        first_trip_start: trips.first().map(|t| t.start_time),
        last_trip_end: trips.last().map(|t| t.end_time),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};

    use crate::models::{GpsPosition, Imei, IoValue};

    use super::*;

    fn record(second: i64, ignition: u8, odometer: i64, speed: u16) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert(
            "ignition".to_string(),
            IoValue::Unsigned(u64::from(ignition)),
        );
        fields.insert(
            "totalOdometer".to_string(),
            IoValue::Unsigned(odometer as u64),
        );
        Record {
            imei: Imei::try_from("864275079658715").unwrap(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
                + Duration::seconds(second),
            priority: 0,
            gps: GpsPosition {
                latitude: 44.43,
                longitude: 26.10,
                altitude: 80,
                angle: 0,
                satellites: 9,
                speed,
            },
            io_elements: vec![],
            fields,
        }
    }

    fn two_trip_day() -> Vec<Record> {
        let mut records = Vec::new();
        for i in 0..20i64 {
            records.push(record(i * 10, 1, 100_000 + i * 150, 50));
        }
        // 10 minutes of quiet.
        records.push(record(800, 0, 102_850, 0));
        for i in 0..20i64 {
            records.push(record(900 + i * 10, 1, 102_850 + i * 100, 35));
        }
        records
    }

    #[test]
    fn day_aggregates_across_trips() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let summary = summarize_day(date, &two_trip_day());

        assert_eq!(summary.trip_count, 2);
        // 2.85 km + 1.9 km, each rounded to one decimal before summing.
        assert!((summary.total_distance_km - 4.8).abs() < 0.11);
        assert_eq!(summary.total_driving_minutes, 6);
        assert_eq!(summary.max_speed, 50.0);
        assert_eq!(
            summary.first_trip_start,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(
            summary.last_trip_end,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 18, 10).unwrap())
        );
    }

    #[test]
    fn empty_day_is_all_zeroes() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let summary = summarize_day(date, &[]);
        assert_eq!(summary.trip_count, 0);
        assert_eq!(summary.total_distance_km, 0.0);
        assert_eq!(summary.avg_driver_score, None);
        assert_eq!(summary.first_trip_start, None);
    }

    #[test]
    fn date_serializes_as_plain_iso_day() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let summary = summarize_day(date, &[]);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"date\":\"2024-01-01\""));
    }
}
