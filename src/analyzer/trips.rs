//! Trip segmentation and per-trip metrics.

use chrono::Duration;

use crate::models::Record;

use super::{behavior, round1, round2, Trip, TripPosition};

/// Engine-off quiet period that separates two trips.
const QUIET_GAP_SECONDS: i64 = 60;

/// Minimum duration or distance for a trip to be emitted at all.
const MIN_TRIP_MINUTES: i64 = 2;
const MIN_TRIP_METERS: f64 = 100.0;

/// Fuel metrics are only meaningful on trips long enough for the
/// GPS-estimated counter to move.
const FUEL_MIN_KM: f64 = 2.0;
const FUEL_MIN_MINUTES: i64 = 5;

/// Segment chronologically ascending records into trips.
///
/// A trip is a maximal engine-on run; brief engine-off records interleave
/// freely, and the run closes at the last engine-on record once the
/// engine has been off for more than 60 seconds. Runs that are both
/// short (< 2 min) and stationary (≤ 100 m) are discarded.
pub fn segment_trips(records: &[Record]) -> Vec<Trip> {
    let mut trips = Vec::new();
    let mut current: Vec<Record> = Vec::new();
    let mut last_on_idx = 0usize;

    for record in records {
        if current.is_empty() {
            if record.engine_on() {
                current.push(record.clone());
                last_on_idx = 0;
            }
            continue;
        }

        if record.engine_on() {
            current.push(record.clone());
            last_on_idx = current.len() - 1;
        } else {
            let gap = record.timestamp - current[last_on_idx].timestamp;
            if gap > Duration::seconds(QUIET_GAP_SECONDS) {
                current.truncate(last_on_idx + 1);
                if let Some(trip) = build_trip(&current) {
                    trips.push(trip);
                }
                current.clear();
            } else {
                current.push(record.clone());
            }
        }
    }

    if !current.is_empty() {
        current.truncate(last_on_idx + 1);
        if let Some(trip) = build_trip(&current) {
            trips.push(trip);
        }
    }

    trips
}

fn build_trip(records: &[Record]) -> Option<Trip> {
    let first = records.first()?;
    let last = records.last()?;

    let span_seconds = (last.timestamp - first.timestamp).num_seconds();
    let duration_minutes = (span_seconds as f64 / 60.0).round() as i64;

    let start_odometer = first.total_odometer();
    let end_odometer = records.iter().rev().find_map(Record::total_odometer);

    let odometer_delta = match (start_odometer, end_odometer) {
        (Some(start), Some(end)) if end > start => Some((end - start) as f64),
        _ => None,
    };
    let (distance_meters, estimated) = match odometer_delta {
        Some(meters) => (meters, false),
        None => (integrate_distance(records), true),
    };

    if duration_minutes < MIN_TRIP_MINUTES && distance_meters <= MIN_TRIP_METERS {
        return None;
    }

    let distance_km = (distance_meters / 100.0).round() / 10.0;

    let max_speed = records.iter().map(Record::speed).fold(0.0, f64::max);

    let moving: Vec<f64> = records
        .iter()
        .map(Record::speed)
        .filter(|&speed| speed > 0.0)
        .collect();
    let avg_speed_moving = (!moving.is_empty())
        .then(|| round1(moving.iter().sum::<f64>() / moving.len() as f64));

    let avg_speed_total = (duration_minutes > 0 && distance_km > 0.0)
        .then(|| round1(distance_km / (duration_minutes as f64 / 60.0)));

    let fuel = fuel_metrics(records, distance_km, duration_minutes);

    let start_position = endpoint_position(records.iter(), first);
    let end_position = endpoint_position(records.iter().rev(), last);

    let driver_behavior = behavior::analyze(records, duration_minutes, estimated);

    Some(Trip {
        start_time: first.timestamp,
        end_time: last.timestamp,
        start_odometer,
        end_odometer,
        distance_meters,
        distance_km,
        distance_estimated: estimated.then_some(true),
        duration_minutes,
        duration: format_duration(duration_minutes),
        max_speed,
        avg_speed_moving,
        avg_speed_total,
        fuel_used_liters: fuel.map(|f| f.0),
        fuel_per_100km: fuel.map(|f| f.1),
        fuel_from_gps: fuel.map(|_| true),
        start_position,
        end_position,
        driver_behavior,
    })
}

/// Fallback distance: trapezoidal integration of speed over time.
fn integrate_distance(records: &[Record]) -> f64 {
    let mut meters = 0.0;
    for pair in records.windows(2) {
        let dt_hours = (pair[1].timestamp - pair[0].timestamp).num_seconds() as f64 / 3600.0;
        if dt_hours <= 0.0 {
            continue;
        }
        let mean_kmh = (pair[0].speed() + pair[1].speed()) / 2.0;
        meters += mean_kmh * dt_hours * 1000.0;
    }
    meters
}

/// Fuel used from the GPS-estimated counter (IO 12), in (liters, l/100km).
fn fuel_metrics(records: &[Record], distance_km: f64, duration_minutes: i64) -> Option<(f64, f64)> {
    if distance_km < FUEL_MIN_KM || duration_minutes < FUEL_MIN_MINUTES {
        return None;
    }
    let start = records.iter().find_map(Record::fuel_used_gps)?;
    let end = records.iter().rev().find_map(Record::fuel_used_gps)?;
    let used_ml = end - start;
    if used_ml <= 0 {
        return None;
    }
    let liters = round2(used_ml as f64 / 1000.0);
    let per_100km = round1(liters / distance_km * 100.0);
    Some((liters, per_100km))
}

/// First record with a GPS fix, falling back to the outer record.
fn endpoint_position<'a>(
    mut iter: impl Iterator<Item = &'a Record>,
    fallback: &Record,
) -> Option<TripPosition> {
    let record = iter
        .find(|record| record.gps.satellites > 0)
        .unwrap_or(fallback);
    Some(TripPosition {
        latitude: record.gps.latitude,
        longitude: record.gps.longitude,
        timestamp: record.timestamp,
    })
}

/// `"Hh Mm"`, hours suppressed when zero.
fn format_duration(minutes: i64) -> String {
    let hours = minutes / 60;
    let rest = minutes % 60;
    if hours > 0 {
        format!("{hours}h {rest}m")
    } else {
        format!("{rest}m")
    }
}
