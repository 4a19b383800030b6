//! Driver-behavior scoring from accelerometer signals.
//!
//! The accelerometer stream is noisy: mounting angle shifts the resting
//! vector, and single-sample spikes are common. The pass therefore
//! estimates a stationary baseline, subtracts it, runs a 3-sample median
//! filter, and only then detects events, each with a per-type cooldown.

use crate::models::Record;

use super::{Confidence, ConfidenceLevel, DriverBehavior};

/// Event thresholds, in mG after baseline subtraction.
const BRAKING_THRESHOLD: f64 = -150.0;
const ACCELERATION_THRESHOLD: f64 = 200.0;
const CORNERING_THRESHOLD: f64 = 150.0;

/// Minimum speeds for an event to count at all.
const EVENT_MIN_SPEED: f64 = 10.0;
const CORNERING_MIN_SPEED: f64 = 20.0;

/// Same-type events may not re-fire within this window.
const EVENT_COOLDOWN_MS: i64 = 2000;

/// Below this speed a record counts as stationary.
const STATIONARY_SPEED: f64 = 3.0;

/// Score a trip's records. Returns `None` when fewer than five records
/// carry both accelerometer axes.
pub(super) fn analyze(
    records: &[Record],
    duration_minutes: i64,
    distance_estimated: bool,
) -> Option<DriverBehavior> {
    let samples: Vec<Sample> = records
        .iter()
        .filter_map(|record| {
            let x = record.accelerometer_x()? as f64;
            let y = record.accelerometer_y()? as f64;
            Some(Sample {
                x,
                y,
                speed: record.speed(),
                timestamp_ms: record.timestamp.timestamp_millis(),
            })
        })
        .collect();

    if samples.len() < 5 {
        return None;
    }

    let (base_x, base_y) = baseline(&samples);
    let xs: Vec<f64> = samples.iter().map(|s| s.x - base_x).collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.y - base_y).collect();
    let xs = median3(&xs);
    let ys = median3(&ys);

    let mut hard_braking = 0u32;
    let mut hard_acceleration = 0u32;
    let mut harsh_cornering = 0u32;
    let mut last_brake_ms: Option<i64> = None;
    let mut last_accel_ms: Option<i64> = None;
    let mut last_corner_ms: Option<i64> = None;

    for (i, sample) in samples.iter().enumerate() {
        if sample.speed < EVENT_MIN_SPEED {
            continue;
        }
        let ts = sample.timestamp_ms;

        if xs[i] < BRAKING_THRESHOLD && fire(&mut last_brake_ms, ts) {
            hard_braking += 1;
        }
        if xs[i] > ACCELERATION_THRESHOLD && fire(&mut last_accel_ms, ts) {
            hard_acceleration += 1;
        }
        if ys[i].abs() > CORNERING_THRESHOLD
            && sample.speed >= CORNERING_MIN_SPEED
            && fire(&mut last_corner_ms, ts)
        {
            harsh_cornering += 1;
        }
    }

    let idle_minutes_raw = idle_seconds(records) / 60.0;

    // Penalties, each capped so one bad habit cannot zero the score.
    let brake_penalty = (f64::from(hard_braking) * 4.0).min(25.0);
    let accel_penalty = (f64::from(hard_acceleration) * 2.0).min(20.0);
    let corner_penalty = (f64::from(harsh_cornering) * 3.0).min(15.0);
    let total_raw = brake_penalty + accel_penalty + corner_penalty;

    let duration_factor = (duration_minutes as f64 / 10.0).clamp(1.0, 6.0);
    let severe_events = hard_braking + harsh_cornering;
    let floor = if severe_events > 0 { 3.0 } else { 0.0 };
    let normalized = (total_raw / duration_factor).max(floor);
    let mut driver_score = (100.0 - normalized).round().clamp(0.0, 100.0) as i64;

    let idle_penalty = ((idle_minutes_raw / 5.0).floor() * 2.0).min(30.0) as i64;
    let efficiency_score = 100 - idle_penalty;

    let confidence = assess_confidence(
        records,
        samples.len(),
        duration_minutes,
        distance_estimated,
    );
    if confidence.level == ConfidenceLevel::Low {
        driver_score = driver_score.min(95);
    }

    let perfect_trip =
        total_raw == 0.0 && confidence.level == ConfidenceLevel::High && duration_minutes >= 5;

    Some(DriverBehavior {
        hard_braking,
        hard_acceleration,
        harsh_cornering,
        idle_minutes: idle_minutes_raw.round() as i64,
        driver_score,
        efficiency_score,
        confidence,
        perfect_trip,
    })
}

struct Sample {
    x: f64,
    y: f64,
    speed: f64,
    timestamp_ms: i64,
}

/// Resting accelerometer vector.
///
/// Median of stationary samples when at least three exist; otherwise the
/// mean of the first five samples.
fn baseline(samples: &[Sample]) -> (f64, f64) {
    let stationary: Vec<&Sample> = samples
        .iter()
        .filter(|s| s.speed < STATIONARY_SPEED)
        .collect();
    if stationary.len() >= 3 {
        let xs: Vec<f64> = stationary.iter().map(|s| s.x).collect();
        let ys: Vec<f64> = stationary.iter().map(|s| s.y).collect();
        (median(&xs), median(&ys))
    } else {
        let head = &samples[..5];
        let n = head.len() as f64;
        (
            head.iter().map(|s| s.x).sum::<f64>() / n,
            head.iter().map(|s| s.y).sum::<f64>() / n,
        )
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// 3-sample sliding median; endpoints pass through unchanged.
fn median3(values: &[f64]) -> Vec<f64> {
    if values.len() < 3 {
        return values.to_vec();
    }
    let mut out = values.to_vec();
    for i in 1..values.len() - 1 {
        out[i] = median(&values[i - 1..=i + 1]);
    }
    out
}

/// Fire an event unless its type fired within the cooldown window.
fn fire(last_ms: &mut Option<i64>, ts: i64) -> bool {
    if last_ms.map_or(true, |last| ts - last > EVENT_COOLDOWN_MS) {
        *last_ms = Some(ts);
        true
    } else {
        false
    }
}

/// Seconds spent idling: ignition on, stationary, no movement flag. Each
/// step is clamped to [1 s, 60 s] against device clock drift.
fn idle_seconds(records: &[Record]) -> f64 {
    let mut total = 0.0;
    for pair in records.windows(2) {
        let current = &pair[1];
        let is_idle = current.ignition() == Some(1)
            && current.speed() < STATIONARY_SPEED
            && current.movement() == Some(0);
        if is_idle {
            let dt = (current.timestamp - pair[0].timestamp).num_seconds() as f64;
            total += dt.clamp(1.0, 60.0);
        }
    }
    total
}

fn assess_confidence(
    records: &[Record],
    accel_count: usize,
    duration_minutes: i64,
    distance_estimated: bool,
) -> Confidence {
    let mut reasons = Vec::new();
    let mut score_affecting = 0usize;

    let with_fix: Vec<u8> = records
        .iter()
        .filter(|r| r.gps.satellites > 0)
        .map(|r| r.gps.satellites)
        .collect();
    let poor_gnss = if with_fix.is_empty() {
        true
    } else {
        let mean = with_fix.iter().map(|&s| f64::from(s)).sum::<f64>() / with_fix.len() as f64;
        mean < 3.0
    };
    if poor_gnss {
        reasons.push("poor_gnss".to_string());
        score_affecting += 1;
    }

    if (accel_count as f64) < records.len() as f64 * 0.3 {
        reasons.push("low_accel_coverage".to_string());
        score_affecting += 1;
    }

    if duration_minutes < 5 {
        // Informational only; does not affect the level.
        reasons.push("short_trip".to_string());
    }

    if distance_estimated {
        reasons.push("distance_estimated".to_string());
        score_affecting += 1;
    }

    let level = match score_affecting {
        0 => ConfidenceLevel::High,
        1 => ConfidenceLevel::Medium,
        _ => ConfidenceLevel::Low,
    };

    Confidence { level, reasons }
}
