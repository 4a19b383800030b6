//! Trip reconstruction and driver-behavior analysis.
//!
//! The analyzer is a pure, stateless pass over chronologically ascending
//! records for one IMEI: `trips` segments engine-on runs and computes
//! per-trip metrics, `behavior` scores accelerometer signals, and `daily`
//! folds trips into per-day summaries. Trips are synthesized on demand
//! and never stored.

mod behavior;
mod daily;
mod trips;

pub use daily::{summarize_day, DailySummary};
pub use trips::segment_trips;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::iso_millis;

/// GPS fix anchoring a trip endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// A contiguous engine-on run, with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    #[serde(with = "iso_millis")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_odometer: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_odometer: Option<i64>,
    pub distance_meters: f64,
    pub distance_km: f64,
    /// Present (and true) only when the odometer was flat or absent and
    /// the distance was integrated from speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_estimated: Option<bool>,
    pub duration_minutes: i64,
    /// `"Hh Mm"`, hours suppressed when zero.
    pub duration: String,
    pub max_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_speed_moving: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_speed_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_used_liters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_per_100km: Option<f64>,
    /// Always true when fuel metrics are present: the only fuel source is
    /// the GPS-estimated counter (IO 12).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_from_gps: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<TripPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_position: Option<TripPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_behavior: Option<DriverBehavior>,
}

/// Data-quality verdict attached to a behavior score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub reasons: Vec<String>,
}

/// Behavioral and efficiency scores for one trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverBehavior {
    pub hard_braking: u32,
    pub hard_acceleration: u32,
    pub harsh_cornering: u32,
    pub idle_minutes: i64,
    /// 0-100; 100 is a clean trip.
    pub driver_score: i64,
    /// 0-100; penalized by idling only.
    pub efficiency_score: i64,
    pub confidence: Confidence,
    pub perfect_trip: bool,
}

/// Daily summary window bounds, re-exported for the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayBounds {
    /// Whole UTC day covering `date`.
    pub fn for_date(date: chrono::NaiveDate) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap().and_utc();
        let end = date.and_hms_milli_opt(23, 59, 59, 999).unwrap().and_utc();
        Self { start, end }
    }
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
