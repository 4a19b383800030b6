//! Read-only HTTP API.
//!
//! Stateless assembly of JSON responses over the store and the analyzer.
//! Every route except `/health` requires the configured secret in the
//! `X-API-Key` header. The wire layer is a deliberately small HTTP/1.1
//! responder (one request per connection, `Connection: close`); routing
//! and handlers are socket-free and take a parsed [`Request`], so the
//! whole surface is testable without a listener.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::analyzer::{self, DayBounds};
use crate::config::HttpConfig;
use crate::database::Db;
use crate::errors::AvlRecorderError;
use crate::models::{iso_millis, Device, Imei};

/// Paging and windowing limits from the API contract.
const RECORDS_MAX_LIMIT: u32 = 1000;
const RECORDS_DEFAULT_LIMIT: u32 = 100;
const RAW_MAX_LIMIT: u32 = 500;
const RAW_DEFAULT_LIMIT: u32 = 50;
const TRIPS_MAX_LIMIT: usize = 100;
const TRIPS_DEFAULT_LIMIT: usize = 20;
/// Default trip synthesis window when no explicit range is given.
const TRIPS_DEFAULT_WINDOW_DAYS: i64 = 7;
/// Upper bound on a daily-range request, to keep synthesis bounded.
const DAILY_RANGE_MAX_DAYS: i64 = 92;

/// A parsed HTTP request, decoupled from the socket.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub api_key: Option<String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query: HashMap::new(),
            api_key: None,
            body: Vec::new(),
        }
    }

    fn query_u32(&self, name: &str) -> Option<u32> {
        self.query.get(name).and_then(|v| v.parse().ok())
    }
}

/// Status code plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

/// Serve the API until the listener errors out.
pub async fn run_http_server(config: HttpConfig, db: Db) -> Result<(), AvlRecorderError> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("HTTP API on port {}", config.port);

    loop {
        let (stream, addr) = listener.accept().await?;
        let db = db.clone();
        let api_key = config.api_key.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, db, api_key).await {
                debug!("HTTP client {} error: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, db: Db, api_key: String) -> Result<(), AvlRecorderError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return write_response(&mut writer, &Response::error(400, "malformed request")).await;
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    };

    let mut api_key_header = None;
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "x-api-key" => api_key_header = Some(value.to_string()),
                "content-length" => content_length = value.parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length.min(1 << 20)];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }

    let request = Request {
        method: method.to_string(),
        path,
        query,
        api_key: api_key_header,
        body,
    };
    let response = route(&request, &db, &api_key, Utc::now());
    write_response(&mut writer, &response).await
}

async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), AvlRecorderError> {
    let body = response.body.to_string();
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), percent_decode(value)),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Minimal percent-decoding for query values (ISO timestamps arrive with
/// `%3A` colons from most clients).
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = (bytes[i] == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Dispatch one request. `now` is injected for deterministic tests.
pub fn route(request: &Request, db: &Db, api_key: &str, now: DateTime<Utc>) -> Response {
    let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.as_slice() == ["health"] && request.method == "GET" {
        return Response::ok(json!({
            "status": "ok",
            "timestamp": iso_millis::to_string(&now),
        }));
    }

    if api_key.is_empty() || request.api_key.as_deref() != Some(api_key) {
        return Response::error(401, "missing or invalid API key");
    }

    let result = match (request.method.as_str(), segments.as_slice()) {
        ("GET", &["devices"]) => list_devices(db),
        ("POST", &["devices"]) => create_device(request, db, now),
        ("GET", &["devices", imei]) => get_device(db, imei),
        ("PUT", &["devices", imei]) => update_device(request, db, imei, now),
        ("PATCH", &["devices", imei, "approve"]) => approve_device(request, db, imei, now),
        ("DELETE", &["devices", imei]) => delete_device(db, imei),
        ("GET", &["devices", imei, "records"]) => recent_records(request, db, imei),
        ("GET", &["devices", imei, "records", "range"]) => record_range(request, db, imei),
        ("GET", &["devices", imei, "latest"]) => latest_record(db, imei),
        ("GET", &["devices", imei, "raw"]) => raw_frames(request, db, imei),
        ("GET", &["devices", imei, "stats"]) => device_stats(db, imei, now),
        ("GET", &["devices", imei, "trips"]) => device_trips(request, db, imei, now),
        ("GET", &["devices", imei, "daily"]) => daily_summary(db, imei, None, now),
        ("GET", &["devices", imei, "daily", date]) => daily_summary(db, imei, Some(date), now),
        ("GET", &["devices", imei, "daily-range"]) => daily_range(request, db, imei),
        _ => return Response::error(404, "no such route"),
    };

    result.unwrap_or_else(error_response)
}

fn error_response(err: AvlRecorderError) -> Response {
    match err {
        AvlRecorderError::InvalidImei(imei) => {
            Response::error(400, format!("invalid IMEI: {imei}"))
        }
        AvlRecorderError::DeviceNotFound(imei) => {
            Response::error(404, format!("device not found: {imei}"))
        }
        AvlRecorderError::DeviceExists(imei) => {
            Response::error(409, format!("device already exists: {imei}"))
        }
        err => {
            error!("Handler error: {}", err);
            Response::error(500, err.to_string())
        }
    }
}

type HandlerResult = Result<Response, AvlRecorderError>;

fn parse_imei(raw: &str) -> Result<Imei, AvlRecorderError> {
    Imei::try_from(raw)
}

/// Device lookup shared by the per-device read routes; the modem type
/// decides which collections to query.
fn require_device(db: &Db, raw_imei: &str) -> Result<(Imei, Device), AvlRecorderError> {
    let imei = parse_imei(raw_imei)?;
    let device = db
        .get_device(&imei)?
        .ok_or_else(|| AvlRecorderError::DeviceNotFound(raw_imei.to_string()))?;
    Ok((imei, device))
}

fn list_devices(db: &Db) -> HandlerResult {
    let devices = db.list_devices()?;
    Ok(Response::ok(serde_json::to_value(devices)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeviceBody {
    imei: String,
    modem_type: Option<String>,
    #[serde(default)]
    approved: bool,
    car_brand: Option<String>,
    car_model: Option<String>,
    plate_number: Option<String>,
    notes: Option<String>,
}

fn create_device(request: &Request, db: &Db, now: DateTime<Utc>) -> HandlerResult {
    let Ok(body) = serde_json::from_slice::<CreateDeviceBody>(&request.body) else {
        return Ok(Response::error(400, "malformed device body"));
    };
    let imei = parse_imei(&body.imei)?;

    let mut device = Device::new(imei, now);
    if let Some(modem_type) = body.modem_type {
        device.modem_type = modem_type;
    }
    device.approved = body.approved;
    device.car_brand = body.car_brand;
    device.car_model = body.car_model;
    device.plate_number = body.plate_number;
    device.notes = body.notes;

    db.create_device(&device)?;
    Ok(Response::ok(serde_json::to_value(device)?))
}

fn get_device(db: &Db, raw_imei: &str) -> HandlerResult {
    let (_, device) = require_device(db, raw_imei)?;
    Ok(Response::ok(serde_json::to_value(device)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDeviceBody {
    car_brand: Option<String>,
    car_model: Option<String>,
    plate_number: Option<String>,
    notes: Option<String>,
}

fn update_device(request: &Request, db: &Db, raw_imei: &str, now: DateTime<Utc>) -> HandlerResult {
    let Ok(body) = serde_json::from_slice::<UpdateDeviceBody>(&request.body) else {
        return Ok(Response::error(400, "malformed device body"));
    };
    let (_, mut device) = require_device(db, raw_imei)?;

    if let Some(car_brand) = body.car_brand {
        device.car_brand = Some(car_brand);
    }
    if let Some(car_model) = body.car_model {
        device.car_model = Some(car_model);
    }
    if let Some(plate_number) = body.plate_number {
        device.plate_number = Some(plate_number);
    }
    if let Some(notes) = body.notes {
        device.notes = Some(notes);
    }
    device.updated_at = now;

    db.upsert_device(&device)?;
    Ok(Response::ok(serde_json::to_value(device)?))
}

#[derive(Debug, Deserialize)]
struct ApproveBody {
    approved: Option<bool>,
}

fn approve_device(request: &Request, db: &Db, raw_imei: &str, now: DateTime<Utc>) -> HandlerResult {
    let approved = if request.body.is_empty() {
        true
    } else {
        serde_json::from_slice::<ApproveBody>(&request.body)
            .map(|body| body.approved.unwrap_or(true))
            .unwrap_or(true)
    };

    let (_, mut device) = require_device(db, raw_imei)?;
    device.approved = approved;
    device.updated_at = now;
    db.upsert_device(&device)?;
    Ok(Response::ok(serde_json::to_value(device)?))
}

fn delete_device(db: &Db, raw_imei: &str) -> HandlerResult {
    let imei = parse_imei(raw_imei)?;
    if db.delete_device(&imei)? {
        Ok(Response::ok(json!({ "deleted": true })))
    } else {
        Err(AvlRecorderError::DeviceNotFound(raw_imei.to_string()))
    }
}

fn recent_records(request: &Request, db: &Db, raw_imei: &str) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let limit = request
        .query_u32("limit")
        .unwrap_or(RECORDS_DEFAULT_LIMIT)
        .clamp(1, RECORDS_MAX_LIMIT);
    let skip = request.query_u32("skip").unwrap_or(0);
    let records = db.find_recent(&device.modem_type, &imei, limit, skip)?;
    Ok(Response::ok(serde_json::to_value(records)?))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn record_range(request: &Request, db: &Db, raw_imei: &str) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let (Some(from), Some(to)) = (
        request.query.get("from").and_then(|v| parse_timestamp(v)),
        request.query.get("to").and_then(|v| parse_timestamp(v)),
    ) else {
        return Ok(Response::error(400, "from and to must be ISO-8601"));
    };
    let records = db.find_range(&device.modem_type, &imei, from, to)?;
    Ok(Response::ok(serde_json::to_value(records)?))
}

fn latest_record(db: &Db, raw_imei: &str) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    match db.find_latest(&device.modem_type, &imei)? {
        Some(record) => Ok(Response::ok(serde_json::to_value(record)?)),
        None => Ok(Response::error(404, "no records")),
    }
}

fn raw_frames(request: &Request, db: &Db, raw_imei: &str) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let limit = request
        .query_u32("limit")
        .unwrap_or(RAW_DEFAULT_LIMIT)
        .clamp(1, RAW_MAX_LIMIT);
    let frames = db.find_raw_recent(&device.modem_type, &imei, limit)?;
    Ok(Response::ok(serde_json::to_value(frames)?))
}

fn device_stats(db: &Db, raw_imei: &str, now: DateTime<Utc>) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let total = db.count_records(&device.modem_type, &imei)?;
    let midnight = DayBounds::for_date(now.date_naive()).start;
    let today = db.count_records_since(&device.modem_type, &imei, midnight)?;
    let latest = db.find_latest(&device.modem_type, &imei)?;

    let mut stats = json!({
        "imei": imei.as_str(),
        "totalRecords": total,
        "recordsToday": today,
        "lastSeen": device.last_seen.map(|ts| iso_millis::to_string(&ts)),
    });
    if let Some(record) = latest {
        stats["lastPosition"] = json!({
            "latitude": record.gps.latitude,
            "longitude": record.gps.longitude,
            "timestamp": iso_millis::to_string(&record.timestamp),
        });
        stats["lastIgnition"] = json!(record.ignition());
        stats["lastSpeed"] = json!(record.speed());
    }
    Ok(Response::ok(stats))
}

fn device_trips(request: &Request, db: &Db, raw_imei: &str, now: DateTime<Utc>) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let limit = request
        .query_u32("limit")
        .map(|l| l as usize)
        .unwrap_or(TRIPS_DEFAULT_LIMIT)
        .clamp(1, TRIPS_MAX_LIMIT);
    let to = request
        .query
        .get("to")
        .and_then(|v| parse_timestamp(v))
        .unwrap_or(now);
    let from = request
        .query
        .get("from")
        .and_then(|v| parse_timestamp(v))
        .unwrap_or(to - Duration::days(TRIPS_DEFAULT_WINDOW_DAYS));

    let records = db.find_range(&device.modem_type, &imei, from, to)?;
    let mut trips = analyzer::segment_trips(&records);
    trips.reverse(); // newest first
    trips.truncate(limit);
    Ok(Response::ok(serde_json::to_value(trips)?))
}

fn daily_summary(
    db: &Db,
    raw_imei: &str,
    date: Option<&str>,
    now: DateTime<Utc>,
) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let date = match date {
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => return Ok(Response::error(400, "date must be YYYY-MM-DD")),
        },
        None => now.date_naive(),
    };
    let bounds = DayBounds::for_date(date);
    let records = db.find_range(&device.modem_type, &imei, bounds.start, bounds.end)?;
    let summary = analyzer::summarize_day(date, &records);
    Ok(Response::ok(serde_json::to_value(summary)?))
}

fn daily_range(request: &Request, db: &Db, raw_imei: &str) -> HandlerResult {
    let (imei, device) = require_device(db, raw_imei)?;
    let parse = |name: &str| {
        request
            .query
            .get(name)
            .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
    };
    let (Some(from), Some(to)) = (parse("from"), parse("to")) else {
        return Ok(Response::error(400, "from and to must be YYYY-MM-DD"));
    };
    if to < from {
        return Ok(Response::error(400, "to must not precede from"));
    }
    let days = (to - from).num_days() + 1;
    if days > DAILY_RANGE_MAX_DAYS {
        return Ok(Response::error(
            400,
            format!("range limited to {DAILY_RANGE_MAX_DAYS} days"),
        ));
    }

    let mut summaries = Vec::with_capacity(days as usize);
    let mut date = from;
    while date <= to {
        let bounds = DayBounds::for_date(date);
        let records = db.find_range(&device.modem_type, &imei, bounds.start, bounds.end)?;
        summaries.push(analyzer::summarize_day(date, &records));
        date = date + Duration::days(1);
    }
    Ok(Response::ok(serde_json::to_value(summaries)?))
}
