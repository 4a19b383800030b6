//! Device-facing TCP listener and per-connection driver.
//!
//! Each accepted connection runs on its own task and owns its
//! [`Session`] state machine; the only shared resources are the store
//! handle, the raw capture log, and the observability session map. Acks
//! are written as soon as a frame decodes; the durable write follows and
//! never holds up the device's upload schedule (trackers retransmit
//! anything unacknowledged).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::TcpConfig;
use crate::database::Db;
use crate::errors::AvlRecorderError;
use crate::models::{Imei, RawFrame};
use crate::normalizer;
use crate::rawlog::RawLog;
use crate::session::{Session, SessionOutput};

/// Observability view of live connections, keyed `"<ip>:<port>"`.
///
/// Each entry is mutated only by its owning connection's open/close
/// events; nothing reads another session's state.
#[derive(Clone, Default)]
pub struct SessionMap {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub imei: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, key: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(
                key.to_string(),
                SessionEntry {
                    imei: None,
                    connected_at: Utc::now(),
                },
            );
        }
    }

    fn authenticated(&self, key: &str, imei: &Imei) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(entry) = map.get_mut(key) {
                entry.imei = Some(imei.to_string());
            }
        }
    }

    fn close(&self, key: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accept loop. Runs until the listener errors out.
///
/// `db` is optional: with no healthy store the gateway runs degraded,
/// accepting logins and capturing raw frames without persisting records.
pub async fn run_tcp_server(
    config: TcpConfig,
    db: Option<Db>,
    rawlog: RawLog,
    sessions: SessionMap,
) -> Result<(), AvlRecorderError> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("TCP listener on port {}", config.port);
    if db.is_none() {
        warn!("Store unavailable: running degraded, accept-and-log only");
    }

    loop {
        let (stream, addr) = listener.accept().await?;
        let config = config.clone();
        let db = db.clone();
        let rawlog = rawlog.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, config, db, rawlog, sessions).await {
                debug!("Connection {} ended with error: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: TcpConfig,
    db: Option<Db>,
    rawlog: RawLog,
    sessions: SessionMap,
) -> Result<(), AvlRecorderError> {
    let key = addr.to_string();
    sessions.open(&key);
    debug!("Connection opened from {}", key);

    let result = drive_session(&mut stream, &key, &config, &db, &rawlog, &sessions).await;

    sessions.close(&key);
    debug!("Connection closed from {}", key);
    result
}

async fn drive_session(
    stream: &mut TcpStream,
    key: &str,
    config: &TcpConfig,
    db: &Option<Db>,
    rawlog: &RawLog,
    sessions: &SessionMap,
) -> Result<(), AvlRecorderError> {
    let mut session = Session::new();
    let mut buf = vec![0u8; 4096];
    let login_deadline = Instant::now() + config.login_timeout;
    let mut liveness = interval(config.liveness_interval);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let mut outputs: std::collections::VecDeque<SessionOutput> =
                    session.feed(&buf[..n]).into();
                let mut pending: Vec<(crate::codec::DecodedPacket, Vec<u8>)> = Vec::new();
                // Set when a frame is rejected for CRC; its ack (the next
                // Reply output) must be swallowed so the device retries.
                let mut suppress_ack = false;

                while let Some(output) = outputs.pop_front() {
                    match output {
                        SessionOutput::LoginAttempt(imei) => {
                            let admission = admit(db, &imei);
                            let reply = session.resolve_login(admission.is_some());
                            stream.write_all(&[reply]).await?;
                            if let Some(modem_type) = admission {
                                info!("Device {} authenticated from {}", imei, key);
                                session.set_device_type(modem_type);
                                sessions.authenticated(key, &imei);
                                // Frames pipelined behind the login frame
                                // are already buffered; drain them now.
                                outputs.extend(session.feed(&[]));
                            } else {
                                info!("Device {} rejected from {}", imei, key);
                                return Ok(());
                            }
                        }
                        SessionOutput::MalformedLogin => {
                            warn!("Malformed login from {}; waiting out the timer", key);
                        }
                        SessionOutput::Reply(bytes) => {
                            if suppress_ack {
                                suppress_ack = false;
                                continue;
                            }
                            stream.write_all(&bytes).await?;
                            // The ack is on the wire; now the durable part.
                            for (packet, raw) in pending.drain(..) {
                                persist_packet(&mut session, db, rawlog, &packet, &raw);
                            }
                        }
                        SessionOutput::Packet { packet, raw } => {
                            if !packet.crc_ok {
                                warn!(
                                    "CRC mismatch from {}: frame {:#06x}, computed {:#06x}",
                                    key, packet.crc_found, packet.crc_computed
                                );
                                if config.reject_bad_crc {
                                    suppress_ack = true;
                                    continue;
                                }
                            }
                            pending.push((packet, raw));
                        }
                        SessionOutput::DecodeFailed(err) => {
                            warn!("Dropping undecodable frame from {}: {}", key, err);
                        }
                        SessionOutput::Disconnect => {
                            warn!("Protocol desync from {}; closing", key);
                            return Ok(());
                        }
                    }
                }
            }
            _ = sleep_until(login_deadline), if !session.is_authenticated() => {
                info!("Login timeout for {}", key);
                return Ok(());
            }
            _ = liveness.tick() => {
                // Observability only; nothing is written to the wire.
                debug!(
                    "Liveness poll: {} state={:?} idle={}s sessions={}",
                    key,
                    session.state(),
                    session.last_byte_at().elapsed().as_secs(),
                    sessions.len()
                );
            }
        }
    }
}

/// Allow-list admission. Admitted devices yield their modem type so the
/// session routes records to the matching collections. Without a store
/// the gateway is in degraded accept-and-log mode: nothing will be
/// persisted anyway.
fn admit(db: &Option<Db>, imei: &Imei) -> Option<String> {
    let Some(db) = db else {
        return Some(crate::models::default_modem_type());
    };
    match db.get_device(imei) {
        Ok(Some(device)) if device.approved => Some(device.modem_type),
        Ok(_) => None,
        Err(e) => {
            error!("Admission lookup failed for {}: {}", imei, e);
            None
        }
    }
}

/// Best-effort persistence of one acked frame: raw capture, normalized
/// records, device bookkeeping. Store errors are logged and swallowed;
/// the device retransmits on its next cycle if the ack got lost, and
/// duplicates die at the unique index.
fn persist_packet(
    session: &mut Session,
    db: &Option<Db>,
    rawlog: &RawLog,
    packet: &crate::codec::DecodedPacket,
    raw: &[u8],
) {
    let Some(imei) = session.imei().cloned() else {
        return;
    };
    let now = Utc::now();
    let frame_hex = hex::encode(raw);
    rawlog.append(now, &imei, &frame_hex);

    let Some(db) = db else {
        return;
    };

    let modem_type = session.device_type().to_string();
    let raw_frame = RawFrame {
        imei: imei.clone(),
        vin: session.vin().map(str::to_string),
        modem_type: modem_type.clone(),
        raw_hex: frame_hex,
        timestamp: now,
    };
    if let Err(e) = db.insert_raw(&raw_frame) {
        error!("Raw frame insert failed for {}: {}", imei, e);
    }

    for avl in &packet.records {
        let record = normalizer::normalize(&imei, avl);

        if let Some(vin) = record.vin() {
            if session.observe_vin(vin) {
                if let Err(e) = db.record_vin(&imei, vin, now) {
                    error!("VIN update failed for {}: {}", imei, e);
                }
            }
        }

        if let Err(e) = db.insert_record(&modem_type, &record) {
            error!("Record insert failed for {}: {}", imei, e);
        }
    }

    if let Err(e) = db.touch_last_seen(&imei, now) {
        error!("lastSeen update failed for {}: {}", imei, e);
    }
}
