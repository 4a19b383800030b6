//! Per-connection session state machine and framing.
//!
//! TCP delivers a byte stream; this module accumulates bytes, extracts
//! whole frames, and walks the login/streaming life cycle. It is written
//! socket-free: [`Session::feed`] consumes bytes and emits
//! [`SessionOutput`] actions for the connection driver to execute, so the
//! whole protocol is testable without I/O.
//!
//! ```text
//!   AwaitingLogin --(valid 15-digit IMEI frame)--> AwaitingAuth
//!   AwaitingLogin --(15s timer | malformed)------> Closed  (no reply)
//!   AwaitingAuth  --(device approved)------------> Streaming (reply 0x01)
//!   AwaitingAuth  --(unknown | denied)-----------> Closed    (reply 0x00)
//!   Streaming     --(AVL frame decoded OK)-------> Streaming (reply count)
//!   Streaming     --(decode error)---------------> Streaming (no reply)
//!   any           --(peer close | socket error)--> Closed
//! ```

use crate::codec::{self, DecodeError, DecodedPacket, FRAME_OVERHEAD};
use crate::models::Imei;

/// Login reply byte: accepted.
pub const LOGIN_ACCEPT: u8 = 0x01;
/// Login reply byte: rejected.
pub const LOGIN_REJECT: u8 = 0x00;

/// Largest `dataFieldLength` the framing layer will buffer. Anything
/// larger cannot be a real AVL payload and indicates stream desync.
pub const MAX_DATA_FIELD_LENGTH: usize = 65_535;

/// Connection life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingLogin,
    /// IMEI parsed, admission decision pending.
    AwaitingAuth,
    Streaming,
    Closed,
}

/// Action requested of the connection driver.
#[derive(Debug, PartialEq)]
pub enum SessionOutput {
    /// A syntactically valid login arrived; the driver must consult the
    /// allow-list and call [`Session::resolve_login`].
    LoginAttempt(Imei),
    /// A login frame that is not a 15-digit IMEI. No reply is sent; the
    /// unauthenticated timer will close the connection.
    MalformedLogin,
    /// Bytes to write to the peer.
    Reply(Vec<u8>),
    /// A whole frame decoded successfully, with its original bytes for
    /// raw capture.
    Packet {
        packet: DecodedPacket,
        raw: Vec<u8>,
    },
    /// A whole frame failed to decode; it is dropped and the connection
    /// stays open.
    DecodeFailed(DecodeError),
    /// Stream desync or protocol violation; the driver must close.
    Disconnect,
}

/// Per-connection state. One instance per TCP connection; never shared.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    buffer: Vec<u8>,
    imei: Option<Imei>,
    vin: Option<String>,
    device_type: String,
    last_byte_at: std::time::Instant,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingLogin,
            buffer: Vec::new(),
            imei: None,
            vin: None,
            device_type: crate::models::default_modem_type(),
            last_byte_at: std::time::Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn imei(&self) -> Option<&Imei> {
        self.imei.as_ref()
    }

    pub fn vin(&self) -> Option<&str> {
        self.vin.as_deref()
    }

    /// Remember the VIN observed in the record stream. Returns true the
    /// first time, so the driver updates the device document only once.
    pub fn observe_vin(&mut self, vin: &str) -> bool {
        if self.vin.is_none() {
            self.vin = Some(vin.to_string());
            true
        } else {
            false
        }
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Set once at admission, from the device document.
    pub fn set_device_type(&mut self, device_type: String) {
        self.device_type = device_type;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// When the peer last sent anything.
    pub fn last_byte_at(&self) -> std::time::Instant {
        self.last_byte_at
    }

    /// Consume incoming bytes and emit the resulting actions.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SessionOutput> {
        if !bytes.is_empty() {
            self.last_byte_at = std::time::Instant::now();
        }
        self.buffer.extend_from_slice(bytes);
        let mut outputs = Vec::new();

        loop {
            match self.state {
                SessionState::AwaitingLogin => {
                    match self.try_take_login() {
                        LoginParse::NeedMore => break,
                        LoginParse::Valid(imei) => {
                            self.imei = Some(imei.clone());
                            self.state = SessionState::AwaitingAuth;
                            outputs.push(SessionOutput::LoginAttempt(imei));
                            // Any further bytes stay buffered until the
                            // admission decision arrives.
                            break;
                        }
                        LoginParse::Malformed => {
                            self.buffer.clear();
                            outputs.push(SessionOutput::MalformedLogin);
                            break;
                        }
                    }
                }
                SessionState::AwaitingAuth => break,
                SessionState::Streaming => match self.try_take_frame() {
                    FrameParse::NeedMore => break,
                    FrameParse::Oversize => {
                        outputs.push(SessionOutput::Disconnect);
                        self.state = SessionState::Closed;
                        break;
                    }
                    FrameParse::Frame(raw) => match codec::decode_frame(&raw) {
                        Ok(packet) => {
                            let count = packet.records.len() as u32;
                            outputs.push(SessionOutput::Packet { packet, raw });
                            outputs.push(SessionOutput::Reply(count.to_be_bytes().to_vec()));
                        }
                        Err(err) => outputs.push(SessionOutput::DecodeFailed(err)),
                    },
                },
                SessionState::Closed => break,
            }
        }

        outputs
    }

    /// Apply the admission decision for a pending login.
    ///
    /// Returns the reply byte to write; on rejection the driver closes
    /// the connection after writing it.
    pub fn resolve_login(&mut self, approved: bool) -> u8 {
        debug_assert_eq!(self.state, SessionState::AwaitingAuth);
        if approved {
            self.state = SessionState::Streaming;
            LOGIN_ACCEPT
        } else {
            self.state = SessionState::Closed;
            LOGIN_REJECT
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn try_take_login(&mut self) -> LoginParse {
        if self.buffer.len() < 2 {
            return LoginParse::NeedMore;
        }
        let declared = usize::from(u16::from_be_bytes([self.buffer[0], self.buffer[1]]));
        if self.buffer.len() < 2 + declared {
            return LoginParse::NeedMore;
        }
        if declared != 15 {
            return LoginParse::Malformed;
        }
        let imei_bytes = &self.buffer[2..17];
        let Ok(text) = std::str::from_utf8(imei_bytes) else {
            return LoginParse::Malformed;
        };
        match Imei::try_from(text) {
            Ok(imei) => {
                self.buffer.drain(..17);
                LoginParse::Valid(imei)
            }
            Err(_) => LoginParse::Malformed,
        }
    }

    fn try_take_frame(&mut self) -> FrameParse {
        if self.buffer.len() < 8 {
            return FrameParse::NeedMore;
        }
        let data_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        if data_len > MAX_DATA_FIELD_LENGTH {
            return FrameParse::Oversize;
        }
        let total = data_len + FRAME_OVERHEAD;
        if self.buffer.len() < total {
            return FrameParse::NeedMore;
        }
        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        FrameParse::Frame(frame)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

enum LoginParse {
    NeedMore,
    Valid(Imei),
    Malformed,
}

enum FrameParse {
    NeedMore,
    Oversize,
    Frame(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use crate::codec::{encode_frame, AvlRecord, Codec, IoPayload, RawGps, RawIo};

    use super::*;

    fn login_bytes(imei: &str) -> Vec<u8> {
        let mut bytes = (imei.len() as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(imei.as_bytes());
        bytes
    }

    fn sample_frame() -> Vec<u8> {
        let record = AvlRecord {
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
            event_io_id: 239,
            io: vec![
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
            ],
        };
        encode_frame(Codec::Extended, &[record])
    }

    fn streaming_session() -> Session {
        let mut session = Session::new();
        let outputs = session.feed(&login_bytes("864275079658715"));
        assert!(matches!(outputs[0], SessionOutput::LoginAttempt(_)));
        assert_eq!(session.resolve_login(true), LOGIN_ACCEPT);
        session
    }

    #[test]
    fn valid_login_requests_admission() {
        let mut session = Session::new();
        let outputs = session.feed(&login_bytes("864275079658715"));
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            SessionOutput::LoginAttempt(imei) => {
                assert_eq!(imei.as_str(), "864275079658715")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.state(), SessionState::AwaitingAuth);
    }

    #[test]
    fn accepted_login_streams() {
        let session = streaming_session();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn rejected_login_closes() {
        let mut session = Session::new();
        session.feed(&login_bytes("864275079658715"));
        assert_eq!(session.resolve_login(false), LOGIN_REJECT);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn short_imei_is_malformed_and_stays_awaiting_login() {
        let mut session = Session::new();
        let outputs = session.feed(&login_bytes("86427507965871")); // 14 digits
        assert_eq!(outputs, vec![SessionOutput::MalformedLogin]);
        assert_eq!(session.state(), SessionState::AwaitingLogin);
    }

    #[test]
    fn non_digit_imei_is_malformed() {
        let mut session = Session::new();
        let outputs = session.feed(&login_bytes("86427507965871a"));
        assert_eq!(outputs, vec![SessionOutput::MalformedLogin]);
        assert_eq!(session.state(), SessionState::AwaitingLogin);
    }

    #[test]
    fn split_login_waits_for_more_bytes() {
        let mut session = Session::new();
        let bytes = login_bytes("864275079658715");
        assert!(session.feed(&bytes[..9]).is_empty());
        let outputs = session.feed(&bytes[9..]);
        assert!(matches!(outputs[0], SessionOutput::LoginAttempt(_)));
    }

    #[test]
    fn frame_acked_with_record_count() {
        let mut session = streaming_session();
        let frame = sample_frame();
        let outputs = session.feed(&frame);
        assert_eq!(outputs.len(), 2);
        match &outputs[0] {
            SessionOutput::Packet { packet, raw } => {
                assert_eq!(packet.records.len(), 1);
                assert_eq!(raw, &frame);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            outputs[1],
            SessionOutput::Reply(vec![0x00, 0x00, 0x00, 0x01])
        );
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut session = streaming_session();
        let frame = sample_frame();
        let (a, b) = frame.split_at(frame.len() / 2);
        assert!(session.feed(a).is_empty());
        let outputs = session.feed(b);
        assert!(matches!(outputs[0], SessionOutput::Packet { .. }));
    }

    #[test]
    fn two_frames_in_one_read_both_acked() {
        let mut session = streaming_session();
        let mut bytes = sample_frame();
        bytes.extend_from_slice(&sample_frame());
        let outputs = session.feed(&bytes);
        let packets = outputs
            .iter()
            .filter(|o| matches!(o, SessionOutput::Packet { .. }))
            .count();
        let replies = outputs
            .iter()
            .filter(|o| matches!(o, SessionOutput::Reply(_)))
            .count();
        assert_eq!(packets, 2);
        assert_eq!(replies, 2);
    }

    #[test]
    fn excess_bytes_stay_buffered_for_next_frame() {
        let mut session = streaming_session();
        let frame = sample_frame();
        let mut bytes = frame.clone();
        bytes.extend_from_slice(&frame[..5]);
        let outputs = session.feed(&bytes);
        assert_eq!(outputs.len(), 2); // one packet, one ack
        let outputs = session.feed(&frame[5..]);
        assert!(matches!(outputs[0], SessionOutput::Packet { .. }));
    }

    #[test]
    fn decode_error_drops_frame_without_reply() {
        let mut session = streaming_session();
        let mut frame = sample_frame();
        frame[8] = 0x0C; // unknown codec id
        let outputs = session.feed(&frame);
        assert!(matches!(outputs[0], SessionOutput::DecodeFailed(_)));
        assert_eq!(outputs.len(), 1);
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn oversize_length_field_disconnects() {
        let mut session = streaming_session();
        let mut bytes = vec![0, 0, 0, 0];
        bytes.extend_from_slice(&0x00FF_FFFFu32.to_be_bytes());
        let outputs = session.feed(&bytes);
        assert_eq!(outputs, vec![SessionOutput::Disconnect]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn frame_pipelined_behind_login_is_processed_after_admission() {
        let mut session = Session::new();
        let mut bytes = login_bytes("864275079658715");
        bytes.extend_from_slice(&sample_frame());

        let outputs = session.feed(&bytes);
        assert_eq!(outputs.len(), 1); // only the login attempt
        session.resolve_login(true);

        let outputs = session.feed(&[]);
        assert!(matches!(outputs[0], SessionOutput::Packet { .. }));
    }

    #[test]
    fn vin_observed_only_once() {
        let mut session = streaming_session();
        assert!(session.observe_vin("WVWZZZ1JZ3W386752"));
        assert!(!session.observe_vin("WVWZZZ1JZ3W386752"));
        assert_eq!(session.vin(), Some("WVWZZZ1JZ3W386752"));
    }
}
