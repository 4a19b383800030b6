//! Codec 8 / Codec 8E AVL frame decoding.
//!
//! Teltonika devices frame AVL data as:
//!
//! ```text
//!   4B preamble        (always 0x00000000)
//!   4B dataFieldLength (codecId .. numberOfData2, inclusive)
//!   1B codecId         (0x08 standard, 0x8E extended)
//!   1B numberOfData1
//!   <records>
//!   1B numberOfData2   (must equal numberOfData1)
//!   4B CRC-16/IBM, zero-padded, over [codecId .. numberOfData2]
//! ```
//!
//! All integers are big-endian. The two codecs differ only in field
//! widths: Codec 8 uses 1-byte IO ids and counts, Codec 8E uses 2-byte
//! ones and appends a variable-length (NX) group. Decoding is a single
//! bounded pass over the input; the reader can never run past the slice.

use thiserror::Error;

/// Wire id of Codec 8.
pub const CODEC_8: u8 = 0x08;
/// Wire id of Codec 8 Extended.
pub const CODEC_8_EXT: u8 = 0x8E;

/// Frame envelope bytes outside `dataFieldLength`: preamble + length
/// field before the payload, CRC field after it.
pub const FRAME_OVERHEAD: usize = 12;

/// Decode failure, carrying the byte offset at which it occurred.
///
/// Any decode error invalidates the whole frame; partial records must not
/// be persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short read at offset {offset}: need {needed} more bytes")]
    ShortRead { offset: usize, needed: usize },

    #[error("preamble {found:#010x} is not zero")]
    BadPreamble { found: u32 },

    #[error("unknown codec id {id:#04x} at offset {offset}")]
    UnknownCodec { id: u8, offset: usize },

    #[error("record count mismatch: header {header}, trailer {trailer}")]
    CountMismatch { header: u8, trailer: u8 },

    #[error("declared data field length {declared} but payload is {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("io element count mismatch at offset {offset}: declared {declared}, parsed {parsed}")]
    ElementCountMismatch {
        declared: u16,
        parsed: u16,
        offset: usize,
    },
}

/// The two supported wire framings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Standard,
    Extended,
}

impl Codec {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            CODEC_8 => Some(Codec::Standard),
            CODEC_8_EXT => Some(Codec::Extended),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Codec::Standard => CODEC_8,
            Codec::Extended => CODEC_8_EXT,
        }
    }
}

/// GPS element exactly as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawGps {
    /// Signed, scaled by 10^7.
    pub longitude: i32,
    /// Signed, scaled by 10^7.
    pub latitude: i32,
    pub altitude: u16,
    pub angle: u16,
    pub satellites: u8,
    pub speed: u16,
}

/// IO element payload: fixed-width groups carry integers, the NX group
/// carries opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoPayload {
    Int(u64),
    Bytes(Vec<u8>),
}

/// One IO element, prior to any semantic interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawIo {
    pub id: u16,
    /// Payload width in bytes; for NX elements, the declared length.
    pub size: u16,
    pub payload: IoPayload,
}

/// One AVL record as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvlRecord {
    /// Milliseconds since the Unix epoch, unsigned.
    pub timestamp_ms: u64,
    /// 0 = low, 1 = high, 2 = panic.
    pub priority: u8,
    pub gps: RawGps,
    /// IO id that triggered this record; zero on periodic records.
    pub event_io_id: u16,
    pub io: Vec<RawIo>,
}

/// A fully decoded frame.
///
/// CRC agreement is reported rather than enforced: observed field traffic
/// includes frames whose CRC field disagrees with the payload, and the
/// rejection policy is a deployment decision (`tcp.reject_bad_crc`).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub codec: Codec,
    pub records: Vec<AvlRecord>,
    pub crc_ok: bool,
    pub crc_found: u16,
    pub crc_computed: u16,
}

/// CRC-16/IBM (polynomial 0x8005, reflected), as used by Teltonika over
/// `[codecId .. numberOfData2]`.
pub fn crc16_ibm(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Bounded big-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::ShortRead {
                offset: self.pos,
                needed: n - (self.buf.len() - self.pos),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Unsigned big-endian integer of 1, 2, 4 or 8 bytes.
    fn read_uint(&mut self, width: usize) -> Result<u64, DecodeError> {
        let b = self.take(width)?;
        let mut value: u64 = 0;
        for &byte in b {
            value = (value << 8) | u64::from(byte);
        }
        Ok(value)
    }
}

/// Decode a single whole frame.
///
/// The input must contain exactly one frame, preamble through CRC, as
/// extracted by the session framing layer. Decoding never reads past the
/// slice and is stateless across calls.
pub fn decode_frame(input: &[u8]) -> Result<DecodedPacket, DecodeError> {
    let mut r = Reader::new(input);

    let preamble = r.read_u32()?;
    if preamble != 0 {
        return Err(DecodeError::BadPreamble { found: preamble });
    }
    let declared_len = r.read_u32()? as usize;

    let payload_start = r.pos;
    let codec_offset = r.pos;
    let codec_id = r.read_u8()?;
    let codec = Codec::from_id(codec_id).ok_or(DecodeError::UnknownCodec {
        id: codec_id,
        offset: codec_offset,
    })?;

    let count1 = r.read_u8()?;
    let mut records = Vec::with_capacity(usize::from(count1));
    for _ in 0..count1 {
        records.push(read_record(&mut r, codec)?);
    }
    let count2 = r.read_u8()?;
    if count1 != count2 {
        return Err(DecodeError::CountMismatch {
            header: count1,
            trailer: count2,
        });
    }

    let payload_end = r.pos;
    let actual_len = payload_end - payload_start;
    if actual_len != declared_len {
        return Err(DecodeError::LengthMismatch {
            declared: declared_len,
            actual: actual_len,
        });
    }

    let crc_found = r.read_u32()? as u16;
    let crc_computed = crc16_ibm(&input[payload_start..payload_end]);

    Ok(DecodedPacket {
        codec,
        records,
        crc_ok: crc_found == crc_computed,
        crc_found,
        crc_computed,
    })
}

fn read_record(r: &mut Reader<'_>, codec: Codec) -> Result<AvlRecord, DecodeError> {
    let timestamp_ms = r.read_u64()?;
    let priority = r.read_u8()?;

    let longitude = r.read_u32()? as i32;
    let latitude = r.read_u32()? as i32;
    let altitude = r.read_u16()?;
    let angle = r.read_u16()?;
    let satellites = r.read_u8()?;
    let speed = r.read_u16()?;

    let read_id = |r: &mut Reader<'_>| -> Result<u16, DecodeError> {
        match codec {
            Codec::Standard => r.read_u8().map(u16::from),
            Codec::Extended => r.read_u16(),
        }
    };

    let element_offset = r.pos;
    let event_io_id = read_id(r)?;
    let declared_total = read_id(r)?;

    let mut io = Vec::with_capacity(usize::from(declared_total));
    for width in [1usize, 2, 4, 8] {
        let count = read_id(r)?;
        for _ in 0..count {
            let id = read_id(r)?;
            let value = r.read_uint(width)?;
            io.push(RawIo {
                id,
                size: width as u16,
                payload: IoPayload::Int(value),
            });
        }
    }

    if codec == Codec::Extended {
        let count = r.read_u16()?;
        for _ in 0..count {
            let id = r.read_u16()?;
            let len = r.read_u16()?;
            let bytes = r.take(usize::from(len))?;
            io.push(RawIo {
                id,
                size: len,
                payload: IoPayload::Bytes(bytes.to_vec()),
            });
        }
    }

    let parsed = io.len() as u16;
    if parsed != declared_total {
        return Err(DecodeError::ElementCountMismatch {
            declared: declared_total,
            parsed,
            offset: element_offset,
        });
    }

    Ok(AvlRecord {
        timestamp_ms,
        priority,
        gps: RawGps {
            longitude,
            latitude,
            altitude,
            angle,
            satellites,
            speed,
        },
        event_io_id,
        io,
    })
}

/// Big-endian writer used by the reference encoder.
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_uint(&mut self, v: u64, width: usize) {
        let bytes = v.to_be_bytes();
        self.buf.extend_from_slice(&bytes[8 - width..]);
    }
}

/// Reference encoder for Codec 8 / 8E frames.
///
/// Produces a whole frame, preamble through CRC. Used by fixtures and by
/// the round-trip tests; the server itself only decodes. NX elements
/// (`IoPayload::Bytes`) require `Codec::Extended`.
pub fn encode_frame(codec: Codec, records: &[AvlRecord]) -> Vec<u8> {
    let mut payload = Writer::new();
    payload.put_u8(codec.id());
    payload.put_u8(records.len() as u8);

    let put_id = |w: &mut Writer, id: u16| match codec {
        Codec::Standard => w.put_u8(id as u8),
        Codec::Extended => w.put_u16(id),
    };

    for record in records {
        payload.put_u64(record.timestamp_ms);
        payload.put_u8(record.priority);
        payload.put_u32(record.gps.longitude as u32);
        payload.put_u32(record.gps.latitude as u32);
        payload.put_u16(record.gps.altitude);
        payload.put_u16(record.gps.angle);
        payload.put_u8(record.gps.satellites);
        payload.put_u16(record.gps.speed);

        put_id(&mut payload, record.event_io_id);
        put_id(&mut payload, record.io.len() as u16);

        for width in [1u16, 2, 4, 8] {
            let group: Vec<&RawIo> = record
                .io
                .iter()
                .filter(|io| matches!(io.payload, IoPayload::Int(_)) && io.size == width)
                .collect();
            put_id(&mut payload, group.len() as u16);
            for io in group {
                put_id(&mut payload, io.id);
                if let IoPayload::Int(v) = io.payload {
                    payload.put_uint(v, usize::from(width));
                }
            }
        }

        if codec == Codec::Extended {
            let group: Vec<&RawIo> = record
                .io
                .iter()
                .filter(|io| matches!(io.payload, IoPayload::Bytes(_)))
                .collect();
            payload.put_u16(group.len() as u16);
            for io in group {
                if let IoPayload::Bytes(bytes) = &io.payload {
                    payload.put_u16(io.id);
                    payload.put_u16(bytes.len() as u16);
                    payload.buf.extend_from_slice(bytes);
                }
            }
        }
    }

    payload.put_u8(records.len() as u8);

    let mut frame = Writer::new();
    frame.put_u32(0);
    frame.put_u32(payload.buf.len() as u32);
    frame.buf.extend_from_slice(&payload.buf);
    frame.put_u32(u32::from(crc16_ibm(&payload.buf)));
    frame.buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_io(id: u16, size: u16, value: u64) -> RawIo {
        RawIo {
            id,
            size,
            payload: IoPayload::Int(value),
        }
    }

    fn sample_record() -> AvlRecord {
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
            event_io_id: 239,
            io: vec![
                int_io(239, 1, 1),
                int_io(240, 1, 1),
                int_io(24, 2, 52),
                int_io(16, 4, 123_456),
                int_io(192, 8, 9_007_199_254_740_995),
            ],
        }
    }

    #[test]
    fn codec8_round_trip() {
        let record = sample_record();
        let frame = encode_frame(Codec::Standard, &[record.clone()]);
        let packet = decode_frame(&frame).unwrap();

        assert_eq!(packet.codec, Codec::Standard);
        assert!(packet.crc_ok);
        assert_eq!(packet.records, vec![record]);

        // Re-encoding reproduces the byte sequence.
        assert_eq!(encode_frame(Codec::Standard, &packet.records), frame);
    }

    #[test]
    fn codec8e_round_trip_with_nx() {
        let mut record = sample_record();
        record.io.push(RawIo {
            id: 256,
            size: 17,
            payload: IoPayload::Bytes(b"WVWZZZ1JZ3W386752".to_vec()),
        });
        let frame = encode_frame(Codec::Extended, &[record.clone()]);
        let packet = decode_frame(&frame).unwrap();

        assert_eq!(packet.codec, Codec::Extended);
        assert!(packet.crc_ok);
        assert_eq!(packet.records, vec![record]);
        assert_eq!(encode_frame(Codec::Extended, &packet.records), frame);
    }

    #[test]
    fn eight_byte_values_above_2_pow_53_survive() {
        let mut record = sample_record();
        record.io = vec![int_io(192, 8, (1u64 << 53) + 17)];
        let frame = encode_frame(Codec::Extended, &[record]);
        let packet = decode_frame(&frame).unwrap();
        assert_eq!(
            packet.records[0].io[0].payload,
            IoPayload::Int((1u64 << 53) + 17)
        );
    }

    #[test]
    fn truncation_yields_short_read_everywhere() {
        let frame = encode_frame(Codec::Extended, &[sample_record()]);
        for len in 0..frame.len() {
            match decode_frame(&frame[..len]) {
                Err(DecodeError::ShortRead { offset, .. }) => assert!(offset <= len),
                Err(DecodeError::LengthMismatch { .. }) => {
                    // Truncating inside the CRC field leaves a consistent
                    // payload with a short trailer; still an error.
                }
                other => panic!("prefix of {len} bytes: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn bad_preamble_rejected() {
        let mut frame = encode_frame(Codec::Standard, &[sample_record()]);
        frame[0] = 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::BadPreamble { .. })
        ));
    }

    #[test]
    fn unknown_codec_rejected() {
        let mut frame = encode_frame(Codec::Standard, &[sample_record()]);
        frame[8] = 0x0C;
        assert_eq!(
            decode_frame(&frame),
            Err(DecodeError::UnknownCodec {
                id: 0x0C,
                offset: 8
            })
        );
    }

    #[test]
    fn count_mismatch_rejected() {
        let frame = encode_frame(Codec::Standard, &[sample_record()]);
        let trailer = frame.len() - 5;
        let mut tampered = frame;
        tampered[trailer] = 2;
        assert_eq!(
            decode_frame(&tampered),
            Err(DecodeError::CountMismatch {
                header: 1,
                trailer: 2
            })
        );
    }

    #[test]
    fn crc_mismatch_is_reported_not_fatal() {
        let mut frame = encode_frame(Codec::Standard, &[sample_record()]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let packet = decode_frame(&frame).unwrap();
        assert!(!packet.crc_ok);
        assert_ne!(packet.crc_found, packet.crc_computed);
    }

    #[test]
    fn hand_built_codec8_frame_decodes() {
        // One record, timestamp 0x0000016B40D8EA30, priority 1, GPS all
        // zero with 0 satellites, event io 1, single 1-byte element 1=1.
        let payload: Vec<u8> = vec![
            0x08, // codec
            0x01, // numberOfData1
            0x00, 0x00, 0x01, 0x6B, 0x40, 0xD8, 0xEA, 0x30, // timestamp
            0x01, // priority
            0x00, 0x00, 0x00, 0x00, // longitude
            0x00, 0x00, 0x00, 0x00, // latitude
            0x00, 0x00, // altitude
            0x00, 0x00, // angle
            0x00, // satellites
            0x00, 0x00, // speed
            0x01, // event io id
            0x01, // total count
            0x01, // 1-byte count
            0x01, 0x01, // id 1 = 1
            0x00, // 2-byte count
            0x00, // 4-byte count
            0x00, // 8-byte count
            0x01, // numberOfData2
        ];
        let mut frame = Vec::new();
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&u32::from(crc16_ibm(&payload)).to_be_bytes());

        let packet = decode_frame(&frame).unwrap();
        assert!(packet.crc_ok);
        assert_eq!(packet.records.len(), 1);
        let record = &packet.records[0];
        assert_eq!(record.timestamp_ms, 0x0000_016B_40D8_EA30);
        assert_eq!(record.priority, 1);
        assert_eq!(record.event_io_id, 1);
        assert_eq!(record.io, vec![int_io(1, 1, 1)]);
    }

    #[test]
    fn signed_gps_coordinates_decode() {
        let mut record = sample_record();
        record.gps.longitude = -74_005_974 * 10; // west
        record.gps.latitude = -33_448_900 * 10; // south
        let frame = encode_frame(Codec::Standard, &[record.clone()]);
        let packet = decode_frame(&frame).unwrap();
        assert_eq!(packet.records[0].gps.longitude, record.gps.longitude);
        assert_eq!(packet.records[0].gps.latitude, record.gps.latitude);
    }
}
