//! GStreamer data protocol (GDP 1.0) packets, the framing `gdpdepay` reads.
//!
//! Every packet is a fixed 62 byte big-endian header followed by its payload.
//! A caps packet announcing the media type must precede the first buffer.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Timestamp, TrackKind};

pub const HEADER_LEN: usize = 62;

const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
const PAYLOAD_BUFFER: u16 = 1;
const PAYLOAD_CAPS: u16 = 2;
const CLOCK_TIME_NONE: u64 = u64::MAX;

/// Caps matching what the depacketizers emit for each kind.
pub fn caps_for(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Video => "video/x-h264,stream-format=byte-stream,alignment=au",
        TrackKind::Audio => "audio/x-opus,channel-mapping-family=0",
    }
}

fn header_start(payload_type: u16, payload_len: u32) -> BytesMut {
    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u8(VERSION_MAJOR);
    header.put_u8(VERSION_MINOR);
    header.put_u8(0); // flags: no crc
    header.put_u8(0);
    header.put_u16(payload_type);
    header.put_u32(payload_len);
    header
}

/// Caps packet; the payload is the caps string with its NUL terminator.
pub fn caps_packet(caps: &str) -> Bytes {
    let payload_len = caps.len() + 1;
    let mut packet = header_start(PAYLOAD_CAPS, payload_len as u32);
    packet.put_bytes(0, HEADER_LEN - packet.len());
    packet.put_slice(caps.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

/// Header for a buffer packet carrying `payload_len` bytes stamped with `timestamp`.
pub fn buffer_header(payload_len: u32, timestamp: Timestamp) -> Bytes {
    let pts = match timestamp {
        Timestamp::At(pts) => u64::try_from(pts.as_nanos()).unwrap_or(CLOCK_TIME_NONE),
        Timestamp::Unspecified => CLOCK_TIME_NONE,
    };
    let mut header = header_start(PAYLOAD_BUFFER, payload_len);
    header.put_u64(pts);
    header.put_u64(CLOCK_TIME_NONE); // duration
    header.put_u64(CLOCK_TIME_NONE); // offset
    header.put_u64(CLOCK_TIME_NONE); // offset end
    header.put_u16(0); // buffer flags
    header.put_u64(CLOCK_TIME_NONE); // dts
    header.put_bytes(0, HEADER_LEN - header.len());
    header.freeze()
}
