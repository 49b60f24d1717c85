//! Telemetry wire format.
//!
//! A frame is `u8` part count followed by that many parts, each a `u32`
//! big-endian length plus bytes:
//!
//! | parts | layout |
//! |---|---|
//! | 3 | scheme, version, payload |
//! | 4 | scheme, version, topic, payload |
//! | 5 | scheme, version, window, topic, payload |
//!
//! Scheme is the ASCII string `"telemetry"`, version is the single byte `1`.
//! Topic is `"key"` or `"error"`. Strings inside payloads are `u32`
//! big-endian length plus UTF-8.
//!
//! `error` payload: `mine ∥ kind ∥ theirs`.
//! `key` payload: `name ∥ reportable(u8) ∥ units ∥ description ∥
//! attributes(u32 count, then key/value pairs)`. Units is a `u8` tag
//! optionally followed by base/time-unit bytes.

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use chemist_state::{Base, Key, Names, Reportable, TimeUnit, Units};

pub const SCHEME: &str = "telemetry";
pub const VERSION: u8 = 1;

/// Upper bound on any single part, so a corrupt length cannot allocate
/// unbounded memory.
pub const MAX_PART_LEN: usize = 1 << 20;

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors raised by the telemetry codec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated frame")]
    Truncated,

    #[error("bad scheme: {0:?}")]
    BadScheme(String),

    #[error("unsupported version: {0}")]
    BadVersion(u8),

    #[error("bad part count: {0}")]
    BadPartCount(u8),

    #[error("part of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("invalid utf-8 in frame")]
    BadUtf8,

    #[error("unknown reportable index: {0}")]
    UnknownReportable(u8),

    #[error("unknown units index: {0}")]
    UnknownUnits(u8),

    #[error("unknown base index: {0}")]
    UnknownBase(u8),

    #[error("unknown time unit index: {0}")]
    UnknownTimeUnit(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded telemetry frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub window: Option<u8>,
    pub topic: Option<String>,
    pub payload: Vec<u8>,
}

/// A demultiplexed telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    Key(Key),
    Error(Names),
    /// A valid frame on a topic this subscriber does not handle.
    Unknown { topic: Option<String> },
}

// ── Frame I/O ──────────────────────────────────────────────────────

/// Read one frame off a stream.
pub async fn read_frame<R>(reader: &mut R) -> DecodeResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u8().await?;
    if !(3..=5).contains(&count) {
        return Err(DecodeError::BadPartCount(count));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_PART_LEN {
            return Err(DecodeError::FrameTooLarge(len));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }
    frame_from_parts(parts)
}

/// Assemble and validate a frame from its raw parts.
pub fn frame_from_parts(parts: Vec<Vec<u8>>) -> DecodeResult<Frame> {
    if !(3..=5).contains(&parts.len()) {
        return Err(DecodeError::BadPartCount(parts.len() as u8));
    }
    let mut parts = parts.into_iter();

    let scheme_part = parts.next().ok_or(DecodeError::Truncated)?;
    let scheme = String::from_utf8(scheme_part).map_err(|_| DecodeError::BadUtf8)?;
    if scheme != SCHEME {
        return Err(DecodeError::BadScheme(scheme));
    }

    let version_part = parts.next().ok_or(DecodeError::Truncated)?;
    let &[version] = version_part.as_slice() else {
        return Err(DecodeError::Truncated);
    };
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let remaining: Vec<Vec<u8>> = parts.collect();
    let (window, topic, payload) = match remaining.len() {
        1 => {
            let [payload] = <[Vec<u8>; 1]>::try_from(remaining).map_err(|_| DecodeError::Truncated)?;
            (None, None, payload)
        }
        2 => {
            let [topic, payload] =
                <[Vec<u8>; 2]>::try_from(remaining).map_err(|_| DecodeError::Truncated)?;
            let topic = String::from_utf8(topic).map_err(|_| DecodeError::BadUtf8)?;
            (None, Some(topic), payload)
        }
        3 => {
            let [window, topic, payload] =
                <[Vec<u8>; 3]>::try_from(remaining).map_err(|_| DecodeError::Truncated)?;
            let &[window] = window.as_slice() else {
                return Err(DecodeError::Truncated);
            };
            let topic = String::from_utf8(topic).map_err(|_| DecodeError::BadUtf8)?;
            (Some(window), Some(topic), payload)
        }
        _ => return Err(DecodeError::Truncated),
    };

    Ok(Frame {
        version,
        window,
        topic,
        payload,
    })
}

/// Serialize a frame to wire bytes.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut parts: Vec<Vec<u8>> = vec![SCHEME.as_bytes().to_vec(), vec![frame.version]];
    if let Some(window) = frame.window {
        parts.push(vec![window]);
    }
    if let Some(topic) = &frame.topic {
        parts.push(topic.as_bytes().to_vec());
    }
    parts.push(frame.payload.clone());

    let mut out = Vec::new();
    out.put_u8(parts.len() as u8);
    for part in parts {
        out.put_u32(part.len() as u32);
        out.extend_from_slice(&part);
    }
    out
}

/// Demultiplex a frame by topic.
pub fn decode_telemetry(frame: &Frame) -> DecodeResult<Telemetry> {
    match frame.topic.as_deref() {
        Some("key") => Ok(Telemetry::Key(decode_key(&frame.payload)?)),
        Some("error") => Ok(Telemetry::Error(decode_names(&frame.payload)?)),
        other => Ok(Telemetry::Unknown {
            topic: other.map(str::to_string),
        }),
    }
}

/// Frame a key message.
pub fn encode_key_frame(key: &Key) -> Vec<u8> {
    encode_frame(&Frame {
        version: VERSION,
        window: None,
        topic: Some("key".to_string()),
        payload: encode_key(key),
    })
}

/// Frame an error message.
pub fn encode_error_frame(names: &Names) -> Vec<u8> {
    encode_frame(&Frame {
        version: VERSION,
        window: None,
        topic: Some("error".to_string()),
        payload: encode_names(names),
    })
}

// ── Payload codecs ─────────────────────────────────────────────────

fn take_u8(buf: &mut &[u8]) -> DecodeResult<u8> {
    let (&first, rest) = buf.split_first().ok_or(DecodeError::Truncated)?;
    *buf = rest;
    Ok(first)
}

fn take_u32(buf: &mut &[u8]) -> DecodeResult<u32> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

fn take_string(buf: &mut &[u8]) -> DecodeResult<String> {
    let len = take_u32(buf)? as usize;
    if len > MAX_PART_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }
    if buf.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (head, rest) = buf.split_at(len);
    let s = std::str::from_utf8(head).map_err(|_| DecodeError::BadUtf8)?;
    *buf = rest;
    Ok(s.to_string())
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.put_u32(s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

pub fn encode_names(names: &Names) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, &names.mine);
    put_string(&mut out, &names.kind);
    put_string(&mut out, &names.theirs);
    out
}

pub fn decode_names(payload: &[u8]) -> DecodeResult<Names> {
    let mut buf = payload;
    let names = Names {
        mine: take_string(&mut buf)?,
        kind: take_string(&mut buf)?,
        theirs: take_string(&mut buf)?,
    };
    Ok(names)
}

fn reportable_index(reportable: Reportable) -> u8 {
    match reportable {
        Reportable::B => 0,
        Reportable::D => 1,
        Reportable::S => 2,
        Reportable::Stats => 3,
    }
}

fn reportable_from(index: u8) -> DecodeResult<Reportable> {
    match index {
        0 => Ok(Reportable::B),
        1 => Ok(Reportable::D),
        2 => Ok(Reportable::S),
        3 => Ok(Reportable::Stats),
        other => Err(DecodeError::UnknownReportable(other)),
    }
}

fn base_index(base: Base) -> u8 {
    match base {
        Base::Zero => 0,
        Base::Kilo => 1,
        Base::Mega => 2,
        Base::Giga => 3,
    }
}

fn base_from(index: u8) -> DecodeResult<Base> {
    match index {
        0 => Ok(Base::Zero),
        1 => Ok(Base::Kilo),
        2 => Ok(Base::Mega),
        3 => Ok(Base::Giga),
        other => Err(DecodeError::UnknownBase(other)),
    }
}

fn time_unit_index(unit: TimeUnit) -> u8 {
    match unit {
        TimeUnit::Days => 0,
        TimeUnit::Hours => 1,
        TimeUnit::Micro => 2,
        TimeUnit::Milli => 3,
        TimeUnit::Min => 4,
        TimeUnit::Nano => 5,
        TimeUnit::Sec => 6,
    }
}

fn time_unit_from(index: u8) -> DecodeResult<TimeUnit> {
    match index {
        0 => Ok(TimeUnit::Days),
        1 => Ok(TimeUnit::Hours),
        2 => Ok(TimeUnit::Micro),
        3 => Ok(TimeUnit::Milli),
        4 => Ok(TimeUnit::Min),
        5 => Ok(TimeUnit::Nano),
        6 => Ok(TimeUnit::Sec),
        other => Err(DecodeError::UnknownTimeUnit(other)),
    }
}

fn encode_units(out: &mut Vec<u8>, units: Units) {
    match units {
        Units::Duration { base, unit } => {
            out.put_u8(0);
            out.put_u8(base_index(base));
            out.put_u8(time_unit_index(unit));
        }
        Units::Bytes { base } => {
            out.put_u8(1);
            out.put_u8(base_index(base));
        }
        Units::Count => out.put_u8(2),
        Units::Ratio => out.put_u8(3),
        Units::TrafficLight => out.put_u8(4),
        Units::Healthy => out.put_u8(5),
        Units::Load => out.put_u8(6),
        Units::None => out.put_u8(7),
    }
}

fn decode_units(buf: &mut &[u8]) -> DecodeResult<Units> {
    match take_u8(buf)? {
        0 => Ok(Units::Duration {
            base: base_from(take_u8(buf)?)?,
            unit: time_unit_from(take_u8(buf)?)?,
        }),
        1 => Ok(Units::Bytes {
            base: base_from(take_u8(buf)?)?,
        }),
        2 => Ok(Units::Count),
        3 => Ok(Units::Ratio),
        4 => Ok(Units::TrafficLight),
        5 => Ok(Units::Healthy),
        6 => Ok(Units::Load),
        7 => Ok(Units::None),
        other => Err(DecodeError::UnknownUnits(other)),
    }
}

pub fn encode_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, &key.name);
    out.put_u8(reportable_index(key.reportable));
    encode_units(&mut out, key.units);
    put_string(&mut out, &key.description);
    out.put_u32(key.attributes.len() as u32);
    for (attr, value) in &key.attributes {
        put_string(&mut out, attr);
        put_string(&mut out, value);
    }
    out
}

pub fn decode_key(payload: &[u8]) -> DecodeResult<Key> {
    let mut buf = payload;
    let name = take_string(&mut buf)?;
    let reportable = reportable_from(take_u8(&mut buf)?)?;
    let units = decode_units(&mut buf)?;
    let description = take_string(&mut buf)?;

    let count = take_u32(&mut buf)? as usize;
    let mut attributes = std::collections::BTreeMap::new();
    for _ in 0..count {
        let attr = take_string(&mut buf)?;
        let value = take_string(&mut buf)?;
        attributes.insert(attr, value);
    }

    Ok(Key {
        name,
        reportable,
        units,
        description,
        attributes,
    })
}
