//! Decoding of fetch replies, in both the ASCII and the binary wire format.
//!
//! An ASCII reply is one `;`-separated line:
//!
//! ```text
//! <Bx list>;<By list>;<Bz list>;<timestamp ns>;<temperature>;<status byte>
//! ```
//!
//! where each list is `,`-separated and may carry a trailing unit letter.
//!
//! A binary reply carries the three field components as IEEE 488.2 arbitrary
//! blocks of big-endian `i32`, followed by the same timestamp, temperature
//! and status fields as ASCII text:
//!
//! ```text
//! #<H><len><payload><4 bytes>#<H><len><payload><4 bytes>#<H><len><payload><1 byte><ts>;<temp>;<stb>\n
//! ```
//!
//! The last block is followed by a single byte before the text tail instead
//! of the four separating the blocks. This matches what the instrument sends
//! and must not be normalized.

use crate::{config::Configuration, sample::FetchKind, sample::SampleCycle, status::StatusByte};
use std::{fmt, str::FromStr};

/// Bytes between two consecutive binary blocks
const BLOCK_SEPARATOR: usize = 4;
/// Bytes between the last binary block and the ASCII tail
const TAIL_SEPARATOR: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error("No `#` block marker at or after byte {0}")]
    MissingBlockMarker(usize),
    #[error("Invalid block header at byte {0}")]
    InvalidBlockHeader(usize),
    #[error("Buffer truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Missing {0} field")]
    MissingField(FetchKind),
    #[error("Missing status byte")]
    MissingStatus,
    #[error("Could not parse `{token}` in the {kind} field")]
    Number { kind: FetchKind, token: String },
    #[error("Expected {expected} {kind} samples, got {got}")]
    SampleCount {
        kind: FetchKind,
        expected: usize,
        got: usize,
    },
    #[error("{kind} block of {len} bytes is not a whole number of samples")]
    Misaligned { kind: FetchKind, len: usize },
    #[error("Invalid status byte `{0}`")]
    InvalidStatus(String),
    #[error("Text after the binary blocks is not ASCII")]
    NonAsciiTail,
    #[error("Identification `{0}` does not have four fields")]
    Identity(String),
}

/// A decoded fetch reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub cycle: SampleCycle,
    pub status: StatusByte,
}

/// Location of an arbitrary block's payload inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub data_offset: usize,
    pub data_len: usize,
}

impl BlockHeader {
    pub fn data_end(&self) -> usize {
        self.data_offset + self.data_len
    }
}

/// Parse the header of the first arbitrary block found at or after `from`.
///
/// Definite length blocks are `#<H><H digits of length><payload>`. An
/// indefinite block, `#0<payload>`, extends to the end of the buffer less
/// one terminating byte.
pub fn parse_block_header(buf: &[u8], from: usize) -> Result<BlockHeader, Malformed> {
    let available = buf.len();
    let begin = buf
        .get(from..)
        .and_then(|rest| rest.iter().position(|&b| b == b'#'))
        .map(|pos| from + pos)
        .ok_or(Malformed::MissingBlockMarker(from))?;

    let header_len = match buf.get(begin + 1) {
        Some(d) if d.is_ascii_digit() => (d - b'0') as usize,
        Some(_) => return Err(Malformed::InvalidBlockHeader(begin)),
        None => {
            return Err(Malformed::Truncated {
                needed: begin + 2,
                available,
            })
        }
    };
    let data_offset = begin + 2 + header_len;

    let data_len = if header_len > 0 {
        let digits = buf
            .get(begin + 2..data_offset)
            .ok_or(Malformed::Truncated {
                needed: data_offset,
                available,
            })?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(Malformed::InvalidBlockHeader(begin));
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(Malformed::InvalidBlockHeader(begin))?
    } else {
        available
            .checked_sub(data_offset + 1)
            .ok_or(Malformed::Truncated {
                needed: data_offset + 1,
                available,
            })?
    };

    let header = BlockHeader {
        data_offset,
        data_len,
    };
    if header.data_end() > available {
        return Err(Malformed::Truncated {
            needed: header.data_end(),
            available,
        });
    }
    Ok(header)
}

/// Decode a block payload of big-endian `i32`
fn decode_i32_block(
    payload: &[u8],
    kind: FetchKind,
    expected: usize,
) -> Result<Vec<f64>, Malformed> {
    if payload.len() % 4 != 0 {
        return Err(Malformed::Misaligned {
            kind,
            len: payload.len(),
        });
    }
    if payload.len() != expected * 4 {
        return Err(Malformed::SampleCount {
            kind,
            expected,
            got: payload.len() / 4,
        });
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)
        .collect())
}

/// Parse an integer the way the instrument prints them: decimal, or with a
/// `0x`/`0o`/`0b` radix prefix
fn parse_int(token: &str) -> Option<u64> {
    let token = token.trim();
    let (digits, radix) = match token.get(..2) {
        Some("0x" | "0X") => (&token[2..], 16),
        Some("0o" | "0O") => (&token[2..], 8),
        Some("0b" | "0B") => (&token[2..], 2),
        _ => (token, 10),
    };
    u64::from_str_radix(digits, radix).ok()
}

fn parse_axis(field: &str, kind: FetchKind, expected: usize) -> Result<Vec<f64>, Malformed> {
    let values = field
        .split(',')
        .map(|token| {
            token
                .trim()
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse::<f64>()
                .map_err(|_| Malformed::Number {
                    kind,
                    token: token.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(Malformed::SampleCount {
            kind,
            expected,
            got: values.len(),
        });
    }
    Ok(values)
}

/// Per-sample instants of a block, given the instant of its last sample.
///
/// The instrument only timestamps the end of a block; earlier samples are
/// assumed to be spaced by exactly one trigger period.
pub fn block_timeline(end: f64, block_size: usize, period: f64) -> Vec<f64> {
    if block_size <= 1 {
        return vec![end; block_size];
    }
    let start = end - (block_size - 1) as f64 * period;
    let step = (end - start) / (block_size - 1) as f64;
    (0..block_size)
        .map(|i| {
            if i == block_size - 1 {
                end
            } else {
                start + i as f64 * step
            }
        })
        .collect()
}

fn parse_timestamp(token: &str, config: &Configuration) -> Result<Vec<f64>, Malformed> {
    let ns = parse_int(token).ok_or_else(|| Malformed::Number {
        kind: FetchKind::Timestamp,
        token: token.to_string(),
    })?;
    Ok(block_timeline(
        ns as f64 / 1e9,
        config.block_size as usize,
        config.trigger_period,
    ))
}

fn parse_temperature(token: &str, block_size: usize) -> Result<Vec<f64>, Malformed> {
    let code = token
        .trim()
        .parse::<i64>()
        .map_err(|_| Malformed::Number {
            kind: FetchKind::Temperature,
            token: token.to_string(),
        })?;
    Ok(vec![code as f64; block_size])
}

fn parse_status(token: &str) -> Result<StatusByte, Malformed> {
    let token = token.split('\n').next().unwrap_or_default().trim();
    if token.is_empty() {
        return Err(Malformed::MissingStatus);
    }
    token
        .parse::<u8>()
        .map(StatusByte::from_bits_retain)
        .map_err(|_| Malformed::InvalidStatus(token.to_string()))
}

/// Timestamp, temperature and status, common to both formats.
///
/// `fields` starts at the timestamp; the status byte is its last element.
fn decode_tail(
    fields: &[&str],
    config: &Configuration,
) -> Result<(Vec<f64>, Vec<f64>, StatusByte), Malformed> {
    let timestamp = fields
        .first()
        .ok_or(Malformed::MissingField(FetchKind::Timestamp))?;
    let temperature = fields
        .get(1)
        .ok_or(Malformed::MissingField(FetchKind::Temperature))?;
    let status = match fields {
        [_, _, .., last] => last,
        _ => return Err(Malformed::MissingStatus),
    };
    Ok((
        parse_timestamp(timestamp, config)?,
        parse_temperature(temperature, config.block_size as usize)?,
        parse_status(status)?,
    ))
}

/// Decode a reply to the fetch command sent in ASCII format
pub fn decode_ascii(reply: &str, config: &Configuration) -> Result<Reading, Malformed> {
    let n = config.block_size as usize;
    let fields: Vec<&str> = reply.trim_end().split(';').collect();

    let mut axes: [Vec<f64>; 3] = Default::default();
    for (slot, kind) in axes.iter_mut().zip(FetchKind::AXES) {
        let field = fields
            .get(kind as usize)
            .ok_or(Malformed::MissingField(kind))?;
        *slot = parse_axis(field, kind, n)?;
    }

    let (timestamp, temperature, status) = decode_tail(&fields[3..], config)?;
    let [bx, by, bz] = axes;
    Ok(Reading {
        cycle: SampleCycle::from_channels([bx, by, bz, timestamp, temperature]),
        status,
    })
}

/// Decode a reply to the fetch command sent in INTEGER format
pub fn decode_binary(reply: &[u8], config: &Configuration) -> Result<Reading, Malformed> {
    let n = config.block_size as usize;
    let mut cursor = 0;

    let mut axes: [Vec<f64>; 3] = Default::default();
    for (i, (slot, kind)) in axes.iter_mut().zip(FetchKind::AXES).enumerate() {
        let header = parse_block_header(reply, cursor)?;
        *slot = decode_i32_block(&reply[header.data_offset..header.data_end()], kind, n)?;
        cursor = header.data_end()
            + if i + 1 < FetchKind::AXES.len() {
                BLOCK_SEPARATOR
            } else {
                TAIL_SEPARATOR
            };
    }

    let tail = reply.get(cursor..).ok_or(Malformed::Truncated {
        needed: cursor,
        available: reply.len(),
    })?;
    if !tail.is_ascii() {
        return Err(Malformed::NonAsciiTail);
    }
    let tail = std::str::from_utf8(tail).map_err(|_| Malformed::NonAsciiTail)?;
    let fields: Vec<&str> = tail.split(';').collect();

    let (timestamp, temperature, status) = decode_tail(&fields, config)?;
    let [bx, by, bz] = axes;
    Ok(Reading {
        cycle: SampleCycle::from_channels([bx, by, bz, timestamp, temperature]),
        status,
    })
}

/// Reply to `*IDN?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub version: String,
}

impl FromStr for Identity {
    type Err = Malformed;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().splitn(4, ',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, version] => Ok(Identity {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                version: version.to_string(),
            }),
            _ => Err(Malformed::Identity(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} SN:{} ({})",
            self.manufacturer, self.model, self.serial, self.version
        )
    }
}
