//! Decoders for raw EEG payloads.
//!
//! All public functions in this module are pure and safe to call from any
//! async or sync context.
//!
//! # Binary frame layout
//!
//! The `raw` and `rawUnfiltered` characteristics carry a sequence of
//! fixed-width frames, all big-endian, with no header or checksum:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 8 | timestamp, `u64` ms since Unix epoch |
//! | 8 | 2 | marker, `u16` (`0` = none) |
//! | 10 | 8 × C | one `f64` per channel |
//!
//! Alignment is the caller's job: a buffer must start on a frame boundary,
//! which holds for every whole notification.
//!
//! # CSV variant
//!
//! Some tooling emits the same fields as text, one frame per line:
//! `timestamp,marker,ch1,...,chC`.  See [`parse_csv_samples`].

use crate::error::{SdkError, SdkResult};
use crate::types::Sample;

const TIMESTAMP_BYTES: usize = 8;
const MARKER_BYTES: usize = 2;
const CHANNEL_BYTES: usize = 8;

/// Bytes occupied by one frame with `channel_count` channels.
pub fn sample_size(channel_count: usize) -> usize {
    TIMESTAMP_BYTES + MARKER_BYTES + CHANNEL_BYTES * channel_count
}

/// Decode every frame in `buffer`.
///
/// Fails with [`SdkError::Framing`] when the buffer length is not a multiple
/// of [`sample_size`]; nothing is decoded in that case.
pub fn decode_samples(buffer: &[u8], channel_count: usize) -> SdkResult<Vec<Sample>> {
    let size = sample_size(channel_count);
    if buffer.len() % size != 0 {
        return Err(SdkError::Framing {
            len: buffer.len(),
            sample_size: size,
        });
    }

    let samples = buffer
        .chunks_exact(size)
        .map(|frame| {
            let (ts, rest) = frame.split_at(TIMESTAMP_BYTES);
            let (marker, channels) = rest.split_at(MARKER_BYTES);

            let timestamp = u64::from_be_bytes(ts.try_into().unwrap_or([0; 8]));
            let marker = u16::from_be_bytes([marker[0], marker[1]]);
            let data = channels
                .chunks_exact(CHANNEL_BYTES)
                .map(|c| f64::from_be_bytes(c.try_into().unwrap_or([0; 8])))
                .collect();

            Sample {
                timestamp,
                data,
                marker: (marker != 0).then_some(marker),
                info: None,
            }
        })
        .collect();

    Ok(samples)
}

/// Encode samples into the binary frame layout.
///
/// Channels beyond `channel_count` are dropped and missing ones are written
/// as `0.0`, so the output always has the exact frame size.
pub fn encode_samples(samples: &[Sample], channel_count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * sample_size(channel_count));
    for s in samples {
        out.extend_from_slice(&s.timestamp.to_be_bytes());
        out.extend_from_slice(&s.marker.unwrap_or(0).to_be_bytes());
        for ch in 0..channel_count {
            let v = s.data.get(ch).copied().unwrap_or(0.0);
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
    out
}

/// Parse the CSV text variant.  Blank lines are skipped; a row with a
/// malformed number or the wrong column count is an error.
pub fn parse_csv_samples(text: &str, channel_count: usize) -> SdkResult<Vec<Sample>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            if cols.len() != 2 + channel_count {
                return Err(SdkError::InvalidArgument(format!(
                    "CSV row has {} columns, expected {}: {line}",
                    cols.len(),
                    2 + channel_count
                )));
            }
            let bad = |col: &str| SdkError::InvalidArgument(format!("bad CSV value {col:?} in: {line}"));
            let timestamp: u64 = cols[0].parse().map_err(|_| bad(cols[0]))?;
            let marker: u16 = cols[1].parse().map_err(|_| bad(cols[1]))?;
            let data = cols[2..]
                .iter()
                .map(|c| c.parse::<f64>().map_err(|_| bad(*c)))
                .collect::<SdkResult<Vec<f64>>>()?;
            Ok(Sample {
                timestamp,
                data,
                marker: (marker != 0).then_some(marker),
                info: None,
            })
        })
        .collect()
}
