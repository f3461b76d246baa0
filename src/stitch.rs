//! Reassembly of delimiter-terminated packets from bounded BLE notifications.
//!
//! JSON characteristics send each logical packet as UTF-8 text followed by
//! [`crate::protocol::CHUNK_DELIMITER`], split across as many notifications as
//! the MTU requires.  A fragment may end mid-packet, mid-delimiter, inside a
//! multi-byte character, or carry several packets at once, so fragments are
//! stitched as bytes and only complete packets are decoded.

use futures::stream::{self, Stream, StreamExt};

use crate::error::{SdkError, SdkResult};

/// Accumulates fragments and yields complete packets with the delimiter
/// stripped.
///
/// ```
/// # use neurosity_rs::stitch::ChunkStitcher;
/// let mut s = ChunkStitcher::new("EOF");
/// assert!(s.push(br#"{"state":"onl"#).is_empty());
/// assert_eq!(s.push(br#"ine"}EOF{"sta"#), vec![br#"{"state":"online"}"#.to_vec()]);
/// assert_eq!(s.remainder(), br#"{"sta"#);
/// ```
///
/// One stitcher belongs to exactly one subscription; remainders are never
/// shared between characteristics.
#[derive(Debug, Clone)]
pub struct ChunkStitcher {
    delimiter: Vec<u8>,
    remainder: Vec<u8>,
}

impl ChunkStitcher {
    pub fn new(delimiter: impl AsRef<[u8]>) -> Self {
        Self {
            delimiter: delimiter.as_ref().to_vec(),
            remainder: Vec::new(),
        }
    }

    /// Append a fragment and return every packet it completed, in arrival
    /// order.  Empty packets (back-to-back delimiters) are dropped.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<Vec<u8>> {
        self.remainder.extend_from_slice(fragment);
        let d = self.delimiter.len();
        if d == 0 {
            return Vec::new();
        }

        let mut packets = Vec::new();
        let mut start = 0;
        let mut at = 0;
        while at + d <= self.remainder.len() {
            if self.remainder[at..at + d] == self.delimiter[..] {
                if at > start {
                    packets.push(self.remainder[start..at].to_vec());
                }
                at += d;
                start = at;
            } else {
                at += 1;
            }
        }
        self.remainder.drain(..start);
        packets
    }

    /// Incomplete prefix carried over to the next fragment.
    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }

    pub fn reset(&mut self) {
        self.remainder.clear();
    }
}

/// Decode one complete packet.
pub fn packet_text(packet: Vec<u8>) -> SdkResult<String> {
    String::from_utf8(packet).map_err(|e| SdkError::Encoding(e.to_string()))
}

/// Lift a fragment stream into a stream of decoded packets.
///
/// Each call owns a fresh [`ChunkStitcher`], so re-subscribing starts from an
/// empty remainder.  A packet that is not valid UTF-8 is yielded as an error.
pub fn stitch<S>(fragments: S, delimiter: &str) -> impl Stream<Item = SdkResult<String>> + Send
where
    S: Stream<Item = Vec<u8>> + Send,
{
    let stitcher = ChunkStitcher::new(delimiter);
    fragments
        .scan(stitcher, |stitcher, fragment| {
            let packets = stitcher.push(&fragment);
            futures::future::ready(Some(stream::iter(packets.into_iter().map(packet_text))))
        })
        .flatten()
}
