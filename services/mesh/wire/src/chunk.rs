//! Fragmentation of payloads that exceed one GATT write.
//!
//! Each fragment is `total_length (u16 LE) | offset (u16 LE) | 10-byte block`
//! and travels behind its own DATA_CHUNK envelope.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::debug;

use crate::WireError;

/// Largest payload sent as a single write
pub const MAX_DIRECT_PAYLOAD: usize = 20;

/// Data bytes carried per fragment
pub const CHUNK_DATA_SIZE: usize = 10;

/// Encoded fragment size
pub const FRAGMENT_SIZE: usize = 4 + CHUNK_DATA_SIZE;

/// One piece of a chunked payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Length of the whole payload
    pub total_length: u16,
    /// Position of this block in the payload
    pub offset: u16,
    /// Block data, zero padded to [`CHUNK_DATA_SIZE`]
    pub data: [u8; CHUNK_DATA_SIZE],
}

impl Fragment {
    /// Meaningful bytes in this block
    pub fn chunk_size(&self) -> usize {
        (self.total_length as usize)
            .saturating_sub(self.offset as usize)
            .min(CHUNK_DATA_SIZE)
    }

    /// Whether this block ends the payload
    pub fn is_last(&self) -> bool {
        self.offset as usize + self.chunk_size() == self.total_length as usize
    }

    /// Encode to the 14-byte wire form
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.total_length);
        buf.put_u16_le(self.offset);
        buf.put_slice(&self.data);
    }

    /// Decode from the 14-byte wire form
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < FRAGMENT_SIZE {
            return Err(WireError::incomplete(FRAGMENT_SIZE, buf.remaining()));
        }
        let total_length = buf.get_u16_le();
        let offset = buf.get_u16_le();
        let mut data = [0u8; CHUNK_DATA_SIZE];
        buf.copy_to_slice(&mut data);
        Ok(Self {
            total_length,
            offset,
            data,
        })
    }
}

/// Splits payloads into fragments
#[derive(Debug, Default, Clone, Copy)]
pub struct Chunker;

impl Chunker {
    /// Whether `len` bytes need fragmenting
    pub fn needs_chunking(len: usize) -> bool {
        len > MAX_DIRECT_PAYLOAD
    }

    /// Split `data` into 10-byte fragments
    pub fn split(data: &[u8]) -> Result<Vec<Fragment>, WireError> {
        if data.len() > u16::MAX as usize {
            return Err(WireError::Size(data.len()));
        }

        let total_length = data.len() as u16;
        let fragments = data
            .chunks(CHUNK_DATA_SIZE)
            .enumerate()
            .map(|(i, block)| {
                let mut padded = [0u8; CHUNK_DATA_SIZE];
                padded[..block.len()].copy_from_slice(block);
                Fragment {
                    total_length,
                    offset: (i * CHUNK_DATA_SIZE) as u16,
                    data: padded,
                }
            })
            .collect();

        Ok(fragments)
    }
}

/// Collects fragments back into a payload
#[derive(Debug, Default)]
pub struct Reassembler {
    total_length: Option<u16>,
    blocks: BTreeMap<u16, Fragment>,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment, returning the payload once it is complete
    pub fn push(&mut self, fragment: Fragment) -> Option<Bytes> {
        if self.total_length != Some(fragment.total_length) {
            if self.total_length.is_some() {
                debug!(
                    "Fragment total length changed to {}, dropping {} buffered blocks",
                    fragment.total_length,
                    self.blocks.len()
                );
            }
            self.blocks.clear();
            self.total_length = Some(fragment.total_length);
        }

        let total = fragment.total_length as usize;
        self.blocks.insert(fragment.offset, fragment);

        let has_last = self.blocks.values().any(Fragment::is_last);
        if !has_last || !self.is_contiguous(total) {
            return None;
        }

        let mut payload = BytesMut::with_capacity(total);
        for block in self.blocks.values() {
            payload.put_slice(&block.data[..block.chunk_size()]);
        }
        payload.truncate(total);

        self.reset();
        Some(payload.freeze())
    }

    /// Drop any buffered fragments
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.total_length = None;
    }

    fn is_contiguous(&self, total: usize) -> bool {
        let mut expected = 0usize;
        for (&offset, block) in &self.blocks {
            if offset as usize != expected {
                return false;
            }
            expected += block.chunk_size();
        }
        expected == total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sizes() {
        let data: Vec<u8> = (0..37).collect();
        let fragments = Chunker::split(&data).unwrap();

        let sizes: Vec<usize> = fragments.iter().map(Fragment::chunk_size).collect();
        assert_eq!(sizes, vec![10, 10, 10, 7]);
        assert_eq!(fragments[3].offset, 30);
        assert_eq!(&fragments[3].data[7..], &[0, 0, 0]);
        assert!(fragments[3].is_last());
        assert!(!fragments[0].is_last());
    }

    #[test]
    fn test_needs_chunking() {
        assert!(!Chunker::needs_chunking(20));
        assert!(Chunker::needs_chunking(21));
    }

    #[test]
    fn test_split_oversized() {
        let data = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(Chunker::split(&data), Err(WireError::Size(_))));
    }

    #[test]
    fn test_fragment_encoding() {
        let fragments = Chunker::split(&[9u8; 21]).unwrap();
        let mut buf = BytesMut::new();
        fragments[2].encode(&mut buf);
        assert_eq!(&buf[..4], &[21, 0, 20, 0]);
        assert_eq!(buf[4], 9);
        assert_eq!(buf.len(), FRAGMENT_SIZE);

        let decoded = Fragment::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, fragments[2]);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let data: Vec<u8> = (0..45).collect();
        let mut fragments = Chunker::split(&data).unwrap();
        fragments.reverse();

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for f in fragments {
            result = reassembler.push(f);
        }
        assert_eq!(result.unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_reassemble_waits_for_gaps() {
        let data: Vec<u8> = (0..30).collect();
        let fragments = Chunker::split(&data).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(fragments[0].clone()).is_none());
        assert!(reassembler.push(fragments[2].clone()).is_none());
        assert_eq!(
            reassembler.push(fragments[1].clone()).unwrap().as_ref(),
            data.as_slice()
        );
    }

    #[test]
    fn test_reassemble_resets_on_new_length() {
        let first = Chunker::split(&[1u8; 25]).unwrap();
        let second = Chunker::split(&[2u8; 22]).unwrap();

        let mut reassembler = Reassembler::new();
        reassembler.push(first[0].clone());
        reassembler.push(first[1].clone());
        assert!(reassembler.push(second[2].clone()).is_none());
        assert!(reassembler.push(second[0].clone()).is_none());
        assert_eq!(
            reassembler.push(second[1].clone()).unwrap().as_ref(),
            &[2u8; 22][..]
        );
    }
}
