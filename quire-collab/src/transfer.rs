//! Chunked attachment transfer over the multiplexed socket.
//!
//! Each chunk travels as a binary frame keyed `@blob/<sha256-hex>`:
//! ```text
//! ┌──────────────┬──────────────┬─────────────┬──────────────┐
//! │ varUint(idx) │ varUint(tot) │ varUint(sz) │ chunk bytes  │
//! └──────────────┴──────────────┴─────────────┴──────────────┘
//! ```
//! `sz` is the size of the whole blob, repeated on every chunk so the
//! receiver can detect a sender that changed its mind mid-transfer.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use quire_core::types::hash_bytes;

use crate::protocol::{read_var_uint, write_var_uint, ProtocolError, BLOB_PREFIX};

/// Default chunk payload size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a blob the assembler will buffer.
pub const MAX_BLOB_SIZE: u64 = 256 * 1024 * 1024;

/// Transfers buffered at once per assembler.
pub const MAX_PENDING_TRANSFERS: usize = 16;

/// A partial transfer with no new chunk for this long is dropped.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    pub total: u32,
    pub size: u64,
}

impl ChunkHeader {
    pub fn encode(&self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(chunk.len() + 16);
        write_var_uint(&mut buf, u64::from(self.index));
        write_var_uint(&mut buf, u64::from(self.total));
        write_var_uint(&mut buf, self.size);
        buf.extend_from_slice(chunk);
        buf
    }

    /// Split a chunk payload into its header and bytes.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let (index, a) = read_var_uint(payload)?;
        let (total, b) = read_var_uint(&payload[a..])?;
        let (size, c) = read_var_uint(&payload[a + b..])?;
        let narrow = |v: u64, what: &str| {
            u32::try_from(v)
                .map_err(|_| ProtocolError::InconsistentChunk(format!("{what} {v} out of range")))
        };
        let header = Self {
            index: narrow(index, "index")?,
            total: narrow(total, "total")?,
            size,
        };
        Ok((header, &payload[a + b + c..]))
    }
}

/// Frame key for a blob.
pub fn blob_key(hash: &str) -> String {
    format!("{BLOB_PREFIX}{hash}")
}

/// Hash carried by a blob frame key, if it is one.
pub fn blob_hash(key: &str) -> Option<&str> {
    key.strip_prefix(BLOB_PREFIX).filter(|h| !h.is_empty())
}

/// Split `bytes` into `(frame key, chunk payload)` pairs ready for `send`.
/// An empty blob still produces one chunk.
pub fn chunk_blob(bytes: &[u8], chunk_size: usize) -> (String, Vec<Vec<u8>>) {
    let hash = hash_bytes(bytes);
    let chunk_size = chunk_size.max(1);
    let pieces: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(chunk_size).collect()
    };
    let total = pieces.len() as u32;
    let payloads = pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            ChunkHeader {
                index: i as u32,
                total,
                size: bytes.len() as u64,
            }
            .encode(piece)
        })
        .collect();
    (blob_key(&hash), payloads)
}

struct PartialBlob {
    total: u32,
    size: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
    last_seen: Instant,
}

/// Reassembles chunked blobs and verifies their SHA-256.
///
/// Any error drops the partial transfer; there is no per-chunk retry.
/// Memory held per transfer grows with the bytes received, never with the
/// chunk count a peer declares.
pub struct TransferAssembler {
    pending: HashMap<String, PartialBlob>,
    max_pending: usize,
    idle_timeout: Duration,
}

impl Default for TransferAssembler {
    fn default() -> Self {
        Self::with_limits(MAX_PENDING_TRANSFERS, TRANSFER_IDLE_TIMEOUT)
    }
}

impl TransferAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_pending: usize, idle_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
            idle_timeout,
        }
    }

    /// Feed one chunk. Returns the verified bytes once the last chunk lands.
    pub fn accept(&mut self, hash: &str, payload: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.expire_idle(Instant::now());
        let result = self.accept_inner(hash, payload);
        if result.is_err() {
            self.pending.remove(hash);
        }
        result
    }

    /// Drop transfers idle for longer than the timeout as of `now`.
    /// Returns how many were dropped.
    pub fn expire_idle(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        let timeout = self.idle_timeout;
        self.pending.retain(|hash, partial| {
            let alive = now.saturating_duration_since(partial.last_seen) <= timeout;
            if !alive {
                log::warn!("Dropping stalled blob transfer {hash}");
            }
            alive
        });
        before - self.pending.len()
    }

    fn accept_inner(
        &mut self,
        hash: &str,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let (header, chunk) = ChunkHeader::decode(payload)?;
        if header.total == 0 || header.index >= header.total {
            return Err(ProtocolError::InconsistentChunk(format!(
                "chunk {} of {}",
                header.index, header.total
            )));
        }
        if header.size > MAX_BLOB_SIZE {
            return Err(ProtocolError::InconsistentChunk(format!(
                "blob of {} bytes exceeds limit",
                header.size
            )));
        }
        // Every chunk but the lone chunk of an empty blob carries a byte.
        if u64::from(header.total) > header.size.max(1) {
            return Err(ProtocolError::InconsistentChunk(format!(
                "{} chunks for a {} byte blob",
                header.total, header.size
            )));
        }
        if !self.pending.contains_key(hash) && self.pending.len() >= self.max_pending {
            return Err(ProtocolError::InconsistentChunk(format!(
                "more than {} concurrent transfers",
                self.max_pending
            )));
        }

        let partial = self
            .pending
            .entry(hash.to_string())
            .or_insert_with(|| PartialBlob {
                total: header.total,
                size: header.size,
                chunks: BTreeMap::new(),
                received_bytes: 0,
                last_seen: Instant::now(),
            });

        if partial.total != header.total || partial.size != header.size {
            return Err(ProtocolError::InconsistentChunk(format!(
                "expected {} chunks / {} bytes, got {} / {}",
                partial.total, partial.size, header.total, header.size
            )));
        }
        if partial.chunks.contains_key(&header.index) {
            return Err(ProtocolError::InconsistentChunk(format!(
                "duplicate chunk {}",
                header.index
            )));
        }
        partial.received_bytes += chunk.len() as u64;
        if partial.received_bytes > partial.size {
            return Err(ProtocolError::InconsistentChunk(format!(
                "received {} bytes for a {} byte blob",
                partial.received_bytes, partial.size
            )));
        }
        partial.chunks.insert(header.index, chunk.to_vec());
        partial.last_seen = Instant::now();

        if partial.chunks.len() < partial.total as usize {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(hash) else {
            return Ok(None);
        };
        if done.received_bytes != done.size {
            return Err(ProtocolError::InconsistentChunk(format!(
                "reassembled {} bytes, header declared {}",
                done.received_bytes, done.size
            )));
        }
        let bytes: Vec<u8> = done.chunks.into_values().flatten().collect();
        let actual = hash_bytes(&bytes);
        if actual != hash {
            return Err(ProtocolError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(Some(bytes))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cancel(&mut self, hash: &str) -> bool {
        self.pending.remove(hash).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembles_out_of_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (key, chunks) = chunk_blob(&data, 3000);
        assert_eq!(chunks.len(), 4);
        let hash = blob_hash(&key).unwrap();

        let mut assembler = TransferAssembler::new();
        for i in [2, 0, 3] {
            assert_eq!(assembler.accept(hash, &chunks[i]).unwrap(), None);
        }
        assert_eq!(assembler.pending_count(), 1);
        assert_eq!(assembler.accept(hash, &chunks[1]).unwrap(), Some(data));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_empty_blob_is_one_chunk() {
        let (key, chunks) = chunk_blob(&[], DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 1);
        let mut assembler = TransferAssembler::new();
        assert_eq!(
            assembler.accept(blob_hash(&key).unwrap(), &chunks[0]).unwrap(),
            Some(vec![])
        );
    }

    #[test]
    fn test_hash_mismatch_fails_whole_transfer() {
        let (_, chunks) = chunk_blob(b"hello world", 4);
        let wrong = hash_bytes(b"something else");
        let mut assembler = TransferAssembler::new();
        let mut last = Ok(None);
        for chunk in &chunks {
            last = assembler.accept(&wrong, chunk);
        }
        assert!(matches!(last, Err(ProtocolError::HashMismatch { .. })));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_inconsistent_total_is_rejected() {
        let (key, chunks) = chunk_blob(b"abcdefgh", 4);
        let hash = blob_hash(&key).unwrap();
        let mut assembler = TransferAssembler::new();
        assembler.accept(hash, &chunks[0]).unwrap();

        let bogus = ChunkHeader {
            index: 1,
            total: 5,
            size: 8,
        }
        .encode(b"efgh");
        assert!(matches!(
            assembler.accept(hash, &bogus),
            Err(ProtocolError::InconsistentChunk(_))
        ));
        // Partial state is dropped with the failure.
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_and_out_of_range_chunks() {
        let (key, chunks) = chunk_blob(b"abcdefgh", 4);
        let hash = blob_hash(&key).unwrap();
        let mut assembler = TransferAssembler::new();
        assembler.accept(hash, &chunks[0]).unwrap();
        assert!(assembler.accept(hash, &chunks[0]).is_err());

        let out_of_range = ChunkHeader {
            index: 2,
            total: 2,
            size: 8,
        }
        .encode(b"x");
        assert!(assembler.accept(hash, &out_of_range).is_err());
        assert!(assembler.accept(hash, &[0x80]).is_err());
    }

    #[test]
    fn test_declared_total_beyond_size_is_rejected_without_buffering() {
        let mut assembler = TransferAssembler::new();
        let hash = hash_bytes(b"ab");
        let huge_total = ChunkHeader {
            index: 0,
            total: u32::MAX,
            size: 0,
        }
        .encode(&[]);
        assert!(matches!(
            assembler.accept(&hash, &huge_total),
            Err(ProtocolError::InconsistentChunk(_))
        ));
        assert_eq!(assembler.pending_count(), 0);

        let more_chunks_than_bytes = ChunkHeader {
            index: 0,
            total: 3,
            size: 2,
        }
        .encode(b"a");
        assert!(matches!(
            assembler.accept(&hash, &more_chunks_than_bytes),
            Err(ProtocolError::InconsistentChunk(_))
        ));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_oversized_blob_is_rejected() {
        let mut assembler = TransferAssembler::new();
        let header = ChunkHeader {
            index: 0,
            total: 2,
            size: MAX_BLOB_SIZE + 1,
        }
        .encode(b"x");
        assert!(matches!(
            assembler.accept("deadbeef", &header),
            Err(ProtocolError::InconsistentChunk(_))
        ));
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_pending_transfers_are_capped() {
        let mut assembler = TransferAssembler::with_limits(2, TRANSFER_IDLE_TIMEOUT);
        let first_half = ChunkHeader {
            index: 0,
            total: 2,
            size: 2,
        }
        .encode(b"a");
        assembler.accept("one", &first_half).unwrap();
        assembler.accept("two", &first_half).unwrap();
        assert!(matches!(
            assembler.accept("three", &first_half),
            Err(ProtocolError::InconsistentChunk(_))
        ));
        assert_eq!(assembler.pending_count(), 2);
        assert!(assembler.cancel("one"));
        assembler.accept("three", &first_half).unwrap();
        assert_eq!(assembler.pending_count(), 2);
    }

    #[test]
    fn test_idle_transfers_expire() {
        let mut assembler = TransferAssembler::with_limits(4, Duration::from_secs(60));
        let (key, chunks) = chunk_blob(b"abcdefgh", 4);
        let hash = blob_hash(&key).unwrap();
        assembler.accept(hash, &chunks[0]).unwrap();

        assert_eq!(assembler.expire_idle(Instant::now()), 0);
        assert_eq!(assembler.pending_count(), 1);
        assert_eq!(
            assembler.expire_idle(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn test_blob_key_helpers() {
        assert_eq!(blob_key("abc"), "@blob/abc");
        assert_eq!(blob_hash("@blob/abc"), Some("abc"));
        assert_eq!(blob_hash("@blob/"), None);
        assert_eq!(blob_hash("notes/a.md"), None);
    }
}
