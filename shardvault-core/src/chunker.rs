//! Chunk reader
//!
//! Turns a byte stream into a lazy, ordered sequence of chunks. Each chunk
//! carries one fragment per blobber position: `data` payload fragments
//! (sealed when encryption is on) followed by `parity` computed fragments.

use crate::crypto::{ShardCipher, ENCRYPTION_OVERHEAD};
use crate::erasure::FragmentCodec;
use crate::error::{Result, ShardVaultError};
use crate::hash::{fragment_hash, FileHashes, UploadHasher};
use std::io::Read;

/// One horizontal stripe of the file across all shard positions.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk index, starting at 0.
    pub index: usize,
    /// Exactly one chunk of a sequence has this set.
    pub is_final: bool,
    /// Bytes read from the source for this chunk (pre-encode, pre-encrypt).
    pub read_size: u64,
    /// On-wire byte length of each fragment, identical across the chunk.
    pub fragment_size: u64,
    /// One fragment per blobber position, length `data + parity`.
    pub fragments: Vec<Vec<u8>>,
    /// Challenge hash over the fragments in index order.
    pub challenge_hash: String,
    /// Per-fragment hashes, aligned with `fragments`.
    pub fragment_hashes: Vec<String>,
}

/// Effective per-shard payload for a given chunk size.
pub fn effective_payload(chunk_size: usize, encrypted: bool) -> Result<usize> {
    if encrypted {
        if chunk_size <= ENCRYPTION_OVERHEAD {
            return Err(ShardVaultError::InvalidParameter(format!(
                "chunk_size {} does not cover encryption overhead {}",
                chunk_size, ENCRYPTION_OVERHEAD
            )));
        }
        Ok(chunk_size - ENCRYPTION_OVERHEAD)
    } else {
        Ok(chunk_size)
    }
}

/// One-shot encode of a small payload (thumbnails, registry files) into a
/// single fragment set.
pub fn encode_payload(
    codec: &FragmentCodec,
    cipher: Option<&ShardCipher>,
    payload: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let fragment_size = payload.len().div_ceil(codec.data_shards()).max(1);
    let mut data_fragments = codec.split(payload, fragment_size);
    if let Some(cipher) = cipher {
        for fragment in data_fragments.iter_mut() {
            *fragment = cipher.seal(fragment)?;
        }
    }
    codec.encode(data_fragments)
}

/// Lazy chunk sequence over a byte source.
pub struct ChunkReader<R: Read> {
    source: R,
    codec: FragmentCodec,
    cipher: Option<ShardCipher>,
    hasher: UploadHasher,
    /// Per-shard plaintext payload budget.
    payload_size: usize,
    next_index: usize,
    produced_final: bool,
    total_read: u64,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(
        source: R,
        data_shards: usize,
        parity_shards: usize,
        chunk_size: usize,
        cipher: Option<ShardCipher>,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ShardVaultError::InvalidParameter(
                "chunk_size must be > 0".to_string(),
            ));
        }
        let payload_size = effective_payload(chunk_size, cipher.is_some())?;
        let codec = FragmentCodec::new(data_shards, parity_shards)?;
        let hasher = UploadHasher::new(data_shards + parity_shards);
        Ok(Self {
            source,
            codec,
            cipher,
            hasher,
            payload_size,
            next_index: 0,
            produced_final: false,
            total_read: 0,
        })
    }

    /// Total bytes read from the source so far.
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Read, encode, and (optionally) encrypt the next chunk. Returns `None`
    /// once the final chunk has been produced.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.produced_final {
            return Ok(None);
        }

        let budget = self.payload_size * self.codec.data_shards();
        let mut payload = vec![0u8; budget];
        let mut read_len = 0usize;
        while read_len < budget {
            let n = self.source.read(&mut payload[read_len..])?;
            if n == 0 {
                break;
            }
            read_len += n;
        }

        let index = self.next_index;
        self.next_index += 1;
        self.total_read += read_len as u64;

        if read_len == 0 {
            // Zero-byte final chunk: either an empty file, or an explicit
            // final marker after an exact-multiple read.
            self.produced_final = true;
            let fragments = vec![Vec::new(); self.codec.total_shards()];
            let challenge = self.hasher.write_fragments(&fragments);
            let fragment_hashes = fragments.iter().map(|f| fragment_hash(f)).collect();
            return Ok(Some(Chunk {
                index,
                is_final: true,
                read_size: 0,
                fragment_size: 0,
                fragments,
                challenge_hash: challenge,
                fragment_hashes,
            }));
        }

        let is_final = read_len < budget;
        self.produced_final = is_final;
        self.hasher.write_data(&payload[..read_len]);

        let shard_payload = read_len.div_ceil(self.codec.data_shards());
        let mut data_fragments = self.codec.split(&payload[..read_len], shard_payload);
        if let Some(ref cipher) = self.cipher {
            for fragment in data_fragments.iter_mut() {
                *fragment = cipher.seal(fragment)?;
            }
        }
        let fragments = self.codec.encode(data_fragments)?;
        let fragment_size = fragments[0].len() as u64;
        let challenge = self.hasher.write_fragments(&fragments);
        let fragment_hashes = fragments.iter().map(|f| fragment_hash(f)).collect();

        Ok(Some(Chunk {
            index,
            is_final,
            read_size: read_len as u64,
            fragment_size,
            fragments,
            challenge_hash: challenge,
            fragment_hashes,
        }))
    }

    /// Finalize and return the file-level hashes. Call after the final chunk.
    pub fn finalize(self) -> FileHashes {
        self.hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ShardKey;
    use std::io::Cursor;

    fn collect_chunks<R: Read>(reader: &mut ChunkReader<R>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_empty_file_single_final_chunk() {
        let mut reader = ChunkReader::new(Cursor::new(vec![]), 2, 1, 64, None).unwrap();
        let chunks = collect_chunks(&mut reader);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].read_size, 0);
        assert_eq!(chunks[0].fragment_size, 0);
    }

    #[test]
    fn test_short_final_chunk() {
        // one full chunk (2 * 64 bytes) plus a single trailing byte
        let data = vec![9u8; 129];
        let mut reader = ChunkReader::new(Cursor::new(data), 2, 1, 64, None).unwrap();
        let chunks = collect_chunks(&mut reader);
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final);
        assert_eq!(chunks[0].read_size, 128);
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].read_size, 1);
        assert_eq!(chunks[1].fragment_size, 1);
    }

    #[test]
    fn test_exact_multiple_adds_empty_final_marker() {
        let data = vec![1u8; 128];
        let mut reader = ChunkReader::new(Cursor::new(data), 2, 1, 64, None).unwrap();
        let chunks = collect_chunks(&mut reader);
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final);
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].read_size, 0);
    }

    #[test]
    fn test_indices_are_monotonic() {
        let data = vec![3u8; 1000];
        let mut reader = ChunkReader::new(Cursor::new(data), 2, 1, 64, None).unwrap();
        let chunks = collect_chunks(&mut reader);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
    }

    #[test]
    fn test_fragment_size_under_encryption() {
        let cipher = ShardCipher::new(ShardKey::generate()).unwrap();
        let chunk_size = 4096;
        let payload = effective_payload(chunk_size, true).unwrap();
        let data = vec![5u8; payload * 2]; // exactly one full chunk for D=2
        let mut reader = ChunkReader::new(Cursor::new(data), 2, 1, chunk_size, Some(cipher)).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();

        // fragment bytes exceed read bytes by exactly the encryption overhead
        assert_eq!(chunk.read_size as usize, payload * 2);
        assert_eq!(chunk.fragment_size as usize, payload + ENCRYPTION_OVERHEAD);
        assert_eq!(chunk.fragment_size as usize, chunk_size);
    }

    #[test]
    fn test_chunk_size_must_cover_overhead() {
        let cipher = ShardCipher::new(ShardKey::generate()).unwrap();
        let result = ChunkReader::new(Cursor::new(vec![0u8; 10]), 2, 1, 64, Some(cipher));
        assert!(result.is_err());
    }

    #[test]
    fn test_parity_recovers_ciphertext() {
        let key = ShardKey::generate();
        let cipher = ShardCipher::new(key.clone()).unwrap();
        let chunk_size = 4096;
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut reader =
            ChunkReader::new(Cursor::new(data.clone()), 2, 1, chunk_size, Some(cipher)).unwrap();

        let codec = FragmentCodec::new(2, 1).unwrap();
        let opener = ShardCipher::new(key).unwrap();
        let mut recovered = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            if chunk.read_size == 0 {
                continue;
            }
            // drop data shard 0, rebuild it from parity, then decrypt
            let mut opts: Vec<Option<Vec<u8>>> = chunk.fragments.into_iter().map(Some).collect();
            opts[0] = None;
            codec.reconstruct(&mut opts).unwrap();
            let mut chunk_payload = Vec::new();
            for fragment in opts.iter().take(2) {
                let plain = opener.open(fragment.as_ref().unwrap()).unwrap();
                chunk_payload.extend_from_slice(&plain);
            }
            chunk_payload.truncate(chunk.read_size as usize);
            recovered.extend_from_slice(&chunk_payload);
        }
        assert_eq!(recovered, data);
    }

    #[test]
    fn test_finalize_matches_whole_file_hash() {
        let data = vec![7u8; 500];
        let mut reader = ChunkReader::new(Cursor::new(data.clone()), 2, 1, 64, None).unwrap();
        collect_chunks(&mut reader);
        let hashes = reader.finalize();
        assert_eq!(
            hashes.content_hash,
            crate::hash::ContentHash::compute(&data).to_hex()
        );
    }
}
