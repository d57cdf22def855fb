//! Reed-Solomon fragment codec
//!
//! Each chunk of a file is striped into `data + parity` equal-sized
//! fragments; the first `data` carry payload bytes, the rest carry computed
//! parity. Any `data` intact fragments (with known indices) reconstruct the
//! chunk.

use crate::error::{Result, ShardVaultError};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Reed-Solomon encoder/decoder over `(data, parity)` fragment stripes.
pub struct FragmentCodec {
    data_shards: usize,
    parity_shards: usize,
    // None when parity_shards == 0; the codec then degrades to a splitter.
    encoder: Option<ReedSolomon>,
}

impl FragmentCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(ShardVaultError::InvalidParameter(
                "data_shards must be > 0".to_string(),
            ));
        }
        let encoder = if parity_shards > 0 {
            Some(ReedSolomon::new(data_shards, parity_shards)?)
        } else {
            None
        };
        Ok(Self {
            data_shards,
            parity_shards,
            encoder,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Split payload bytes into `data` fragments of `fragment_size` each,
    /// zero-padding the tail fragment.
    pub fn split(&self, payload: &[u8], fragment_size: usize) -> Vec<Vec<u8>> {
        let mut fragments = Vec::with_capacity(self.data_shards);
        for i in 0..self.data_shards {
            let start = (i * fragment_size).min(payload.len());
            let end = ((i + 1) * fragment_size).min(payload.len());
            let mut fragment = payload[start..end].to_vec();
            fragment.resize(fragment_size, 0);
            fragments.push(fragment);
        }
        fragments
    }

    /// Append and fill parity fragments over the given data fragments.
    ///
    /// The data fragments must already be equal-sized; with encryption they
    /// are the sealed shards, so parity recovery yields ciphertext.
    pub fn encode(&self, mut data_fragments: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if data_fragments.len() != self.data_shards {
            return Err(ShardVaultError::FragmentSizeMismatch {
                expected: self.data_shards,
                actual: data_fragments.len(),
            });
        }
        let fragment_size = data_fragments.first().map(|f| f.len()).unwrap_or(0);
        for _ in 0..self.parity_shards {
            data_fragments.push(vec![0u8; fragment_size]);
        }
        if let Some(ref encoder) = self.encoder {
            if fragment_size > 0 {
                encoder.encode(&mut data_fragments)?;
            }
        }
        Ok(data_fragments)
    }

    /// Reconstruct missing fragments in place.
    ///
    /// `fragments` must have length `data + parity`; missing entries are
    /// `None` and are filled on success.
    pub fn reconstruct(&self, fragments: &mut [Option<Vec<u8>>]) -> Result<()> {
        if fragments.len() != self.total_shards() {
            return Err(ShardVaultError::FragmentSizeMismatch {
                expected: self.total_shards(),
                actual: fragments.len(),
            });
        }
        let available = fragments.iter().filter(|f| f.is_some()).count();
        if available < self.data_shards {
            return Err(ShardVaultError::InsufficientFragments {
                available,
                required: self.data_shards,
            });
        }
        if fragments.iter().take(self.data_shards).all(|f| f.is_some()) {
            return Ok(());
        }
        match self.encoder {
            Some(ref encoder) => {
                encoder.reconstruct(fragments)?;
                Ok(())
            }
            // without parity a missing data fragment is unrecoverable
            None => Err(ShardVaultError::InsufficientFragments {
                available,
                required: self.data_shards,
            }),
        }
    }

    /// Concatenate the data fragments and trim to `payload_size`.
    pub fn join(&self, fragments: &[Option<Vec<u8>>], payload_size: usize) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(payload_size);
        for fragment in fragments.iter().take(self.data_shards) {
            let fragment = fragment.as_ref().ok_or(ShardVaultError::InsufficientFragments {
                available: fragments.iter().filter(|f| f.is_some()).count(),
                required: self.data_shards,
            })?;
            payload.extend_from_slice(fragment);
        }
        payload.truncate(payload_size);
        Ok(payload)
    }

    /// Verify parity consistency of a full fragment set.
    pub fn verify(&self, fragments: &[Vec<u8>]) -> Result<bool> {
        match self.encoder {
            Some(ref encoder) => {
                let refs: Vec<&[u8]> = fragments.iter().map(|f| f.as_slice()).collect();
                Ok(encoder.verify(&refs)?)
            }
            None => Ok(fragments.len() == self.data_shards),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload(codec: &FragmentCodec, payload: &[u8]) -> Vec<Vec<u8>> {
        let fragment_size = payload.len().div_ceil(codec.data_shards());
        let data = codec.split(payload, fragment_size);
        codec.encode(data).unwrap()
    }

    #[test]
    fn test_split_pads_tail() {
        let codec = FragmentCodec::new(3, 1).unwrap();
        let fragments = codec.split(b"abcdefg", 3);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], b"abc");
        assert_eq!(fragments[1], b"def");
        assert_eq!(fragments[2], b"g\0\0");
    }

    #[test]
    fn test_encode_roundtrip_all_fragments() {
        let codec = FragmentCodec::new(2, 1).unwrap();
        let payload = b"hello shardvault";
        let fragments = encode_payload(&codec, payload);
        assert_eq!(fragments.len(), 3);

        let opts: Vec<Option<Vec<u8>>> = fragments.into_iter().map(Some).collect();
        let joined = codec.join(&opts, payload.len()).unwrap();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_reconstruct_with_missing_data_fragment() {
        let codec = FragmentCodec::new(2, 1).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let fragments = encode_payload(&codec, &payload);

        let mut opts: Vec<Option<Vec<u8>>> = fragments.into_iter().map(Some).collect();
        opts[0] = None;
        codec.reconstruct(&mut opts).unwrap();
        let joined = codec.join(&opts, payload.len()).unwrap();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_too_many_missing() {
        let codec = FragmentCodec::new(2, 1).unwrap();
        let fragments = encode_payload(&codec, b"some payload bytes");
        let mut opts: Vec<Option<Vec<u8>>> = fragments.into_iter().map(Some).collect();
        opts[0] = None;
        opts[1] = None;
        let result = codec.reconstruct(&mut opts);
        assert!(matches!(
            result,
            Err(ShardVaultError::InsufficientFragments { .. })
        ));
    }

    #[test]
    fn test_zero_parity_passthrough() {
        let codec = FragmentCodec::new(3, 0).unwrap();
        let payload = b"no parity here";
        let fragments = encode_payload(&codec, payload);
        assert_eq!(fragments.len(), 3);

        let mut opts: Vec<Option<Vec<u8>>> = fragments.into_iter().map(Some).collect();
        // all data present, reconstruct is a no-op
        codec.reconstruct(&mut opts).unwrap();
        let joined = codec.join(&opts, payload.len()).unwrap();
        assert_eq!(joined, payload);

        opts[1] = None;
        assert!(codec.reconstruct(&mut opts).is_err());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let codec = FragmentCodec::new(2, 2).unwrap();
        let mut fragments = encode_payload(&codec, b"verify me please");
        assert!(codec.verify(&fragments).unwrap());
        fragments[0][0] ^= 0xFF;
        assert!(!codec.verify(&fragments).unwrap());
    }
}
