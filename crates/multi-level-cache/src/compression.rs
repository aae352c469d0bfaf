use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Raw or DEFLATE-compressed storage for a cache value (§4.4a). Callers
/// never see this directly — `get` always returns decompressed bytes.
#[derive(Clone, Debug)]
pub(crate) enum Stored {
    Raw(Vec<u8>),
    Compressed(Vec<u8>),
}

impl Stored {
    pub(crate) fn wrap(value: Vec<u8>, threshold: Option<usize>) -> Self {
        match threshold {
            Some(limit) if value.len() > limit => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
                if encoder.write_all(&value).is_ok() {
                    if let Ok(compressed) = encoder.finish() {
                        if compressed.len() < value.len() {
                            return Stored::Compressed(compressed);
                        }
                    }
                }
                Stored::Raw(value)
            }
            _ => Stored::Raw(value),
        }
    }

    pub(crate) fn stored_len(&self) -> usize {
        match self {
            Stored::Raw(v) | Stored::Compressed(v) => v.len(),
        }
    }

    pub(crate) fn into_plain(self) -> Vec<u8> {
        match self {
            Stored::Raw(v) => v,
            Stored::Compressed(v) => {
                let mut decoder = DeflateDecoder::new(v.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .expect("compressed cache entries are never corrupted in-process");
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_are_never_compressed() {
        let stored = Stored::wrap(vec![1, 2, 3], Some(1024));
        assert!(matches!(stored, Stored::Raw(_)));
    }

    #[test]
    fn large_compressible_values_round_trip() {
        let value = vec![7u8; 4096];
        let stored = Stored::wrap(value.clone(), Some(64));
        assert!(matches!(stored, Stored::Compressed(_)));
        assert_eq!(stored.into_plain(), value);
    }
}
