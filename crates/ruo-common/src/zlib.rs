// zlib.rs — pack/unpack for gump payloads
//
// Packed gump packets carry a zlib stream (header and checksum included)
// alongside the declared unpacked length, so the decoder can pre-size and
// reject bombs.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

/// Hard ceiling on unpacked payloads; nothing in the protocol is larger.
pub const MAX_UNPACKED_SIZE: usize = 0x10000;

#[derive(Debug, Error)]
pub enum ZLibError {
    #[error("zlib stream error: {0}")]
    Stream(#[from] std::io::Error),
    #[error("unpacked length {actual} does not match declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared unpacked length {0} exceeds the {MAX_UNPACKED_SIZE} byte cap")]
    TooLarge(usize),
}

/// Deflate `data` into a fresh zlib stream.
pub fn pack(data: &[u8]) -> Result<Vec<u8>, ZLibError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate `data`, which must expand to exactly `declared_len` bytes.
pub fn unpack(data: &[u8], declared_len: usize) -> Result<Vec<u8>, ZLibError> {
    if declared_len > MAX_UNPACKED_SIZE {
        return Err(ZLibError::TooLarge(declared_len));
    }

    let mut decoder = ZlibDecoder::new(data).take(declared_len as u64 + 1);
    let mut out = Vec::with_capacity(declared_len);
    decoder.read_to_end(&mut out)?;

    if out.len() != declared_len {
        return Err(ZLibError::LengthMismatch {
            declared: declared_len,
            actual: out.len(),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 200) as u8).collect();
        let packed = pack(&data).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = unpack(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let packed = pack(b"hello gump").unwrap();
        assert!(matches!(
            unpack(&packed, 4),
            Err(ZLibError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_oversize_declared_rejected() {
        let packed = pack(b"x").unwrap();
        assert!(matches!(
            unpack(&packed, MAX_UNPACKED_SIZE + 1),
            Err(ZLibError::TooLarge(_))
        ));
    }
}
