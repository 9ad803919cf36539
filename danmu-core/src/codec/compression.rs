use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use super::FrameError;

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate a gzip member, refusing to produce more than `limit` bytes.
pub fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
    let read = GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Corrupt(format!("gzip: {e}")))?;
    if read > limit {
        return Err(FrameError::TooLarge { size: read, max: limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gunzip_inverts_gzip() {
        let data = b"KPL\xe5\x86\xb2".repeat(100);
        let packed = gzip(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gunzip(&packed, 1 << 20).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let err = gunzip(b"definitely not gzip", 1024).unwrap_err();
        assert!(matches!(err, FrameError::Corrupt(_)));
    }

    #[test]
    fn test_gunzip_enforces_limit() {
        let packed = gzip(&[0u8; 4096]).unwrap();
        assert_eq!(
            gunzip(&packed, 1024).unwrap_err(),
            FrameError::TooLarge { size: 1025, max: 1024 }
        );
    }
}
