//! Pipeline-cache blob header
//!
//! The core keeps its routine caches in memory only. A pipeline-cache export
//! carries this fixed header followed by opaque payload bytes the core never
//! interprets.

use thiserror::Error;

/// Errors decoding a pipeline-cache blob
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineCacheError {
    /// Fewer bytes than the fixed header
    #[error("pipeline cache blob is truncated ({0} bytes)")]
    Truncated(usize),
    /// Header length field disagrees with the format
    #[error("pipeline cache header length {0} is invalid")]
    BadHeaderLength(u32),
    /// Unsupported header version
    #[error("pipeline cache version {0} is not supported")]
    BadVersion(u32),
}

/// Size of the serialized header in bytes (four u32 fields plus the UUID)
pub const HEADER_LENGTH: u32 = 32;

/// Supported header version
pub const HEADER_VERSION: u32 = 1;

/// Fixed-layout blob header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCacheHeader {
    /// Always [`HEADER_LENGTH`]
    pub header_length: u32,
    /// Always [`HEADER_VERSION`]
    pub version: u32,
    /// Vendor identifier of the producing implementation
    pub vendor_id: u32,
    /// Device identifier of the producing implementation
    pub device_id: u32,
    /// Producing implementation's cache UUID
    pub uuid: [u8; 16],
}

impl PipelineCacheHeader {
    /// Creates a header for this implementation
    pub fn new(vendor_id: u32, device_id: u32, uuid: [u8; 16]) -> Self {
        Self {
            header_length: HEADER_LENGTH,
            version: HEADER_VERSION,
            vendor_id,
            device_id,
            uuid,
        }
    }

    /// Serializes the header followed by `payload`
    pub fn serialize(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH as usize + payload.len());
        out.extend_from_slice(&self.header_length.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.uuid);
        out.extend_from_slice(payload);
        out
    }

    /// Parses a blob into its header and opaque payload
    pub fn deserialize(blob: &[u8]) -> Result<(Self, &[u8]), PipelineCacheError> {
        if blob.len() < HEADER_LENGTH as usize {
            return Err(PipelineCacheError::Truncated(blob.len()));
        }
        let word = |index: usize| {
            u32::from_le_bytes(blob[index * 4..index * 4 + 4].try_into().unwrap())
        };
        let header_length = word(0);
        if header_length != HEADER_LENGTH {
            return Err(PipelineCacheError::BadHeaderLength(header_length));
        }
        let version = word(1);
        if version != HEADER_VERSION {
            return Err(PipelineCacheError::BadVersion(version));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&blob[16..32]);
        let header = Self {
            header_length,
            version,
            vendor_id: word(2),
            device_id: word(3),
            uuid,
        };
        Ok((header, &blob[HEADER_LENGTH as usize..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PipelineCacheHeader::new(0x1AE0, 0xC0DE, *b"0123456789abcdef");
        let blob = header.serialize(b"opaque-payload");
        let (parsed, payload) = PipelineCacheHeader::deserialize(&blob).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"opaque-payload");
    }

    #[test]
    fn test_rejects_bad_blobs() {
        assert_eq!(
            PipelineCacheHeader::deserialize(&[0u8; 8]),
            Err(PipelineCacheError::Truncated(8))
        );

        let header = PipelineCacheHeader::new(1, 2, [0; 16]);
        let mut blob = header.serialize(&[]);
        blob[4] = 9; // version
        assert_eq!(
            PipelineCacheHeader::deserialize(&blob),
            Err(PipelineCacheError::BadVersion(9))
        );
    }
}
