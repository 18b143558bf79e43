//! Transfer codec for handing file content to a background worker
//!
//! Content crosses the worker boundary as base64 text inside
//! [`EncodedFile`]. Encoding failures are per-file: the orchestrator marks
//! that file failed and sends the rest.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::FileItem;

/// A file serialized for the worker command channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedFile {
    pub index: usize,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub content: String,
}

/// Encode one file's content, rejecting payloads above `max_bytes`
pub fn encode_file(file: &FileItem, data: &Bytes, max_bytes: usize) -> Result<EncodedFile> {
    if data.len() > max_bytes {
        return Err(Error::encoding(
            &file.name,
            format!("{} bytes exceeds the transfer limit of {} bytes", data.len(), max_bytes),
        ));
    }
    if data.len() as u64 != file.size_bytes {
        return Err(Error::encoding(
            &file.name,
            format!("content is {} bytes but the file record says {}", data.len(), file.size_bytes),
        ));
    }

    Ok(EncodedFile {
        index: file.index,
        name: file.name.clone(),
        mime_type: file.mime_type.clone(),
        size_bytes: file.size_bytes,
        content: STANDARD.encode(data),
    })
}

/// Decode content on the worker side
pub fn decode_file(file: &EncodedFile) -> Result<Bytes> {
    let data = STANDARD
        .decode(file.content.as_bytes())
        .map_err(|e| Error::encoding(&file.name, e.to_string()))?;

    if data.len() as u64 != file.size_bytes {
        return Err(Error::encoding(
            &file.name,
            format!("decoded {} bytes, expected {}", data.len(), file.size_bytes),
        ));
    }
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileUpload;

    fn item(data: &[u8]) -> FileItem {
        FileItem::new("b", 3, &FileUpload::new("scan.pdf", data.to_vec()))
    }

    #[test]
    fn test_binary_content_survives_transfer() {
        let data = Bytes::from(vec![0u8, 255, 10, 13, 0x80]);
        let encoded = encode_file(&item(&data), &data, 1024).unwrap();
        assert_eq!(encoded.index, 3);
        assert_eq!(decode_file(&encoded).unwrap(), data);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let data = Bytes::from(vec![1u8; 64]);
        let err = encode_file(&item(&data), &data, 32).unwrap_err();
        assert!(matches!(err, Error::Encoding { ref filename, .. } if filename == "scan.pdf"));
    }

    #[test]
    fn test_corrupt_content_fails_decode() {
        let data = Bytes::from_static(b"hello");
        let mut encoded = encode_file(&item(&data), &data, 1024).unwrap();
        encoded.content = "%%%not-base64".to_string();
        assert!(decode_file(&encoded).is_err());

        encoded.content = STANDARD.encode(b"hi");
        assert!(decode_file(&encoded).is_err());
    }
}
