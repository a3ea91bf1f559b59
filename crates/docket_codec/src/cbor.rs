//! CBOR encoding via `ciborium`.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::encoding(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        version: u64,
        tombstone: bool,
    }

    #[test]
    fn struct_roundtrip() {
        let sample = Sample {
            id: "case-7".into(),
            version: 12,
            tombstone: false,
        };
        let bytes = to_cbor(&sample).unwrap();
        let decoded: Sample = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn json_payload_survives_cbor() {
        let payload = json!({
            "caseNumber": "2024-CV-0031",
            "parties": ["Acme", "Globex"],
            "billable": true,
            "hours": 3,
            "rate": 150.5,
            "notes": null
        });
        let bytes = to_cbor(&payload).unwrap();
        let decoded: serde_json::Value = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result: CodecResult<Sample> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn wrong_shape_fails_to_decode() {
        let bytes = to_cbor(&42u32).unwrap();
        let result: CodecResult<Sample> = from_cbor(&bytes);
        assert!(result.is_err());
    }
}
