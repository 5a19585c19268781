//! Serde helpers for byte payloads.

/// Serializes byte buffers as standard base64 strings.
///
/// Use with `#[serde(with = "reeve_proto::encoding::base64_bytes")]`.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Encode `data` as a base64 string.
    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(data.as_ref()))
    }

    /// Decode a base64 string into bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_bytes_encode_as_base64_string() {
        let blob = Blob { data: b"hello".to_vec() };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"aGVsbG8="}"#);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = serde_json::from_str::<Blob>(r#"{"data":"***"}"#);
        assert!(result.is_err());
    }
}
