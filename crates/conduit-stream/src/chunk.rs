//! Units of data carried by streams.

use bytes::Bytes;

/// A chunk of data in a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Binary data
    Bytes(Bytes),
    /// Text data
    Text(String),
    /// Arbitrary value (object mode)
    Json(serde_json::Value),
}

impl Chunk {
    /// Byte length for binary and text chunks, `1` for values.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.len(),
            Chunk::Json(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Bytes(b) => b.is_empty(),
            Chunk::Text(s) => s.is_empty(),
            Chunk::Json(_) => false,
        }
    }

    /// Size this chunk accounts for in a buffer.
    pub fn buffered_len(&self, object_mode: bool) -> usize {
        if object_mode { 1 } else { self.len() }
    }

    /// Raw bytes of the chunk; values are serialized as JSON.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Chunk::Bytes(b) => b.clone(),
            Chunk::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Chunk::Json(v) => Bytes::from(v.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Chunk::Text(s) => Some(s),
            Chunk::Bytes(b) => std::str::from_utf8(b).ok(),
            Chunk::Json(v) => v.as_str(),
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Chunk::Text(s) => serde_json::Value::String(s.clone()),
            Chunk::Bytes(b) => serde_json::json!({
                "type": "Buffer",
                "data": b.as_ref()
            }),
            Chunk::Json(v) => v.clone(),
        }
    }

    /// Create from JSON value
    pub fn from_json(value: serde_json::Value) -> Self {
        if let Some(s) = value.as_str() {
            Chunk::Text(s.to_string())
        } else if let Some(obj) = value.as_object() {
            if obj.get("type").and_then(|v| v.as_str()) == Some("Buffer")
                && let Some(data) = obj.get("data").and_then(|v| v.as_array())
            {
                let bytes: Vec<u8> = data
                    .iter()
                    .filter_map(|v| v.as_u64().map(|n| n as u8))
                    .collect();
                return Chunk::Bytes(Bytes::from(bytes));
            }
            Chunk::Json(value)
        } else {
            Chunk::Json(value)
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Bytes(b)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(b: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(b: &'static [u8]) -> Self {
        Chunk::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Chunk {
    fn from(v: serde_json::Value) -> Self {
        Chunk::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lengths() {
        assert_eq!(Chunk::from("abc").len(), 3);
        assert_eq!(Chunk::from(vec![1u8, 2]).len(), 2);
        assert_eq!(Chunk::from(json!({"a": 1})).len(), 1);
        assert_eq!(Chunk::from("abc").buffered_len(true), 1);
        assert!(Chunk::from("").is_empty());
        assert!(!Chunk::from(json!(null)).is_empty());
    }

    #[test]
    fn test_json_buffer_shape() {
        let chunk = Chunk::from(vec![104u8, 105]);
        let value = chunk.to_json();
        assert_eq!(value, json!({"type": "Buffer", "data": [104, 105]}));
        assert_eq!(Chunk::from_json(value), chunk);
        assert_eq!(Chunk::from_json(json!("hi")), Chunk::from("hi"));
        assert_eq!(Chunk::from_json(json!(7)), Chunk::Json(json!(7)));
    }

    #[test]
    fn test_as_str() {
        assert_eq!(Chunk::from(b"ok".as_slice()).as_str(), Some("ok"));
        assert_eq!(Chunk::from(json!(1)).as_str(), None);
        assert_eq!(Chunk::from(json!({"k": 1})).to_bytes(), Bytes::from("{\"k\":1}"));
    }
}
