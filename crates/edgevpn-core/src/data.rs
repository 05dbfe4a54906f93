//! Opaque ledger values. Writers store the JSON encoding of whatever
//! they put in a bucket; readers decode it back when they know the
//! shape.

use serde::{Deserialize, Serialize};

/// A single ledger value: the canonical JSON text of the value the
/// writer stored. Comparing two `Data` for equality compares the
/// canonical encodings, which is what the announce engine relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(pub String);

impl Data {
    /// Encode a value into its canonical ledger form.
    pub fn encode<T: Serialize>(value: &T) -> Data {
        Data(serde_json::to_string(value).unwrap_or_default())
    }

    /// Decode the value back into a concrete type.
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data(s.to_string())
    }
}

impl std::fmt::Display for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_string() {
        let d = Data::encode(&"bar");
        assert_eq!(d.as_str(), "\"bar\"");
        let back: String = d.decode().unwrap();
        assert_eq!(back, "bar");
    }

    #[test]
    fn encode_is_deterministic() {
        assert_eq!(Data::encode(&42u32), Data::encode(&42u64));
    }
}
