use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FilterError;

/// Opaque payload handed to the provider in every hydration callback.
///
/// The engine stores the server-relative path here, encoded as UTF-16LE with
/// a trailing NUL. The filter never interprets the bytes beyond that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity(Vec<u8>);

impl FileIdentity {
    pub fn from_relative(relative: &str) -> Self {
        let normalized = relative.trim_matches('/').replace('\\', "/");
        let mut bytes = Vec::with_capacity((normalized.len() + 1) * 2);
        for unit in normalized.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Byte length including the trailing NUL, as carried on the wire.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() < 2 || self.0 == 0u16.to_le_bytes()
    }

    pub fn to_relative(&self) -> Result<String, FilterError> {
        if self.is_empty() {
            return Err(FilterError::EmptyIdentity);
        }
        if self.0.len() % 2 != 0 {
            return Err(FilterError::InvalidIdentity);
        }
        let mut units: Vec<u16> = self
            .0
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        while units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16(&units).map_err(|_| FilterError::InvalidIdentity)
    }
}

impl Serialize for FileIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let relative = self.to_relative().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&relative)
    }
}

impl<'de> Deserialize<'de> for FileIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let relative = String::deserialize(deserializer)?;
        Ok(Self::from_relative(&relative))
    }
}
