use serde::{Deserialize, Serialize, de};
use thiserror::Error;

/// A string that is safe to embed in a single file or folder name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSegment {
    value: String,
}

impl PathSegment {
    /// The longest segment accepted.
    pub const MAX_LENGTH: usize = 128;

    /// The segment as a string slice.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl TryFrom<&str> for PathSegment {
    type Error = PathSegmentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        const INVALID_CHARACTERS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

        if value.is_empty() {
            return Err(Self::Error::Empty);
        }

        // Check length
        if value.len() > Self::MAX_LENGTH {
            return Err(Self::Error::TooLong(value.len(), Self::MAX_LENGTH));
        }

        // All characters must be valid
        if let Some((index, character)) = value
            .char_indices()
            .find(|(_, character)| character.is_control() || INVALID_CHARACTERS.contains(character))
        {
            return Err(Self::Error::Invalid(index, character));
        }

        // Must not navigate
        if value == "." || value == ".." {
            return Err(Self::Error::Relative);
        }

        Ok(Self {
            value: value.to_string(),
        })
    }
}

impl TryFrom<String> for PathSegment {
    type Error = PathSegmentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl core::fmt::Debug for PathSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PathSegment").field(&self.value).finish()
    }
}

impl core::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<'de> Deserialize<'de> for PathSegment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string: String = Deserialize::deserialize(deserializer)?;
        Self::try_from(string).map_err(de::Error::custom)
    }
}

impl Serialize for PathSegment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.value)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathSegmentError {
    /// `length, limit`
    #[error("Input was too long {0} > {1}")]
    TooLong(usize, usize),

    #[error("Input was empty")]
    Empty,

    /// `index, char`
    #[error("Invalid character at index {0}: {1:?}, may not contain separators or control characters")]
    Invalid(usize, char),

    #[error("Input may not be a relative path component")]
    Relative,
}
