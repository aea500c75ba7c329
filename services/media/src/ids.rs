//! Canonical identifiers, validated once at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when parsing identifiers from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid image id '{0}': expected a UUID")]
    InvalidImageId(String),

    #[error("Product id must not be empty")]
    EmptyProductId,

    #[error("Invalid product id '{0}': only [A-Za-z0-9_-] are allowed")]
    InvalidProductId(String),
}

/// Identity of a stored image record, assigned by the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ImageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for ImageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdError::InvalidImageId(s.to_string()))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque product key. The metadata store does not enforce that the product
/// exists; the value only has to be usable as an object-store path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

impl ProductId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdError::EmptyProductId);
        }
        let valid = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(IdError::InvalidProductId(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProductId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProductId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ProductId> for String {
    fn from(id: ProductId) -> Self {
        id.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_id_round_trips_through_display() {
        let id = ImageId::new();
        let parsed: ImageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_image_id_rejects_non_uuid() {
        // Legacy 24-hex object ids are not accepted; there is one canonical form.
        let err = "65a1f0c2e4b0a1b2c3d4e5f6".parse::<ImageId>().unwrap_err();
        assert!(matches!(err, IdError::InvalidImageId(_)));
    }

    #[test]
    fn test_product_id_validation() {
        assert!(ProductId::parse("sku-001_A").is_ok());
        assert_eq!(ProductId::parse(""), Err(IdError::EmptyProductId));
        assert!(matches!(
            ProductId::parse("../etc"),
            Err(IdError::InvalidProductId(_))
        ));
        assert!(matches!(
            ProductId::parse("a/b"),
            Err(IdError::InvalidProductId(_))
        ));
    }
}
