// SPDX-License-Identifier: MIT OR Apache-2.0
//! A deliberately thin CycloneDX wrapper.
//!
//! The handler never needs the full BOM model: it projects components into
//! facts and hands the document to the scanner. The scanner needs the whole
//! BOM back, byte-faithful, so the document is kept as a raw JSON value with
//! typed views parsed on demand.

use crate::{CodecError, decode_binary_payload};
use serde::{Deserialize, Serialize};

/// One `components[]` entry, reduced to the fields projected into facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Component name.
    #[serde(default)]
    pub name: String,
    /// Component version.
    #[serde(default)]
    pub version: String,
    /// Package URL.
    #[serde(default)]
    pub purl: String,
}

/// A decoded CycloneDX document.
///
/// Holds the full JSON value so re-serialising for the scanner is lossless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbomDocument {
    raw: serde_json::Value,
}

impl SbomDocument {
    /// Decode a binary payload entry (base64, possibly gzipped) into a BOM.
    ///
    /// # Errors
    ///
    /// Any [`CodecError`] from the decode sequence.
    pub fn from_payload(encoded: &str) -> Result<Self, CodecError> {
        let bytes = decode_binary_payload(encoded)?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
        Ok(Self { raw })
    }

    /// Wrap an already-decoded JSON value.
    #[must_use]
    pub fn from_value(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    /// The full document, for handing to the scanner.
    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Serialise the full document.
    ///
    /// # Errors
    ///
    /// [`CodecError::Json`] if the value cannot be serialised.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.raw)?)
    }

    /// The `components[]` array, reduced to fact-relevant fields. Entries
    /// that do not deserialise are skipped rather than failing the document.
    #[must_use]
    pub fn components(&self) -> Vec<Component> {
        self.raw
            .get("components")
            .and_then(|c| c.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the subject component, when the BOM carries one.
    #[must_use]
    pub fn subject_name(&self) -> Option<&str> {
        self.raw
            .pointer("/metadata/component/name")
            .and_then(|n| n.as_str())
    }
}
