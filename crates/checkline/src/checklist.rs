//! Core checklist types for checkline.
//!
//! This module defines the closed, versioned shape of a checklist item, the
//! photos captured as evidence, and the template catalog the engine reads
//! item lists from.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version of the finalized item shape sent to the remote service.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// The operator's judgement on a single checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The item meets the standard.
    Conformant,
    /// The item fails the standard and needs supporting evidence.
    NonConformant,
    /// The item does not apply to this asset.
    NotApplicable,
}

impl Verdict {
    /// Parse a verdict from its snake_case name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conformant" => Some(Self::Conformant),
            "non_conformant" => Some(Self::NonConformant),
            "not_applicable" => Some(Self::NotApplicable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conformant => write!(f, "conformant"),
            Self::NonConformant => write!(f, "non_conformant"),
            Self::NotApplicable => write!(f, "not_applicable"),
        }
    }
}

/// An opaque acting identity supplied by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Wrap an identity string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity used for transitions the engine makes on its own.
    #[must_use]
    pub fn system() -> Self {
        Self("system:checkline".to_string())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A photo captured as evidence for a checklist item.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedImage {
    /// File name reported by the capture device.
    pub file_name: String,
    /// MIME type of the image.
    pub content_type: String,
    /// Raw image bytes.
    pub bytes: Vec<u8>,
}

impl CapturedImage {
    /// Create a captured image.
    #[must_use]
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read an image from disk, guessing its MIME type from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map_or_else(|| "photo".to_string(), |n| n.to_string_lossy().into_owned());
        let content_type = content_type_for(&file_name);
        Ok(Self::new(file_name, content_type, bytes))
    }

    /// Compute the BLAKE3 hash of the image bytes.
    #[must_use]
    pub fn content_hash(&self) -> String {
        blake3::hash(&self.bytes).to_hex().to_string()
    }

    /// Size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the image has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Blobs are elided: a single photo would flood the logs.
impl std::fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedImage")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// One item of a checklist template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    /// Stable item identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping category.
    pub category: String,
    /// Template-specific fields carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl TemplateItem {
    /// Create a template item without extra fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            extra: None,
        }
    }
}

/// An ordered list of checkable items for one asset type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier recorded on every submission.
    pub id: String,
    /// Asset type this template applies to.
    pub asset_type: String,
    /// Items in display order.
    pub items: Vec<TemplateItem>,
}

/// A finalized checklist item as queued and delivered.
///
/// Photos are not part of this record; they live in the attachments table
/// and are referenced by item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Item identifier from the template.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping category.
    pub category: String,
    /// The recorded verdict.
    pub verdict: Verdict,
    /// Free-text note, empty if none.
    #[serde(default)]
    pub note: String,
    /// Template-specific fields carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl ChecklistItem {
    /// Check if this item records a failure.
    #[must_use]
    pub fn is_non_conformant(&self) -> bool {
        self.verdict == Verdict::NonConformant
    }
}

/// Source of checklist templates, keyed by asset type.
pub trait TemplateCatalog: Send + Sync {
    /// Look up the template for an asset type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TemplateNotFound`] if the catalog has no such template.
    fn template(&self, asset_type: &str) -> Result<Template>;
}

/// An in-memory template catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    templates: HashMap<String, Template>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template, replacing any existing one for the same asset type.
    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.asset_type.clone(), template);
    }

    /// Load a catalog from a JSON file holding an array of templates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let templates: Vec<Template> = serde_json::from_str(&raw)?;
        let mut catalog = Self::new();
        for template in templates {
            catalog.insert(template);
        }
        Ok(catalog)
    }

    /// Number of templates in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Check if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateCatalog for StaticCatalog {
    fn template(&self, asset_type: &str) -> Result<Template> {
        self.templates
            .get(asset_type)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound {
                asset_type: asset_type.to_string(),
            })
    }
}
