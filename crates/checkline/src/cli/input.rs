//! Filled-in checklist files accepted by `checkline submit`.
//!
//! ```json
//! {
//!   "asset_id": "engine-12",
//!   "asset_type": "engine",
//!   "items": [
//!     {"id": "pump", "verdict": "conformant"},
//!     {"id": "hose", "verdict": "non_conformant", "note": "split", "photos": ["hose.jpg"]}
//!   ]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::checklist::{CapturedImage, Verdict};
use crate::error::Result;
use crate::session::ChecklistSession;

/// A checklist filled in outside the engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChecklistInput {
    /// The inspected asset.
    pub asset_id: String,
    /// Asset type used to pick the template.
    pub asset_type: String,
    /// Recorded items; items left out stay without a verdict.
    #[serde(default)]
    pub items: Vec<ItemInput>,
}

/// One recorded item.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemInput {
    /// Template item identifier.
    pub id: String,
    /// The verdict, if one was given.
    #[serde(default)]
    pub verdict: Option<Verdict>,
    /// Free-text note.
    #[serde(default)]
    pub note: Option<String>,
    /// Photo files, relative to the checklist file.
    #[serde(default)]
    pub photos: Vec<String>,
}

impl ChecklistInput {
    /// Read a checklist file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid checklist.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Record every item into `session`, reading photos relative to `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns the first error from the session (unknown item, attachment
    /// cap) or from reading a photo.
    pub fn apply(&self, session: &mut ChecklistSession, base_dir: &Path) -> Result<()> {
        for item in &self.items {
            if let Some(verdict) = item.verdict {
                session.set_verdict(&item.id, verdict)?;
            }
            if let Some(note) = &item.note {
                session.set_note(&item.id, note.as_str())?;
            }
            if !item.photos.is_empty() {
                let photos = item
                    .photos
                    .iter()
                    .map(|photo| CapturedImage::from_path(&base_dir.join(photo)))
                    .collect::<Result<Vec<_>>>()?;
                session.add_attachments(&item.id, photos)?;
            }
        }
        Ok(())
    }
}
