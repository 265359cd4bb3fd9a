//! Whole-document export and import.
//!
//! The export file is pretty JSON:
//! ```text
//! { "version": 1, "exportedAt": "2026-01-02T03:04:05.678Z",
//!   "state": "<base64 full-state update>", "linkCount": 12 }
//! ```
//! Importing merges the state into the live document, so importing the same
//! file twice changes nothing the second time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;
use crate::store::{LinkStore, UpdateOrigin};

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub version: u32,
    pub exported_at: String,
    pub state: String,
    pub link_count: usize,
}

impl ExportEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Counts reported after an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub total_before: usize,
    pub total_after: usize,
    pub new_links: usize,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid export file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported export version {0}")]
    UnsupportedVersion(u64),

    #[error("export file has no state")]
    MissingState,

    #[error("export state is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("export state is not a valid update: {0}")]
    Update(#[from] StoreError),
}

/// Only the fields import needs; everything else in the file is ignored.
#[derive(Deserialize)]
struct ImportEnvelope {
    version: u64,
    #[serde(default)]
    state: Option<String>,
}

pub fn export_snapshot(store: &LinkStore) -> ExportEnvelope {
    ExportEnvelope {
        version: EXPORT_VERSION,
        exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        state: STANDARD.encode(store.encode_state()),
        link_count: store.link_count(),
    }
}

/// `linkdrop-export-YYYY-MM-DD.json`
pub fn export_file_name(date: NaiveDate) -> String {
    format!("linkdrop-export-{}.json", date.format("%Y-%m-%d"))
}

/// Merge an exported file into `store`. Any format error rejects the whole
/// file before the document is touched.
pub fn import_snapshot(store: &LinkStore, json: &str) -> Result<ImportSummary, ImportError> {
    let envelope: ImportEnvelope = serde_json::from_str(json)?;
    if envelope.version != u64::from(EXPORT_VERSION) {
        return Err(ImportError::UnsupportedVersion(envelope.version));
    }
    let state = envelope.state.ok_or(ImportError::MissingState)?;
    let update = STANDARD.decode(state.trim())?;

    let total_before = store.link_count();
    store.apply_update(&update, UpdateOrigin::Import)?;
    let total_after = store.link_count();

    log::info!("Imported snapshot: {total_before} -> {total_after} links");
    Ok(ImportSummary {
        total_before,
        total_after,
        new_links: total_after.saturating_sub(total_before),
    })
}
