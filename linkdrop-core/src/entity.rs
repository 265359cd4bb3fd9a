//! Link and Group records and their stored representation.
//!
//! Every record lives in a yrs map as a JSON string envelope:
//! ```text
//! { "schema": 1, "id": "...", "canonicalUrl": "...", ... }
//! ```
//! The whole record is one last-write-wins value. Unknown schema versions and
//! unparsable values are treated as absent by the store.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::url::{canonicalize, ensure_protocol};

/// Current record envelope version.
pub const RECORD_SCHEMA: u32 = 1;

/// A saved link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,
    /// URL as entered, with a scheme prefix added when missing.
    pub url: String,
    /// Deduplication key, see [`canonicalize`].
    pub canonical_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-text note written by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Link {
    /// Build a fresh, live link for `url`.
    pub fn new(url: &str) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            url: ensure_protocol(url),
            canonical_url: canonicalize(url),
            title: None,
            description: None,
            user_description: None,
            image: None,
            favicon: None,
            tags: Vec::new(),
            group_id: None,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Apply a partial update. The id and `created_at` never change.
    pub fn apply(&mut self, patch: LinkPatch) {
        if let Some(url) = patch.url {
            self.canonical_url = canonicalize(&url);
            self.url = ensure_protocol(&url);
        }
        if let Some(title) = patch.title {
            self.title = Some(title);
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(note) = patch.user_description {
            self.user_description = Some(note);
        }
        if let Some(image) = patch.image {
            self.image = Some(image);
        }
        if let Some(favicon) = patch.favicon {
            self.favicon = Some(favicon);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(group_id) = patch.group_id {
            self.group_id = group_id;
        }
        if let Some(deleted) = patch.deleted {
            self.deleted = deleted;
        }
        self.updated_at = next_timestamp(self.updated_at);
    }
}

/// Partial update for a [`Link`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPatch {
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user_description: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub tags: Option<Vec<String>>,
    /// `Some(None)` clears the group reference.
    pub group_id: Option<Option<String>>,
    pub deleted: Option<bool>,
}

impl LinkPatch {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn user_description(mut self, note: impl Into<String>) -> Self {
        self.user_description = Some(note.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(Some(group_id.into()));
        self
    }

    pub fn ungroup(mut self) -> Self {
        self.group_id = Some(None);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = Some(deleted);
        self
    }
}

/// Metadata produced by the preview fetcher for a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub favicon: Option<String>,
    pub hostname: String,
}

impl From<&LinkPreview> for LinkPatch {
    fn from(preview: &LinkPreview) -> Self {
        // Empty strings from the scraper mean "nothing found".
        let present = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        Self {
            title: present(&preview.title),
            description: present(&preview.description),
            image: present(&preview.image),
            favicon: present(&preview.favicon),
            ..Self::default()
        }
    }
}

/// Fixed group palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupColor {
    Red,
    Orange,
    Amber,
    Green,
    Teal,
    Blue,
    Indigo,
    Purple,
    Pink,
}

impl GroupColor {
    pub const ALL: [GroupColor; 9] = [
        GroupColor::Red,
        GroupColor::Orange,
        GroupColor::Amber,
        GroupColor::Green,
        GroupColor::Teal,
        GroupColor::Blue,
        GroupColor::Indigo,
        GroupColor::Purple,
        GroupColor::Pink,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GroupColor::Red => "Red",
            GroupColor::Orange => "Orange",
            GroupColor::Amber => "Amber",
            GroupColor::Green => "Green",
            GroupColor::Teal => "Teal",
            GroupColor::Blue => "Blue",
            GroupColor::Indigo => "Indigo",
            GroupColor::Purple => "Purple",
            GroupColor::Pink => "Pink",
        }
    }

    /// CSS color value used by renderers.
    pub fn value(self) -> &'static str {
        match self {
            GroupColor::Red => "oklch(0.637 0.237 25.331)",
            GroupColor::Orange => "oklch(0.705 0.213 47.604)",
            GroupColor::Amber => "oklch(0.795 0.184 86.047)",
            GroupColor::Green => "oklch(0.723 0.219 149.579)",
            GroupColor::Teal => "oklch(0.704 0.14 182.503)",
            GroupColor::Blue => "oklch(0.623 0.214 259.815)",
            GroupColor::Indigo => "oklch(0.585 0.233 277.117)",
            GroupColor::Purple => "oklch(0.627 0.265 303.9)",
            GroupColor::Pink => "oklch(0.656 0.241 354.308)",
        }
    }
}

/// A named, colored bucket of links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub color: GroupColor,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Group {
    pub fn new(name: impl Into<String>, color: GroupColor) -> Self {
        let now = now_millis();
        Self {
            id: new_id(),
            name: name.into(),
            color,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    pub fn apply(&mut self, patch: GroupPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
        if let Some(deleted) = patch.deleted {
            self.deleted = deleted;
        }
        self.updated_at = next_timestamp(self.updated_at);
    }
}

/// Partial update for a [`Group`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub color: Option<GroupColor>,
    pub deleted: Option<bool>,
}

impl GroupPatch {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn color(mut self, color: GroupColor) -> Self {
        self.color = Some(color);
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = Some(deleted);
        self
    }
}

/// Result of an insert that may be rejected as a duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome<T> {
    Added(T),
    /// Nothing was written; carries the live record that blocked the insert.
    Duplicate(T),
}

impl<T> AddOutcome<T> {
    pub fn added(self) -> Option<T> {
        match self {
            AddOutcome::Added(record) => Some(record),
            AddOutcome::Duplicate(_) => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AddOutcome::Duplicate(_))
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    schema: u32,
    #[serde(flatten)]
    record: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn<T> {
    #[serde(default = "legacy_schema")]
    schema: u32,
    #[serde(flatten)]
    record: T,
}

fn legacy_schema() -> u32 {
    RECORD_SCHEMA
}

/// Encode a record into its stored JSON envelope.
pub fn encode_record<T: Serialize>(record: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EnvelopeOut {
        schema: RECORD_SCHEMA,
        record,
    })
}

/// Decode a stored envelope. Returns `None` for anything unreadable.
pub fn decode_record<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str::<EnvelopeIn<T>>(raw) {
        Ok(envelope) if envelope.schema == RECORD_SCHEMA => Some(envelope.record),
        Ok(envelope) => {
            log::debug!("Skipping record with unknown schema {}", envelope.schema);
            None
        }
        Err(e) => {
            log::debug!("Skipping malformed record: {e}");
            None
        }
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Next `updated_at` for a record: never behind the wall clock, never equal
/// to or behind the previous value.
pub fn next_timestamp(previous: i64) -> i64 {
    now_millis().max(previous + 1)
}
