//! # linkdrop-core
//!
//! The replicated data model for LinkDrop: saved links and groups kept in a
//! conflict-free yrs document, so any number of devices can edit offline and
//! converge once they exchange updates.
//!
//! - [`url`]: canonical URL keys used for duplicate detection
//! - [`entity`]: [`Link`] and [`Group`] records and their stored envelope
//! - [`store`]: [`LinkStore`], mutations, queries, change feeds and state exchange
//! - [`snapshot`]: JSON export and import of the whole document

pub mod entity;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod url;

pub use entity::{AddOutcome, Group, GroupColor, GroupPatch, Link, LinkPatch, LinkPreview};
pub use error::StoreError;
pub use snapshot::{
    export_file_name, export_snapshot, import_snapshot, ExportEnvelope, ImportError, ImportSummary,
};
pub use store::{ChangeEvent, Changes, Collection, DocUpdate, LinkStore, UpdateOrigin};
pub use self::url::{canonicalize, ensure_protocol, extract_hostname, is_valid_url};
