//! Transaction fact store for amlflow.
//!
//! Facts are JSON documents (plus the raw transaction text) addressed by
//! `(transaction, logical path)`. Two physical layouts coexist on disk:
//! the flat legacy layout and the categorized versioned layout. Writes go to
//! the versioned layout, reads fall back to legacy, and [`FactStore::migrate`]
//! moves a namespace from one to the other without data loss.

pub mod browse;
mod io;
pub mod layout;
pub mod legacy;
pub mod migrate;
pub mod skeleton;
pub mod store;

pub use browse::{FileContent, FileView, MAX_INLINE_BYTES, NodeKind, TreeNode};
pub use layout::{
    CATEGORY_TABLE, Category, FACT_TABLE, LogicalPath, PhysicalLayout, RootFact, legacy_to_versioned,
    resolve,
};
pub use legacy::{LegacyResult, parse_assessment};
pub use migrate::MigrationReport;
pub use skeleton::{NamespaceMarker, SKELETON};
pub use store::{FactStore, NamespaceHandle, ScannedResult};
