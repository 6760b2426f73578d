//! Record types returned by the Harbor API.

use serde::{Deserialize, Serialize};

/// A collection record: a named, versioned directory tree of immutable
/// content-addressed files, serialized as a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub uuid: String,
    pub owner_uuid: String,
    pub name: String,
    pub portable_data_hash: String,
    /// Omitted by list endpoints; fetched per record.
    #[serde(default)]
    pub manifest_text: String,
    /// Optimistic-concurrency token; updates must carry the last observed
    /// value and are rejected when it no longer matches.
    pub version: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// A tag link attaching a tag name to a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagLink {
    pub name: String,
    pub collection_uuid: String,
}

/// A project (group) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub uuid: String,
    pub name: String,
    pub owner_uuid: String,
}

/// The authenticated principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub uuid: String,
    #[serde(default)]
    pub full_name: String,
}

/// An owner (user or group) visible through the shared-objects listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedOwner {
    pub uuid: String,
    pub name: String,
}

/// Generic list envelope used by all listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemList<T> {
    pub items: Vec<T>,
}
