//! Stream metadata documents.
//!
//! Metadata lives in a reserved metastream (`$$<stream>`) whose latest
//! event holds a JSON document with the well-known `$`-prefixed fields
//! below; everything else round-trips through `custom`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub(crate) const METADATA_EVENT_TYPE: &str = "$metadata";

pub(crate) fn metastream_of(stream: &str) -> String {
    format!("$${stream}")
}

pub(crate) fn is_metastream(stream: &str) -> bool {
    stream.starts_with("$$")
}

/// Access control list of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamAcl {
    #[serde(rename = "$r", skip_serializing_if = "Option::is_none")]
    pub read_roles: Option<Vec<String>>,
    #[serde(rename = "$w", skip_serializing_if = "Option::is_none")]
    pub write_roles: Option<Vec<String>>,
    #[serde(rename = "$d", skip_serializing_if = "Option::is_none")]
    pub delete_roles: Option<Vec<String>>,
    #[serde(rename = "$mr", skip_serializing_if = "Option::is_none")]
    pub meta_read_roles: Option<Vec<String>>,
    #[serde(rename = "$mw", skip_serializing_if = "Option::is_none")]
    pub meta_write_roles: Option<Vec<String>>,
}

/// Metadata of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "$maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    /// Seconds events are kept before becoming eligible for scavenge.
    #[serde(rename = "$maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
    /// Events below this number are scavengeable.
    #[serde(rename = "$tb", skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<u64>,
    #[serde(rename = "$cacheControl", skip_serializing_if = "Option::is_none")]
    pub cache_control_seconds: Option<u64>,
    #[serde(rename = "$acl", skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// Result of fetching a stream's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadataResult {
    pub stream: String,
    /// The parent stream has been deleted; `version` is `i64::MAX`.
    pub deleted: bool,
    /// Version of the metadata document, -1 when none exists yet.
    pub version: i64,
    pub metadata: StreamMetadata,
}
