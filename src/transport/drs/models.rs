//! GA4GH DRS v1 response bodies.
//!
//! Every field defaults so partially populated responses from real servers
//! still deserialize.

use std::collections::HashMap;

use serde::Deserialize;

/// Access method type this client can download through.
pub const ACCESS_TYPE_HTTPS: &str = "https";

/// `GET /ga4gh/drs/v1/objects/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GetObjectResponse {
    pub id: String,
    pub name: String,
    pub self_uri: String,
    pub size: u64,
    pub created_time: String,
    pub updated_time: String,
    pub version: String,
    pub mime_type: String,
    pub description: String,
    pub aliases: Vec<String>,
    pub checksums: Vec<Checksum>,
    pub contents: Vec<Content>,
    pub access_methods: Vec<AccessMethod>,
}

/// A published digest of the object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Checksum {
    pub checksum: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Bundle member (only present for bundle objects).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Content {
    pub id: String,
    pub name: String,
    /// A string or a list of strings depending on the server.
    pub drs_uri: serde_json::Value,
    pub contents: Vec<Content>,
}

/// One way of fetching the object's bytes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessMethod {
    /// `s3`, `gs`, `ftp`, `https`, ...
    #[serde(rename = "type")]
    pub kind: String,
    /// Inline access URL; empty when it must be fetched by `access_id`.
    pub access_url: AccessUrl,
    pub region: String,
    pub access_id: String,
}

/// A concrete URL plus the headers required to fetch it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessUrl {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// `GET /ga4gh/drs/v1/objects/{id}/access/{access_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetAccessResponse {
    #[serde(flatten)]
    pub access_url: AccessUrl,
}
