//! Manifest parsing: annotation lines into a typed [`TransferSet`].
//!
//! The manifest is a downward-API annotations file. Each line looks like
//! `key="<json-encoded string>"`; the decoded string is either the payload
//! itself (`task-inputs`, `task-outputs`) or a path to a side file holding it
//! (`task-inputs-ref`, `task-outputs-ref`).
//!
//! ```text
//! task-inputs="{\"inputs\":[{\"url\":\"s3://b/k\",\"path\":\"/work/k\",\"type\":\"file\"}]}"
//! task-outputs-ref="/offload/outputs.json"
//! ```

mod entity;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::FilerError;
use crate::transport::TransferError;

pub use entity::{
    EmbeddedCredentials, EntityKind, EntityRecord, RemoteUrl, Scheme, TransferEntity,
    ensure_trailing_slash,
};

/// Longest manifest line accepted, in bytes.
pub const MAX_LINE_BYTES: usize = 204_800;

const KEY_INPUTS: &str = "task-inputs";
const KEY_OUTPUTS: &str = "task-outputs";
const KEY_INPUTS_REF: &str = "task-inputs-ref";
const KEY_OUTPUTS_REF: &str = "task-outputs-ref";

/// Which side of the task lifecycle a run handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Download inputs only.
    Inputs,
    /// Upload outputs only.
    Outputs,
    /// Download inputs, then upload outputs.
    All,
}

impl FromStr for TransferMode {
    type Err = FilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inputs" => Ok(Self::Inputs),
            "outputs" => Ok(Self::Outputs),
            "all" => Ok(Self::All),
            _ => Err(FilerError::invalid_argument("mode", s)),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inputs => "inputs",
            Self::Outputs => "outputs",
            Self::All => "all",
        })
    }
}

/// Direction of a single entity transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Remote to local.
    Download,
    /// Local to remote.
    Upload,
}

impl TransferDirection {
    /// Upper-case label embedded in completion marker names.
    #[must_use]
    pub fn marker_label(self) -> &'static str {
        match self {
            Self::Download => "INPUTS",
            Self::Upload => "OUTPUTS",
        }
    }
}

/// Where oversized manifest payloads are offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffloadMode {
    /// Payload files live on a shared volume and `*-ref` keys are followed.
    #[default]
    Volume,
    /// Payloads are kept in a database this process cannot reach; `*-ref` keys are ignored.
    Sql,
}

impl FromStr for OffloadMode {
    type Err = FilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pvc" | "volume" => Ok(Self::Volume),
            "sql" => Ok(Self::Sql),
            _ => Err(FilerError::invalid_argument("offload_type", s)),
        }
    }
}

/// The complete unit of work for one invocation.
#[derive(Debug, Clone)]
pub struct TransferSet {
    /// Which lists are processed.
    pub mode: TransferMode,
    /// Entities to download, in manifest order.
    pub inputs: Vec<TransferEntity>,
    /// Entities to upload, in manifest order.
    pub outputs: Vec<TransferEntity>,
}

#[derive(Debug, Default, Deserialize)]
struct InputsPayload {
    #[serde(default)]
    inputs: Vec<EntityRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputsPayload {
    #[serde(default)]
    outputs: Vec<EntityRecord>,
}

/// Raw payload strings extracted from manifest text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestPayloads {
    /// Inline inputs payload, if any.
    pub inputs: Option<String>,
    /// Inline outputs payload, if any.
    pub outputs: Option<String>,
    /// Side file holding the inputs payload, if any.
    pub inputs_ref: Option<PathBuf>,
    /// Side file holding the outputs payload, if any.
    pub outputs_ref: Option<PathBuf>,
}

/// Extracts payloads from manifest text.
///
/// Unknown keys are ignored. A later line with the same key wins.
///
/// # Errors
///
/// Returns [`FilerError::InvalidArgument`] for a line longer than
/// [`MAX_LINE_BYTES`], a line without `=`, or a value that is not a
/// JSON-encoded string.
pub fn parse_manifest_str(raw: &str) -> Result<ManifestPayloads, FilerError> {
    let mut payloads = ManifestPayloads::default();
    for (line_index, line) in raw.lines().enumerate() {
        if line.len() > MAX_LINE_BYTES {
            return Err(FilerError::invalid_argument(
                "manifest",
                format!(
                    "line {} is {} bytes, limit is {MAX_LINE_BYTES}",
                    line_index + 1,
                    line.len()
                ),
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, quoted)) = line.split_once('=') else {
            return Err(FilerError::invalid_argument(
                "manifest",
                format!("line {}: expected key=\"value\"", line_index + 1),
            ));
        };
        let value: String = serde_json::from_str(quoted).map_err(|e| {
            FilerError::invalid_argument(
                "manifest",
                format!("line {} ({key}): {e}", line_index + 1),
            )
        })?;

        match key {
            KEY_INPUTS => payloads.inputs = Some(value),
            KEY_OUTPUTS => payloads.outputs = Some(value),
            KEY_INPUTS_REF => payloads.inputs_ref = Some(PathBuf::from(value)),
            KEY_OUTPUTS_REF => payloads.outputs_ref = Some(PathBuf::from(value)),
            _ => debug!(key, "ignoring manifest key"),
        }
    }
    Ok(payloads)
}

/// Parses an inputs payload into entities.
///
/// # Errors
///
/// Returns [`FilerError::InvalidArgument`] for malformed JSON or any invalid
/// entity.
pub fn parse_inputs(payload: &str) -> Result<Vec<TransferEntity>, FilerError> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: InputsPayload = serde_json::from_str(payload)
        .map_err(|e| FilerError::invalid_argument("manifest.inputs", e.to_string()))?;
    parsed.inputs.into_iter().map(TransferEntity::try_from).collect()
}

/// Parses an outputs payload into entities.
///
/// # Errors
///
/// Returns [`FilerError::InvalidArgument`] for malformed JSON or any invalid
/// entity.
pub fn parse_outputs(payload: &str) -> Result<Vec<TransferEntity>, FilerError> {
    if payload.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OutputsPayload = serde_json::from_str(payload)
        .map_err(|e| FilerError::invalid_argument("manifest.outputs", e.to_string()))?;
    parsed.outputs.into_iter().map(TransferEntity::try_from).collect()
}

/// Reads a manifest file and builds the [`TransferSet`] for `mode`.
///
/// # Errors
///
/// - [`FilerError::NotFound`] if the manifest does not exist
/// - [`FilerError::InvalidArgument`] for any malformed line or entity
/// - [`FilerError::Internal`] if the manifest or a side file cannot be read
#[instrument(skip_all, fields(path = %path.display(), %mode))]
pub async fn load_transfer_set(
    path: &Path,
    mode: TransferMode,
    offload: OffloadMode,
) -> Result<TransferSet, FilerError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FilerError::not_found("manifest", path.display().to_string()));
        }
        Err(e) => {
            return Err(FilerError::internal(
                "read manifest",
                TransferError::io(path, e),
            ));
        }
    };
    let payloads = parse_manifest_str(&raw)?;

    let inputs = resolve_payload(payloads.inputs, payloads.inputs_ref, offload).await?;
    let outputs = resolve_payload(payloads.outputs, payloads.outputs_ref, offload).await?;

    let set = TransferSet {
        mode,
        inputs: parse_inputs(&inputs)?,
        outputs: parse_outputs(&outputs)?,
    };
    debug!(
        inputs = set.inputs.len(),
        outputs = set.outputs.len(),
        "manifest parsed"
    );
    Ok(set)
}

async fn resolve_payload(
    inline: Option<String>,
    reference: Option<PathBuf>,
    offload: OffloadMode,
) -> Result<String, FilerError> {
    match (reference, offload) {
        (Some(reference), OffloadMode::Volume) => read_offloaded(&reference).await,
        _ => Ok(inline.unwrap_or_default()),
    }
}

/// Reads an offloaded payload; a missing side file means "no entities".
async fn read_offloaded(path: &Path) -> Result<String, FilerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "offloaded payload missing, treating as empty");
            Ok("{}".to_string())
        }
        Err(e) => Err(FilerError::internal(
            "read offloaded payload",
            TransferError::io(path, e),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::FilerErrorKind;

    fn encode(payload: &str) -> String {
        serde_json::to_string(payload).unwrap()
    }

    // ==================== Mode Tests ====================

    #[test]
    fn test_mode_parses_known_values() {
        assert_eq!("inputs".parse::<TransferMode>().unwrap(), TransferMode::Inputs);
        assert_eq!("OUTPUTS".parse::<TransferMode>().unwrap(), TransferMode::Outputs);
        assert_eq!("all".parse::<TransferMode>().unwrap(), TransferMode::All);
    }

    #[test]
    fn test_mode_rejects_unknown() {
        let err = "both".parse::<TransferMode>().unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    #[test]
    fn test_offload_mode_accepts_pvc_alias() {
        assert_eq!("pvc".parse::<OffloadMode>().unwrap(), OffloadMode::Volume);
        assert_eq!("".parse::<OffloadMode>().unwrap(), OffloadMode::Volume);
        assert_eq!("sql".parse::<OffloadMode>().unwrap(), OffloadMode::Sql);
    }

    // ==================== Line Parsing Tests ====================

    #[test]
    fn test_parse_manifest_extracts_all_keys() {
        let raw = format!(
            "task-inputs={}\ntask-outputs-ref={}\nother={}\n",
            encode(r#"{"inputs":[]}"#),
            encode("/offload/out.json"),
            encode("ignored"),
        );
        let payloads = parse_manifest_str(&raw).unwrap();
        assert_eq!(payloads.inputs.as_deref(), Some(r#"{"inputs":[]}"#));
        assert_eq!(payloads.outputs, None);
        assert_eq!(payloads.outputs_ref, Some(PathBuf::from("/offload/out.json")));
    }

    #[test]
    fn test_parse_manifest_rejects_unquoted_value() {
        let err = parse_manifest_str("task-inputs={\"inputs\":[]}").unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    #[test]
    fn test_parse_manifest_rejects_line_without_separator() {
        let err = parse_manifest_str("garbage").unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    #[test]
    fn test_parse_manifest_rejects_oversized_line() {
        let huge = format!("task-inputs={}", encode(&"x".repeat(MAX_LINE_BYTES)));
        let err = parse_manifest_str(&huge).unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    // ==================== Payload Tests ====================

    #[test]
    fn test_parse_inputs_builds_entities_in_order() {
        let payload = r#"{"inputs":[
            {"name":"a","url":"s3://b/a","path":"/w/a","type":"file"},
            {"name":"d","url":"http://h/d","path":"/w/d","type":"Directory"}
        ]}"#;
        let entities = parse_inputs(payload).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "a");
        assert_eq!(entities[1].kind, EntityKind::Directory);
    }

    #[test]
    fn test_parse_inputs_missing_key_is_empty() {
        assert!(parse_inputs("{}").unwrap().is_empty());
        assert!(parse_outputs("").unwrap().is_empty());
    }

    #[test]
    fn test_single_bad_entity_invalidates_batch() {
        let payload = r#"{"outputs":[
            {"url":"s3://b/a","path":"/w/a","type":"file"},
            {"url":"gs://b/a","path":"/w/b","type":"file"}
        ]}"#;
        let err = parse_outputs(payload).unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::InvalidArgument);
    }

    // ==================== Loading Tests ====================

    #[tokio::test]
    async fn test_load_missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_transfer_set(
            &dir.path().join("absent"),
            TransferMode::All,
            OffloadMode::Volume,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FilerErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_load_follows_ref_under_volume_offload() {
        let dir = tempfile::tempdir().unwrap();
        let side = dir.path().join("outputs.json");
        std::fs::write(
            &side,
            r#"{"outputs":[{"url":"s3://b/o","path":"/w/o","type":"file"}]}"#,
        )
        .unwrap();
        let manifest = dir.path().join("annotations");
        std::fs::write(
            &manifest,
            format!("task-outputs-ref={}\n", encode(side.to_str().unwrap())),
        )
        .unwrap();

        let set = load_transfer_set(&manifest, TransferMode::Outputs, OffloadMode::Volume)
            .await
            .unwrap();
        assert_eq!(set.outputs.len(), 1);
        assert!(set.inputs.is_empty());

        let set = load_transfer_set(&manifest, TransferMode::Outputs, OffloadMode::Sql)
            .await
            .unwrap();
        assert!(set.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_ref_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("annotations");
        std::fs::write(
            &manifest,
            format!("task-inputs-ref={}\n", encode("/definitely/not/here.json")),
        )
        .unwrap();

        let set = load_transfer_set(&manifest, TransferMode::Inputs, OffloadMode::Volume)
            .await
            .unwrap();
        assert!(set.inputs.is_empty());
    }
}
