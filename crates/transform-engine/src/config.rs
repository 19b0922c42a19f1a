//! Loading a [`ServicePolicy`] from the operator-supplied JSON config file
//! (spec §6), translated from `ServiceParams::loadFromJsonStream`
//! (`serviceparams.cpp`). We use serde's derive machinery in place of the
//! original's manual `nlohmann::json` field-by-field walk, but keep the same
//! schema, the same "absent means unlimited" default, and the same refusal
//! to boot with dynamic pipelines disabled and no named pipelines defined.

use crate::policy::{NamedPipeline, ServicePolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LimitsDocument {
    #[serde(default)]
    allow_dynamic_pipelines: Option<bool>,
    #[serde(default)]
    rate: Option<BoundedF64>,
    #[serde(default)]
    length_limit_millis: Option<BoundedU64>,
    #[serde(default)]
    start_tolerance_bytes: Option<BoundedU64>,
    #[serde(default)]
    read_timeout_millis: Option<BoundedU64>,
    #[serde(default)]
    pipeline_output_buffer: Option<BoundedU64>,
}

#[derive(Debug, Deserialize)]
struct BoundedF64 {
    max: f64,
}

#[derive(Debug, Deserialize)]
struct BoundedU64 {
    max: u64,
}

#[derive(Debug, Deserialize)]
struct PipelineDocument {
    id: String,
    specs: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    #[serde(default)]
    limits: LimitsDocument,
    pipelines: Option<Vec<PipelineDocument>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("dynamic pipelines is disabled and no pipelines specified")]
    NoPipelinesAndDynamicDisabled,
}

/// Parses `json` into a [`ServicePolicy`], applying the same "no pipelines
/// array + dynamic pipelines disabled" startup rejection the original
/// enforces.
pub fn load_from_str(json: &str) -> Result<ServicePolicy, ConfigError> {
    let doc: ConfigDocument = serde_json::from_str(json)?;

    let allow_dynamic_pipelines = doc.limits.allow_dynamic_pipelines.unwrap_or(true);

    let pipelines = match doc.pipelines {
        Some(entries) => entries
            .into_iter()
            .map(|entry| {
                (
                    entry.id.clone(),
                    NamedPipeline {
                        id: entry.id,
                        specs: entry.specs,
                    },
                )
            })
            .collect::<HashMap<_, _>>(),
        None if allow_dynamic_pipelines => HashMap::new(),
        None => return Err(ConfigError::NoPipelinesAndDynamicDisabled),
    };

    Ok(ServicePolicy {
        allow_dynamic_pipelines,
        max_rate: doc.limits.rate.map(|b| b.max).unwrap_or(0.0),
        max_length_ms: doc.limits.length_limit_millis.map(|b| b.max).unwrap_or(0),
        max_start_tolerance_bytes: doc
            .limits
            .start_tolerance_bytes
            .map(|b| b.max)
            .unwrap_or(0),
        max_read_timeout_ms: doc.limits.read_timeout_millis.map(|b| b.max).unwrap_or(0),
        max_pipeline_output_buffer: doc
            .limits
            .pipeline_output_buffer
            .map(|b| b.max)
            .unwrap_or(0),
        pipelines,
    })
}

/// Reads and parses the config file at `path`.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<ServicePolicy, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_from_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_limits_and_pipelines() {
        let json = r#"{
            "limits": {
                "allowDynamicPipelines": false,
                "rate": { "max": 4.0 },
                "lengthLimitMillis": { "max": 60000 },
                "readTimeoutMillis": { "max": 30000 }
            },
            "pipelines": [
                { "id": "reencode", "specs": "videotestsrc ! x264enc ! fakesink" }
            ]
        }"#;
        let policy = load_from_str(json).unwrap();
        assert!(!policy.allow_dynamic_pipelines);
        assert_eq!(policy.max_rate, 4.0);
        assert_eq!(policy.max_length_ms, 60_000);
        assert_eq!(policy.max_read_timeout_ms, 30_000);
        assert_eq!(policy.max_start_tolerance_bytes, 0);
        assert_eq!(
            policy.lookup_pipeline("reencode").unwrap().specs,
            "videotestsrc ! x264enc ! fakesink"
        );
    }

    #[test]
    fn defaults_to_dynamic_pipelines_allowed_when_absent() {
        let policy = load_from_str("{}").unwrap();
        assert!(policy.allow_dynamic_pipelines);
        assert_eq!(policy.max_rate, 0.0);
        assert!(policy.pipelines.is_empty());
    }

    #[test]
    fn rejects_dynamic_disabled_with_no_pipelines() {
        let json = r#"{ "limits": { "allowDynamicPipelines": false } }"#;
        let err = load_from_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::NoPipelinesAndDynamicDisabled));
    }

    #[test]
    fn allows_dynamic_disabled_when_pipelines_defined_even_if_empty_array() {
        let json = r#"{
            "limits": { "allowDynamicPipelines": false },
            "pipelines": []
        }"#;
        let policy = load_from_str(json).unwrap();
        assert!(policy.pipelines.is_empty());
        assert!(!policy.allow_dynamic_pipelines);
    }

    #[test]
    fn load_from_file_reads_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"limits": {"rate": {"max": 2.0}}}"#).unwrap();
        let policy = load_from_file(&path).unwrap();
        assert_eq!(policy.max_rate, 2.0);
    }

    #[test]
    fn load_from_file_missing_path_errors() {
        let err = load_from_file("/nonexistent/path/policy.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
