//! Process-wide service policy: the limits and named pipelines an operator
//! configures at boot (spec §6), translated from `ServiceParams`/
//! `validateConfig` in the original (`serviceparams.cpp`,
//! `asynctransformimpl.cpp`).
//!
//! A `max*` of `0` means "no limit" throughout, matching the C++ convention
//! of treating an absent/zero JSON field as unrestricted. `max_rate` also
//! treats `-1` as unrestricted since `-1` is itself a valid passthrough rate
//! and can't double as a sentinel there.

use crate::error::FactoryError;
use std::collections::HashMap;

/// A named, operator-defined pipeline a client can reference instead of
/// sending its own gst-launch spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPipeline {
    pub id: String,
    pub specs: String,
}

/// Immutable, process-wide limits loaded once at startup and shared by every
/// request thereafter (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub struct ServicePolicy {
    pub allow_dynamic_pipelines: bool,
    pub max_rate: f64,
    pub max_length_ms: u64,
    pub max_start_tolerance_bytes: u64,
    pub max_read_timeout_ms: u64,
    pub max_pipeline_output_buffer: u64,
    pub pipelines: HashMap<String, NamedPipeline>,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            allow_dynamic_pipelines: true,
            max_rate: 0.0,
            max_length_ms: 0,
            max_start_tolerance_bytes: 0,
            max_read_timeout_ms: 0,
            max_pipeline_output_buffer: 0,
            pipelines: HashMap::new(),
        }
    }
}

impl ServicePolicy {
    pub fn lookup_pipeline(&self, name: &str) -> Option<&NamedPipeline> {
        self.pipelines.get(name)
    }
}

/// The pipeline-source half of a request's config, resolved and validated
/// against policy: either inline gst-launch specs or a named lookup, never
/// both.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSource {
    Inline(String),
    Named(String),
}

/// Config values after policy validation and clamping, ready to hand to the
/// pipeline factory. Distinct from the wire `TransformConfig` so that
/// clamping can't be silently skipped by a caller that forgot to validate.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub source: PipelineSource,
    pub pipeline_output_buffer: u64,
    pub parameters: crate::pipeline::PipelineParameters,
}

/// Validates a request's pipeline source and parameters against `policy`.
/// For `length_limit_ms`, `input_buffer_max_bytes`, and `read_timeout_ms`, a
/// request that exceeds a configured ceiling is rejected, an unset (`0`)
/// request is clamped *up* to the ceiling, and any smaller explicit request
/// is left untouched. Rate and dynamic-pipeline use have no such clamp-up:
/// they are rejected outright when they exceed policy.
///
/// Mirrors `AsyncTransformImpl::validateConfig` field-by-field, including its
/// order, since later checks can depend on the clamped value of earlier ones
/// in principle (they don't currently, but the order is preserved for
/// fidelity and so future fields can assume it).
pub fn validate(
    source: PipelineSource,
    pipeline_output_buffer: u64,
    requested: crate::pipeline::PipelineParameters,
    requested_rate_is_default: bool,
    policy: &ServicePolicy,
) -> Result<ValidatedConfig, FactoryError> {
    if let PipelineSource::Inline(_) = &source {
        if !policy.allow_dynamic_pipelines {
            return Err(FactoryError::DynamicPipelinesDisabled);
        }
    }

    let mut params = requested;

    if !requested_rate_is_default && policy.max_rate != 0.0 && policy.max_rate != -1.0 {
        if params.rate > policy.max_rate || params.rate == -1.0 {
            return Err(FactoryError::RateExceedsMax {
                requested: params.rate,
                max: policy.max_rate,
            });
        }
    }

    if policy.max_length_ms != 0 {
        if params.length_limit_ms > policy.max_length_ms {
            return Err(FactoryError::LengthLimitExceedsMax {
                requested: params.length_limit_ms,
                max: policy.max_length_ms,
            });
        }
        if params.length_limit_ms == 0 {
            params.length_limit_ms = policy.max_length_ms;
        }
    }

    if policy.max_start_tolerance_bytes != 0 {
        if params.input_buffer_max_bytes > policy.max_start_tolerance_bytes {
            return Err(FactoryError::StartToleranceExceedsMax {
                requested: params.input_buffer_max_bytes,
                max: policy.max_start_tolerance_bytes,
            });
        }
        if params.input_buffer_max_bytes == 0 {
            params.input_buffer_max_bytes = policy.max_start_tolerance_bytes;
        }
    }

    if policy.max_read_timeout_ms != 0 {
        if params.read_timeout_ms > policy.max_read_timeout_ms {
            return Err(FactoryError::ReadTimeoutExceedsMax {
                requested: params.read_timeout_ms,
                max: policy.max_read_timeout_ms,
            });
        }
        if params.read_timeout_ms == 0 {
            params.read_timeout_ms = policy.max_read_timeout_ms;
        }
    }

    if policy.max_pipeline_output_buffer != 0 && pipeline_output_buffer > policy.max_pipeline_output_buffer
    {
        return Err(FactoryError::OutputBufferExceedsMax {
            requested: pipeline_output_buffer,
            max: policy.max_pipeline_output_buffer,
        });
    }

    Ok(ValidatedConfig {
        source,
        pipeline_output_buffer,
        parameters: params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineParameters, RateEnforcement};

    fn policy_with_limits() -> ServicePolicy {
        ServicePolicy {
            allow_dynamic_pipelines: true,
            max_rate: 2.0,
            max_length_ms: 5_000,
            max_start_tolerance_bytes: 1_024,
            max_read_timeout_ms: 10_000,
            max_pipeline_output_buffer: 16,
            pipelines: HashMap::new(),
        }
    }

    #[test]
    fn keeps_smaller_requested_length_limit() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            length_limit_ms: 1_000,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.length_limit_ms, 1_000);
    }

    #[test]
    fn clamps_unset_length_limit_up_to_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            length_limit_ms: 0,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.length_limit_ms, 5_000);
    }

    #[test]
    fn rejects_length_limit_exceeding_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            length_limit_ms: 50_000,
            ..Default::default()
        };
        let err = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::LengthLimitExceedsMax { .. }));
    }

    #[test]
    fn keeps_smaller_requested_start_tolerance() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            input_buffer_max_bytes: 256,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.input_buffer_max_bytes, 256);
    }

    #[test]
    fn clamps_unset_start_tolerance_up_to_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            input_buffer_max_bytes: 0,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.input_buffer_max_bytes, 1_024);
    }

    #[test]
    fn keeps_smaller_requested_read_timeout() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            read_timeout_ms: 2_000,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.read_timeout_ms, 2_000);
    }

    #[test]
    fn clamps_unset_read_timeout_up_to_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            read_timeout_ms: 0,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.read_timeout_ms, 10_000);
    }

    #[test]
    fn rejects_explicit_rate_exceeding_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            rate: 4.0,
            ..Default::default()
        };
        let err = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            false,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::RateExceedsMax { .. }));
    }

    #[test]
    fn rejects_passthrough_rate_when_capped() {
        let policy = policy_with_limits();
        let params = PipelineParameters {
            rate: -1.0,
            rate_enforcement: RateEnforcement::Block,
            ..Default::default()
        };
        let err = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            false,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::RateExceedsMax { .. }));
    }

    #[test]
    fn default_rate_is_not_checked_against_max() {
        let policy = policy_with_limits();
        let params = PipelineParameters::default();
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            params,
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.rate, 1.0);
    }

    #[test]
    fn rejects_dynamic_pipeline_when_disabled() {
        let mut policy = policy_with_limits();
        policy.allow_dynamic_pipelines = false;
        let err = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            4,
            PipelineParameters::default(),
            true,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::DynamicPipelinesDisabled));
    }

    #[test]
    fn named_pipeline_bypasses_dynamic_pipeline_check() {
        let mut policy = policy_with_limits();
        policy.allow_dynamic_pipelines = false;
        let validated = validate(
            PipelineSource::Named("reencode".into()),
            4,
            PipelineParameters::default(),
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.source, PipelineSource::Named("reencode".into()));
    }

    #[test]
    fn rejects_output_buffer_exceeding_max() {
        let policy = policy_with_limits();
        let err = validate(
            PipelineSource::Named("reencode".into()),
            64,
            PipelineParameters::default(),
            true,
            &policy,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::OutputBufferExceedsMax { .. }));
    }

    #[test]
    fn unlimited_policy_passes_everything_through_unclamped() {
        let policy = ServicePolicy::default();
        let params = PipelineParameters {
            rate: 8.0,
            length_limit_ms: 999_999,
            ..Default::default()
        };
        let validated = validate(
            PipelineSource::Inline("videotestsrc ! fakesink".into()),
            0,
            params,
            false,
            &policy,
        )
        .unwrap();
        assert_eq!(validated.parameters.length_limit_ms, 999_999);
        assert_eq!(validated.parameters.rate, 8.0);
    }
}
