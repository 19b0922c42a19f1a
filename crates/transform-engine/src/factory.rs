//! Turns a request's `TransformConfig` plus the process-wide [`ServicePolicy`]
//! into a ready-to-start [`Pipeline`] (spec §4.3), translated from
//! `ServerPipelineFactory::get` (`serverpipelinefactory.cpp`).

use crate::error::FactoryError;
use crate::gst_pipeline::GstPipeline;
use crate::pipeline::Pipeline;
use crate::policy::{self, PipelineSource, ServicePolicy};
use transform_proto::transform_config::PipelineSource as WirePipelineSource;
use transform_proto::TransformConfig;

/// Builds pipelines from validated requests. Holds only a reference to the
/// immutable, process-wide policy — it has no per-call state of its own.
pub struct PipelineFactory<'a> {
    policy: &'a ServicePolicy,
}

impl<'a> PipelineFactory<'a> {
    pub fn new(policy: &'a ServicePolicy) -> Self {
        Self { policy }
    }

    /// Resolves `config` against policy and constructs a fresh pipeline. The
    /// returned pipeline has not been started; the caller wires callbacks
    /// and calls `start()`.
    pub fn build(
        &self,
        request_id: &str,
        config: &TransformConfig,
    ) -> Result<Box<dyn Pipeline>, FactoryError> {
        let source = match &config.pipeline_source {
            Some(WirePipelineSource::Pipeline(spec)) => PipelineSource::Inline(spec.clone()),
            Some(WirePipelineSource::PipelineName(name)) => PipelineSource::Named(name.clone()),
            None => return Err(FactoryError::NoPipelineSource),
        };

        let wire_params = config.pipeline_parameters.clone().unwrap_or_default();
        let requested_rate_is_default = wire_params.rate == 0.0;
        let mut requested = crate::pipeline::PipelineParameters {
            rate_enforcement: wire_params.rate_enforcement_policy().into(),
            ..Default::default()
        };
        if wire_params.rate != 0.0 {
            requested.rate = wire_params.rate;
        }
        if wire_params.length_limit_milliseconds != 0 {
            requested.length_limit_ms = wire_params.length_limit_milliseconds as u64;
        }
        if wire_params.start_tolerance_bytes != 0 {
            requested.input_buffer_max_bytes = wire_params.start_tolerance_bytes as u64;
        }
        if wire_params.read_timeout_milliseconds != 0 {
            requested.read_timeout_ms = wire_params.read_timeout_milliseconds as u64;
        }

        let validated = policy::validate(
            source,
            config.pipeline_output_buffer as u64,
            requested,
            requested_rate_is_default,
            self.policy,
        )?;

        let spec = match &validated.source {
            PipelineSource::Inline(spec) => spec.clone(),
            PipelineSource::Named(name) => {
                let entry = self
                    .policy
                    .lookup_pipeline(name)
                    .ok_or_else(|| FactoryError::UnknownPipelineName(name.clone()))?;
                entry.specs.clone()
            }
        };

        let pipeline = GstPipeline::create_from_specs(validated.parameters, request_id, &spec)
            .map_err(FactoryError::PipelineConstruction)?;

        Ok(Box::new(pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NamedPipeline;
    use std::collections::HashMap;

    fn policy_with_named(name: &str, specs: &str) -> ServicePolicy {
        let mut pipelines = HashMap::new();
        pipelines.insert(
            name.to_string(),
            NamedPipeline {
                id: name.to_string(),
                specs: specs.to_string(),
            },
        );
        ServicePolicy {
            pipelines,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_config_with_no_pipeline_source() {
        let policy = ServicePolicy::default();
        let factory = PipelineFactory::new(&policy);
        let config = TransformConfig::default();
        let err = factory.build("req-1", &config).unwrap_err();
        assert!(matches!(err, FactoryError::NoPipelineSource));
    }

    #[test]
    fn rejects_unknown_named_pipeline() {
        let policy = ServicePolicy::default();
        let factory = PipelineFactory::new(&policy);
        let config = TransformConfig {
            pipeline_source: Some(WirePipelineSource::PipelineName("nope".into())),
            ..Default::default()
        };
        let err = factory.build("req-1", &config).unwrap_err();
        assert!(matches!(err, FactoryError::UnknownPipelineName(_)));
    }

    #[test]
    fn rejects_inline_when_dynamic_disabled() {
        let mut policy = policy_with_named("echo", "identity");
        policy.allow_dynamic_pipelines = false;
        let factory = PipelineFactory::new(&policy);
        let config = TransformConfig {
            pipeline_source: Some(WirePipelineSource::Pipeline("identity".into())),
            ..Default::default()
        };
        let err = factory.build("req-1", &config).unwrap_err();
        assert!(matches!(err, FactoryError::DynamicPipelinesDisabled));
    }
}
