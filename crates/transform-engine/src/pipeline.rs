//! The `Pipeline` abstraction consumed by `CallSession` (spec §4.4).
//!
//! This mirrors `Pipeline`/`DynamicPipeline` from the original C++
//! (`pipeline.h`, `dynamicpipeline.h`): a single-use, single-source,
//! single-sink media graph that is pushed bytes and pulls samples back out,
//! signalling backpressure and termination via callbacks rather than
//! blocking calls.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Reasons a pipeline can stop, exhaustively enumerated per spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    None,
    InternalError,
    EndOfStream,
    FormatNotDetected,
    AllowedDurationExceeded,
    RateExceeded,
    ReadTimeout,
    StreamStartTimeout,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::None => "none",
            TerminationReason::InternalError => "internal error",
            TerminationReason::EndOfStream => "end of stream",
            TerminationReason::FormatNotDetected => "format not detected",
            TerminationReason::AllowedDurationExceeded => "allowed duration exceeded",
            TerminationReason::RateExceeded => "rate exceeded",
            TerminationReason::ReadTimeout => "read timeout",
            TerminationReason::StreamStartTimeout => "stream start timeout",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl From<TerminationReason> for transform_proto::TerminationReason {
    fn from(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::None => transform_proto::TerminationReason::None,
            TerminationReason::InternalError => transform_proto::TerminationReason::InternalError,
            TerminationReason::EndOfStream => transform_proto::TerminationReason::EndOfStream,
            TerminationReason::FormatNotDetected => {
                transform_proto::TerminationReason::FormatNotDetected
            }
            TerminationReason::AllowedDurationExceeded => {
                transform_proto::TerminationReason::AllowedDurationExceeded
            }
            TerminationReason::RateExceeded => transform_proto::TerminationReason::RateExceeded,
            TerminationReason::ReadTimeout => transform_proto::TerminationReason::ReadTimeout,
            TerminationReason::StreamStartTimeout => {
                transform_proto::TerminationReason::StreamStartTimeout
            }
            TerminationReason::Cancelled => transform_proto::TerminationReason::Cancelled,
        }
    }
}

/// How the pipeline should react to sustained backpressure (`enough-data`
/// while still under load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateEnforcement {
    Block,
    Error,
}

impl From<transform_proto::RateEnforcementPolicy> for RateEnforcement {
    fn from(policy: transform_proto::RateEnforcementPolicy) -> Self {
        match policy {
            transform_proto::RateEnforcementPolicy::Block => RateEnforcement::Block,
            transform_proto::RateEnforcementPolicy::Error => RateEnforcement::Error,
        }
    }
}

/// Immutable parameters that govern a single pipeline instance (spec §3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineParameters {
    /// Real-time multiplier. `> 0` is a multiplier, `-1` means passthrough
    /// (no clock sync), `0` is invalid and rejected during validation.
    pub rate: f64,
    /// 0 means unlimited.
    pub length_limit_ms: u64,
    /// 0 means framework default.
    pub input_buffer_max_bytes: u64,
    /// 0 means disabled.
    pub read_timeout_ms: u64,
    pub rate_enforcement: RateEnforcement,
}

impl Default for PipelineParameters {
    fn default() -> Self {
        // Mirrors PipelineParameters' C++ constructor defaults.
        Self {
            rate: 1.0,
            length_limit_ms: 0,
            input_buffer_max_bytes: 0,
            read_timeout_ms: 0,
            rate_enforcement: RateEnforcement::Block,
        }
    }
}

impl PipelineParameters {
    pub fn is_passthrough(&self) -> bool {
        self.rate <= 0.0
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

/// Outcome of pushing a buffer into the pipeline's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddDataOutcome {
    /// Bytes accepted; carries the byte count pushed.
    Accepted(usize),
    /// The source is draining (EOS or FLUSHING) — not an error, no reason
    /// change.
    Draining,
    /// An unrecoverable flow error; the pipeline's termination reason has
    /// been set to `InternalError` (unless read-timeout already claimed it).
    Error,
}

/// Callbacks the pipeline invokes as it makes progress. All four are called
/// from whatever thread GStreamer chooses to run signal/bus handlers on;
/// implementations must only `post` onto an event loop and return, never
/// block or touch session state directly (spec §4.1, §5).
pub trait PipelineCallbacks: Send + Sync + 'static {
    fn on_need_data(&self);
    fn on_enough_data(&self);
    fn on_sample_available(&self);
    fn on_eos(&self);
    /// `force` distinguishes a graceful EOS-drain shutdown from an immediate
    /// NULL-state transition.
    fn on_terminated(&self, force: bool);
}

/// A single-use media graph: constructed once, started once, consumed by
/// exactly one call (spec §3 "single-use guarantee").
#[async_trait::async_trait]
pub trait Pipeline: Send {
    /// Attach the session's callbacks. Must be called before `start`.
    fn set_callbacks(&mut self, callbacks: Arc<dyn PipelineCallbacks>);

    /// Enter the playing state and begin producing/consuming data.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Push a buffer into the source. Returns `Error` only for failures that
    /// are not part of a graceful shutdown already in progress.
    fn add_data(&mut self, buffer: &[u8]) -> AddDataOutcome;

    /// Idempotent: mark the input exhausted and let the graph drain.
    fn end_data(&mut self);

    /// Force an immediate stop, as on transport cancel.
    fn stop(&mut self);

    /// Drain up to `count` buffered samples from the sink.
    fn pull_samples(&mut self, count: usize) -> Vec<Bytes>;

    /// Resolves once the graph has fully stopped (EOS observed or forced
    /// NULL-state transition completed).
    async fn wait_until_completed(&mut self);

    fn termination_reason(&self) -> TerminationReason;
    fn termination_message(&self) -> String;
    fn processed_input_bytes(&self) -> u64;
    fn processed_output_bytes(&self) -> u64;
    fn processed_stream_time(&self) -> f64;
}
