//! `GstPipeline`: the concrete [`Pipeline`] backed by a real GStreamer graph.
//!
//! Translated from `DynamicPipeline` (`dynamicpipeline.h`/`.cpp`), with one
//! deliberate redesign named in the distilled spec's own REDESIGN FLAGS: the
//! appsrc is wired `block=false` with `need-data`/`enough-data` signals
//! driving backpressure, rather than the blocking-push variant the original
//! also contains. Bus handling, the new-sample duration check, the rate step
//! event, and the sync-vs-passthrough sink property all follow the original
//! line for line.
//!
//! GStreamer's bus watch and idle sources are only ever dispatched while
//! something iterates the `glib::MainContext` they were attached to — they
//! are not driven by the streaming threads the way `AppSrc`/`AppSink`
//! signals are. The original gave each pipeline its own `GRunLoop`, a
//! `GMainLoop` pinned to a dedicated OS thread (`grunloop.cpp`); we translate
//! that directly instead of assuming some other part of the process happens
//! to run one. Each `GstPipeline` spawns its own context/loop/thread in
//! `start()` and tears it down in `Drop`, so pipelines stay independent of
//! each other and of whatever async runtime is hosting the call.

use crate::pipeline::{
    AddDataOutcome, Pipeline, PipelineCallbacks, PipelineParameters, RateEnforcement,
    TerminationReason,
};
use bytes::Bytes;
use gst::glib;
use gst::prelude::*;
use gst_app::{AppSink, AppSinkCallbacks, AppSrc, AppSrcCallbacks};
use gstreamer as gst;
use gstreamer_app as gst_app;
use std::sync::{Arc, Mutex, Once};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error};

const SOURCE_NAME: &str = "psource";
const SINK_NAME: &str = "psink";
const READ_TIMEOUT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

static GST_INIT: Once = Once::new();

fn ensure_gst_initialized() {
    GST_INIT.call_once(|| gst::init().expect("GStreamer failed to initialize"));
}

struct Shared {
    termination_reason: TerminationReason,
    termination_message: String,
    processed_input_bytes: u64,
    processed_output_bytes: u64,
    processed_stream_time_ns: i64,
    last_read_at: Instant,
    done: bool,
}

impl Shared {
    fn fresh() -> Self {
        Self {
            termination_reason: TerminationReason::None,
            termination_message: String::new(),
            processed_input_bytes: 0,
            processed_output_bytes: 0,
            processed_stream_time_ns: 0,
            last_read_at: Instant::now(),
            done: false,
        }
    }
}

/// Everything the GStreamer callback threads need, shared with the
/// `GstPipeline` handle the engine holds. Kept behind `Arc` so a callback
/// fired after the handle itself has started tearing down still has
/// somewhere to record its outcome.
struct Inner {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    parameters: PipelineParameters,
    request_id: String,
    shared: Mutex<Shared>,
    done_notify: Notify,
    callbacks: Mutex<Option<Arc<dyn PipelineCallbacks>>>,
    /// This pipeline's own bus-watch context: `bus.add_watch` dispatches on
    /// whichever `MainContext` was thread-default when it was called, so the
    /// watch is attached from inside the dedicated loop thread rather than
    /// from whatever thread calls `start()`.
    main_context: glib::MainContext,
    /// Cloneable handle; `quit()`/`MainContext::invoke` are safe to call from
    /// any thread, so `terminate()` and `Drop` reach the loop through this
    /// without needing to be on its thread.
    main_loop: glib::MainLoop,
}

impl Inner {
    fn callbacks(&self) -> Option<Arc<dyn PipelineCallbacks>> {
        self.callbacks.lock().unwrap().clone()
    }

    /// Records the first termination reason seen (subsequent calls don't
    /// overwrite it) and either drains gracefully (EOS into the source) or
    /// schedules an immediate NULL-state transition on the bus loop's
    /// context, mirroring `DynamicPipeline::terminatePipeline`.
    fn terminate(self: &Arc<Self>, reason: TerminationReason, message: impl Into<String>, force: bool) {
        let message = message.into();
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.termination_reason == TerminationReason::None {
                debug!(request_id = %self.request_id, ?reason, %message, force, "terminating pipeline");
                shared.termination_reason = reason;
                shared.termination_message = message;
            }
        }

        if force {
            let inner = self.clone();
            self.main_context.invoke(move || {
                let _ = inner.pipeline.set_state(gst::State::Null);
                inner.shared.lock().unwrap().done = true;
                inner.done_notify.notify_waiters();
                inner.main_loop.quit();
            });
        } else {
            let _ = self.appsrc.end_of_stream();
        }

        if let Some(callbacks) = self.callbacks() {
            callbacks.on_terminated(force);
        }
    }
}

/// A single-use GStreamer-backed pipeline built from a gst-launch spec
/// string (`appsrc name=psource ! <spec> ! appsink name=psink`).
pub struct GstPipeline {
    inner: Arc<Inner>,
    loop_thread: Option<std::thread::JoinHandle<()>>,
    read_timeout_task: Option<tokio::task::JoinHandle<()>>,
}

impl GstPipeline {
    /// Parses `specs` into a pipeline wrapped with an appsrc/appsink pair,
    /// mirroring `DynamicPipeline::createFromSpecs`.
    pub fn create_from_specs(
        parameters: PipelineParameters,
        request_id: &str,
        specs: &str,
    ) -> anyhow::Result<Self> {
        ensure_gst_initialized();

        let description = format!("appsrc name={SOURCE_NAME} ! {specs} ! appsink name={SINK_NAME}");
        debug!(request_id, spec = %description, ?parameters, "building pipeline");

        let element = gst::parse::launch(&description)
            .map_err(|err| anyhow::anyhow!("could not create pipeline {request_id}: {err}"))?;
        let pipeline = element.downcast::<gst::Pipeline>().map_err(|_| {
            anyhow::anyhow!("parsed graph for {request_id} is not a top-level pipeline")
        })?;

        let appsrc = pipeline
            .by_name(SOURCE_NAME)
            .ok_or_else(|| anyhow::anyhow!("unable to obtain source element for {request_id}"))?
            .downcast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("{SOURCE_NAME} element is not an appsrc"))?;

        let appsink = pipeline
            .by_name(SINK_NAME)
            .ok_or_else(|| anyhow::anyhow!("unable to obtain sink element for {request_id}"))?
            .downcast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("{SINK_NAME} element is not an appsink"))?;

        if parameters.input_buffer_max_bytes > 0 {
            appsrc.set_max_bytes(parameters.input_buffer_max_bytes);
        }
        // Event-driven variant (REDESIGN FLAGS): backpressure rides
        // need-data/enough-data signals rather than a blocking push.
        appsrc.set_property("block", false);
        appsrc.set_format(gst::Format::Bytes);

        appsink.set_property("emit-signals", true);
        appsink.set_property("sync", !parameters.is_passthrough());

        let main_context = glib::MainContext::new();
        let main_loop = glib::MainLoop::new(Some(&main_context), false);

        Ok(Self {
            inner: Arc::new(Inner {
                pipeline,
                appsrc,
                appsink,
                parameters,
                request_id: request_id.to_string(),
                shared: Mutex::new(Shared::fresh()),
                done_notify: Notify::new(),
                callbacks: Mutex::new(None),
                main_context,
                main_loop,
            }),
            loop_thread: None,
            read_timeout_task: None,
        })
    }
}

#[async_trait::async_trait]
impl Pipeline for GstPipeline {
    fn set_callbacks(&mut self, callbacks: Arc<dyn PipelineCallbacks>) {
        *self.inner.callbacks.lock().unwrap() = Some(callbacks);
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.inner.callbacks().is_none() {
            anyhow::bail!("set_callbacks must be called before start");
        }

        let need_data_inner = self.inner.clone();
        let enough_data_inner = self.inner.clone();
        self.inner.appsrc.set_callbacks(
            AppSrcCallbacks::builder()
                .need_data(move |_appsrc, _length| {
                    if let Some(callbacks) = need_data_inner.callbacks() {
                        callbacks.on_need_data();
                    }
                })
                .enough_data(move |_appsrc| {
                    let params = &enough_data_inner.parameters;
                    if params.rate_enforcement == RateEnforcement::Error && params.rate > 0.0 {
                        enough_data_inner.terminate(
                            TerminationReason::RateExceeded,
                            format!("rate exceeded: {}rt", params.rate),
                            true,
                        );
                    } else if let Some(callbacks) = enough_data_inner.callbacks() {
                        callbacks.on_enough_data();
                    }
                })
                .build(),
        );

        let sample_inner = self.inner.clone();
        self.inner.appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |_appsink| {
                    if let Some(callbacks) = sample_inner.callbacks() {
                        callbacks.on_sample_available();
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        // `bus.add_watch` attaches to whatever `MainContext` is thread-default
        // on the calling thread, so the watch has to be created from inside
        // the dedicated loop thread, after it pushes its own context as
        // thread-default — not from here. The thread then blocks in
        // `main_loop.run()` until `terminate()`/`Drop` calls `quit()`.
        let bus = self
            .inner
            .pipeline
            .bus()
            .ok_or_else(|| anyhow::anyhow!("pipeline has no bus"))?;
        let bus_inner = self.inner.clone();
        let loop_context = self.inner.main_context.clone();
        let main_loop = self.inner.main_loop.clone();
        let request_id = self.inner.request_id.clone();
        self.loop_thread = Some(
            std::thread::Builder::new()
                .name(format!("gst-bus-{request_id}"))
                .spawn(move || {
                    loop_context.push_thread_default();
                    let watch_main_loop = main_loop.clone();
                    let _watch = bus
                        .add_watch(move |_bus, message| {
                            use gst::MessageView;
                            match message.view() {
                                MessageView::Error(err) => {
                                    error!(
                                        request_id = %bus_inner.request_id,
                                        error = %err.error(),
                                        debug = ?err.debug(),
                                        "pipeline reported an error"
                                    );
                                    bus_inner.terminate(
                                        TerminationReason::InternalError,
                                        err.error().to_string(),
                                        true,
                                    );
                                }
                                MessageView::Eos(_) => {
                                    debug!(
                                        request_id = %bus_inner.request_id,
                                        "pipeline reached end of stream"
                                    );
                                    bus_inner.shared.lock().unwrap().done = true;
                                    bus_inner.done_notify.notify_waiters();
                                    if let Some(callbacks) = bus_inner.callbacks() {
                                        callbacks.on_eos();
                                    }
                                    watch_main_loop.quit();
                                }
                                _ => {}
                            }
                            glib::ControlFlow::Continue
                        })
                        .expect("failed to attach bus watch");
                    main_loop.run();
                    loop_context.pop_thread_default();
                })
                .expect("failed to spawn bus watch thread"),
        );

        self.inner.shared.lock().unwrap().last_read_at = Instant::now();
        self.inner.pipeline.set_state(gst::State::Playing)?;

        if self.inner.parameters.rate > 0.0 {
            let step = gst::event::Step::new(
                gst::format::Percent::from_percent(100),
                self.inner.parameters.rate,
                false,
                false,
            );
            let _ = self.inner.appsink.send_event(step);
        }

        if let Some(timeout) = self.inner.parameters.read_timeout() {
            let timer_inner = self.inner.clone();
            let read_timeout_ms = self.inner.parameters.read_timeout_ms;
            self.read_timeout_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(READ_TIMEOUT_POLL_INTERVAL);
                loop {
                    ticker.tick().await;
                    let expired = {
                        let shared = timer_inner.shared.lock().unwrap();
                        if shared.done || shared.termination_reason != TerminationReason::None {
                            break;
                        }
                        shared.last_read_at.elapsed() > timeout
                    };
                    if expired {
                        timer_inner.terminate(
                            TerminationReason::ReadTimeout,
                            format!("read timeout of {read_timeout_ms}ms exceeded"),
                            false,
                        );
                        break;
                    }
                }
            }));
        }

        Ok(())
    }

    fn add_data(&mut self, buffer: &[u8]) -> AddDataOutcome {
        if let Some(timeout) = self.inner.parameters.read_timeout() {
            let elapsed = self.inner.shared.lock().unwrap().last_read_at.elapsed();
            if elapsed > timeout {
                self.inner.terminate(
                    TerminationReason::ReadTimeout,
                    format!(
                        "read timeout of {}ms exceeded",
                        self.inner.parameters.read_timeout_ms
                    ),
                    false,
                );
                return AddDataOutcome::Draining;
            }
        }

        let mut gst_buffer = match gst::Buffer::with_size(buffer.len()) {
            Ok(buffer) => buffer,
            Err(_) => {
                self.inner
                    .terminate(TerminationReason::InternalError, "buffer allocation failed", true);
                return AddDataOutcome::Error;
            }
        };
        {
            let buffer_ref = gst_buffer.get_mut().expect("buffer is exclusively owned");
            let mut map = buffer_ref
                .map_writable()
                .expect("freshly allocated buffer is mappable");
            map.copy_from_slice(buffer);
        }

        match self.inner.appsrc.push_buffer(gst_buffer) {
            Ok(_) => {
                let mut shared = self.inner.shared.lock().unwrap();
                shared.processed_input_bytes += buffer.len() as u64;
                shared.last_read_at = Instant::now();
                AddDataOutcome::Accepted(buffer.len())
            }
            Err(gst::FlowError::Eos) | Err(gst::FlowError::Flushing) => AddDataOutcome::Draining,
            Err(_) => {
                self.inner
                    .terminate(TerminationReason::InternalError, "appsrc push_buffer failed", true);
                AddDataOutcome::Error
            }
        }
    }

    fn end_data(&mut self) {
        let already_terminating =
            self.inner.shared.lock().unwrap().termination_reason != TerminationReason::None;
        if !already_terminating {
            self.inner.terminate(TerminationReason::EndOfStream, "end of stream", false);
        }
    }

    fn stop(&mut self) {
        self.inner.terminate(TerminationReason::Cancelled, "cancelled", true);
    }

    fn pull_samples(&mut self, count: usize) -> Vec<Bytes> {
        let mut out = Vec::with_capacity(count);
        let mut duration_exceeded = None;

        for _ in 0..count {
            let Some(sample) = self.inner.appsink.try_pull_sample(gst::ClockTime::ZERO) else {
                break;
            };
            let Some(buffer) = sample.buffer() else {
                continue;
            };
            let Ok(map) = buffer.map_readable() else {
                continue;
            };
            let bytes = Bytes::copy_from_slice(map.as_slice());
            drop(map);

            let mut shared = self.inner.shared.lock().unwrap();
            shared.processed_output_bytes += bytes.len() as u64;

            if let Some(position) = self.inner.pipeline.query_position::<gst::ClockTime>() {
                let position_ns = position.nseconds() as i64;
                if position_ns > shared.processed_stream_time_ns {
                    shared.processed_stream_time_ns = position_ns;
                }
            }

            let length_limit_ms = self.inner.parameters.length_limit_ms;
            if length_limit_ms > 0 {
                let length_limit_ns = (length_limit_ms as i64).saturating_mul(1_000_000);
                if shared.processed_stream_time_ns >= length_limit_ns {
                    duration_exceeded = Some(length_limit_ms);
                }
            }
            drop(shared);

            out.push(bytes);
            if duration_exceeded.is_some() {
                break;
            }
        }

        if let Some(length_limit_ms) = duration_exceeded {
            self.inner.terminate(
                TerminationReason::AllowedDurationExceeded,
                format!("max duration exceeded: {length_limit_ms}ms"),
                false,
            );
        }

        out
    }

    async fn wait_until_completed(&mut self) {
        loop {
            let notified = self.inner.done_notify.notified();
            if self.inner.shared.lock().unwrap().done {
                return;
            }
            notified.await;
        }
    }

    fn termination_reason(&self) -> TerminationReason {
        self.inner.shared.lock().unwrap().termination_reason
    }

    fn termination_message(&self) -> String {
        self.inner.shared.lock().unwrap().termination_message.clone()
    }

    fn processed_input_bytes(&self) -> u64 {
        self.inner.shared.lock().unwrap().processed_input_bytes
    }

    fn processed_output_bytes(&self) -> u64 {
        self.inner.shared.lock().unwrap().processed_output_bytes
    }

    fn processed_stream_time(&self) -> f64 {
        self.inner.shared.lock().unwrap().processed_stream_time_ns as f64 / 1_000_000_000.0
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        if let Some(task) = self.read_timeout_task.take() {
            task.abort();
        }
        let _ = self.inner.pipeline.set_state(gst::State::Null);
        // Safe even if the loop already quit itself (e.g. on Eos/Error) or
        // was never started (`quit()` on a non-running `MainLoop` is a
        // no-op; `join()` on a thread that already exited returns at once).
        self.inner.main_loop.quit();
        if let Some(thread) = self.loop_thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparsable_spec() {
        ensure_gst_initialized();
        let err = GstPipeline::create_from_specs(
            PipelineParameters::default(),
            "req-1",
            "not a real gst element !!!",
        )
        .unwrap_err();
        assert!(err.to_string().contains("req-1"));
    }

    #[test]
    fn builds_from_identity_spec() {
        ensure_gst_initialized();
        let pipeline =
            GstPipeline::create_from_specs(PipelineParameters::default(), "req-2", "identity");
        assert!(pipeline.is_ok());
    }
}
