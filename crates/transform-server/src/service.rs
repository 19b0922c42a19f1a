//! The tonic `Transformer` service implementation: Stage 0/1 of spec §4.6
//! (accept, extract request id, read config, validate, build pipeline), then
//! handoff to [`transform_engine::CallSession`] for Stage 2/3. Translated
//! from `ServiceImpl::Transform` (`serviceimpl.cpp`), with the manual
//! completion-queue read/write loop replaced by tonic's native streaming
//! API — see `call_session.rs`'s module doc for why that collapses the
//! session's own event-loop bookkeeping.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info_span, Instrument};
use transform_engine::{CallSession, FactoryError, PipelineFactory, ServicePolicy};
use transform_proto::transformer_server::Transformer;
use transform_proto::{
    transform_request, TransformConsumerResponse, TransformProducerRequest, TransformRequest,
    TransformResponse,
};

const REQUEST_ID_METADATA_KEY: &str = "requestid";

type ResponseStream = Pin<Box<dyn Stream<Item = Result<TransformResponse, Status>> + Send>>;

/// Implements the `gst_transformer.v1.Transformer` service against a single,
/// process-wide, read-only [`ServicePolicy`] (spec §5 "Shared resources").
pub struct TransformerService {
    policy: Arc<ServicePolicy>,
}

impl TransformerService {
    pub fn new(policy: Arc<ServicePolicy>) -> Self {
        Self { policy }
    }
}

fn extract_request_id<T>(request: &Request<T>) -> Result<String, Status> {
    let value = request
        .metadata()
        .get(REQUEST_ID_METADATA_KEY)
        .ok_or_else(|| Status::from(&FactoryError::MissingRequestId))?;
    let request_id = value
        .to_str()
        .map_err(|_| Status::from(&FactoryError::MissingRequestId))?;
    if request_id.is_empty() {
        return Err(Status::from(&FactoryError::MissingRequestId));
    }
    Ok(request_id.to_string())
}

#[tonic::async_trait]
impl Transformer for TransformerService {
    type TransformStream = ResponseStream;

    async fn transform(
        &self,
        request: Request<Streaming<TransformRequest>>,
    ) -> Result<Response<Self::TransformStream>, Status> {
        let request_id = extract_request_id(&request)?;
        let span = info_span!("transform", request_id = %request_id);

        async move {
            let mut inbound = request.into_inner();

            let config = match inbound.message().await? {
                Some(TransformRequest {
                    request: Some(transform_request::Request::Config(config)),
                }) => config,
                Some(_) => return Err(Status::from(&FactoryError::MissingConfig)),
                None => return Err(Status::from(&FactoryError::MissingConfig)),
            };
            debug!("received config, validating against service policy");

            let pipeline_output_buffer = config.pipeline_output_buffer as u64;
            let pipeline = PipelineFactory::new(&self.policy)
                .build(&request_id, &config)
                .map_err(Status::from)?;

            let (response_tx, response_rx) = mpsc::unbounded_channel();
            let session =
                CallSession::new(request_id, pipeline_output_buffer, pipeline, response_tx);

            tokio::spawn(session.run(inbound));

            let stream: Self::TransformStream =
                Box::pin(UnboundedReceiverStream::new(response_rx));
            Ok(Response::new(stream))
        }
        .instrument(span)
        .await
    }

    type TransformProducerStream = ResponseStream;

    async fn transform_producer(
        &self,
        _request: Request<TransformProducerRequest>,
    ) -> Result<Response<Self::TransformProducerStream>, Status> {
        Err(Status::unimplemented("TransformProducer is not implemented"))
    }

    async fn transform_consumer(
        &self,
        _request: Request<Streaming<TransformRequest>>,
    ) -> Result<Response<TransformConsumerResponse>, Status> {
        Err(Status::unimplemented("TransformConsumer is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tonic::metadata::MetadataValue;
    use tonic::Code;

    #[test]
    fn missing_request_id_header_fails_precondition() {
        let request = Request::new(());
        let err = extract_request_id(&request).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn empty_request_id_header_fails_precondition() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(REQUEST_ID_METADATA_KEY, MetadataValue::from_static(""));
        let err = extract_request_id(&request).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn present_request_id_header_is_returned() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(REQUEST_ID_METADATA_KEY, MetadataValue::from_static("abc-123"));
        let request_id = extract_request_id(&request).unwrap();
        assert_matches!(request_id.as_str(), "abc-123");
    }
}
