//! The `Transformation` gRPC service.
//!
//! `BatchTransform` groups state vectors into chunks of
//! `TRANSFORM_CHUNK_SIZE` before dispatch. A conversion is cheap, so one
//! pool job per vector would cost more in scheduling than in compute.

use super::handler::{ResponseStream, ServiceCore};
use crate::server::compute::transformation::{TransformParams, TransformationProvider};
use orbiter::Pipeline;
use orbiter_tonic_core::{
    Error,
    proto::{
        BatchTransformRequest, TransformBatch, TransformConfig, TransformRequest,
        TransformResponse, transformation_server::Transformation,
    },
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct TransformationService {
    core: ServiceCore,
    pipeline: Pipeline<TransformationProvider>,
}

impl TransformationService {
    pub fn new(core: ServiceCore) -> Self {
        let pipeline = Pipeline::new(
            Arc::new(TransformationProvider),
            Arc::clone(core.pool()),
            core.config().bulk_dispatch,
        );
        Self { core, pipeline }
    }
}

fn params(config: Option<&TransformConfig>) -> Result<TransformParams, Error> {
    let config = config.ok_or_else(|| Error::invalid_request("Request must carry a config"))?;
    TransformParams::try_from(config).map_err(|e| Error::invalid_request(e.message))
}

#[tonic::async_trait]
impl Transformation for TransformationService {
    type BatchTransformStream = ResponseStream<TransformBatch>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn transform(
        &self,
        req: Request<TransformRequest>,
    ) -> Result<Response<TransformResponse>, Status> {
        self.core.admit("Transform")?;
        let req = req.into_inner();
        let params = params(req.config.as_ref())?;
        let state = req
            .state
            .ok_or_else(|| Error::invalid_request("Request must carry a state vector"))?;

        let converted = self
            .pipeline
            .compute_one(state, params)
            .await
            .map_err(Error::from)?
            .map_err(Error::from)?;

        Ok(Response::new(TransformResponse {
            state: Some(converted),
            frame: params.target.into(),
            epoch: params.epoch(),
        }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(states = req.get_ref().states.len())))]
    async fn batch_transform(
        &self,
        req: Request<BatchTransformRequest>,
    ) -> Result<Response<Self::BatchTransformStream>, Status> {
        self.core.admit("BatchTransform")?;
        let req = req.into_inner();
        self.core.check_bulk_size(req.states.len())?;
        let params = params(req.config.as_ref())?;

        let chunk_size = self.core.config().transform_chunk_size;
        #[cfg(feature = "tracing")]
        tracing::debug!(chunk_size = chunk_size.get(), "Streaming transformation");

        let cancel = self.core.call_token();
        let batches = self
            .pipeline
            .stream_bulk_chunked(req.states, params, chunk_size, cancel.clone());

        Ok(Response::new(self.core.respond(batches, cancel)))
    }
}
