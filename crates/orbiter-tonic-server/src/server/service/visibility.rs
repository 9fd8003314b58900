//! The `Visibility` gRPC service.
//!
//! `BatchGetAccessIntervals` groups TLEs into chunks before dispatch: one
//! pool job computes a whole chunk and the chunk becomes one `AccessBatch`.
//! The chunk size comes from the batch sizing policy, using the search span
//! and elevation mask to estimate how many windows each TLE produces.

use super::handler::{ResponseStream, ServiceCore};
use crate::server::compute::{
    tle::catalog_number,
    visibility::{ACCESS_WEIGHT, VisibilityParams, VisibilityProvider},
};
use orbiter::{BatchSizingPolicy, Pipeline};
use orbiter_tonic_core::{
    Error,
    proto::{
        AccessBatch, AccessIntervalsRequest, AccessIntervalsResponse, BatchAccessIntervalsRequest,
        VisibilityConfig, visibility_server::Visibility,
    },
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct VisibilityService {
    core: ServiceCore,
    pipeline: Pipeline<VisibilityProvider>,
}

impl VisibilityService {
    pub fn new(core: ServiceCore) -> Self {
        let pipeline = Pipeline::new(
            Arc::new(VisibilityProvider),
            Arc::clone(core.pool()),
            core.config().bulk_dispatch,
        );
        Self { core, pipeline }
    }
}

fn params(config: Option<&VisibilityConfig>) -> Result<VisibilityParams, Error> {
    let config = config.ok_or_else(|| Error::invalid_request("Request must carry a config"))?;
    VisibilityParams::try_from(config).map_err(|e| Error::invalid_request(e.message))
}

#[tonic::async_trait]
impl Visibility for VisibilityService {
    type BatchGetAccessIntervalsStream = ResponseStream<AccessBatch>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn get_access_intervals(
        &self,
        req: Request<AccessIntervalsRequest>,
    ) -> Result<Response<AccessIntervalsResponse>, Status> {
        self.core.admit("GetAccessIntervals")?;
        let req = req.into_inner();
        let params = params(req.config.as_ref())?;
        let tle = req
            .tle
            .ok_or_else(|| Error::invalid_request("Request must carry a TLE"))?;
        let satellite_id = catalog_number(&tle.line1).unwrap_or(0);

        let access = self
            .pipeline
            .compute_one(tle, params)
            .await
            .map_err(Error::from)?
            .map_err(Error::from)?;

        Ok(Response::new(AccessIntervalsResponse {
            satellite_id,
            access: Some(access),
        }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tles = req.get_ref().tles.len())))]
    async fn batch_get_access_intervals(
        &self,
        req: Request<BatchAccessIntervalsRequest>,
    ) -> Result<Response<Self::BatchGetAccessIntervalsStream>, Status> {
        self.core.admit("BatchGetAccessIntervals")?;
        let req = req.into_inner();
        self.core.check_bulk_size(req.tles.len())?;
        let params = params(req.config.as_ref())?;

        let chunk_size = self
            .core
            .config()
            .batch_sizing
            .batch_size(&params.span(), ACCESS_WEIGHT);
        #[cfg(feature = "tracing")]
        tracing::debug!(chunk_size = chunk_size.get(), "Streaming access intervals");

        let cancel = self.core.call_token();
        let batches = self
            .pipeline
            .stream_bulk_chunked(req.tles, params, chunk_size, cancel.clone());

        Ok(Response::new(self.core.respond(batches, cancel)))
    }
}
