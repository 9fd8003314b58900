//! The `Propagation` gRPC service.
//!
//! | RPC | Call shape | Batching |
//! |---|---|---|
//! | `PropagateTle` | unary, one TLE | none |
//! | `BatchPropagateTle` | unary bulk | every outcome in one response |
//! | `PropagateTleList` | server streaming | after dispatch, sized by `position_count` |
//! | `StreamTles` | bidirectional, config first | after dispatch, sized by the config |

use super::handler::{ResponseStream, ServiceCore};
use crate::server::{
    compute::{
        propagation::{PropagationParams, PropagationProvider, TRACK_WEIGHT},
        tle::catalog_number,
    },
    telemetry::{Metric, record},
};
use futures::StreamExt;
use orbiter::{Pipeline, SessionMessage, StreamIngestion};
use orbiter_tonic_core::{
    Error,
    proto::{
        PropagateTleRequest, PropagateTleResponse, PropagationConfig, TleBatch, TleBatchResponse,
        TleListRequest, TleStreamRequest, propagation_server::Propagation,
        tle_stream_request::Message,
    },
    wire::encode_report,
};
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};

#[derive(Clone)]
pub struct PropagationService {
    core: ServiceCore,
    bulk: Pipeline<PropagationProvider>,
    stream: Pipeline<PropagationProvider>,
}

impl PropagationService {
    pub fn new(core: ServiceCore) -> Self {
        let bulk = Pipeline::new(
            Arc::new(PropagationProvider),
            Arc::clone(core.pool()),
            core.config().bulk_dispatch,
        );
        let stream = bulk.with_options(core.config().stream_dispatch);
        Self { core, bulk, stream }
    }
}

fn params(config: Option<&PropagationConfig>) -> Result<PropagationParams, Error> {
    let config = config.ok_or_else(|| Error::invalid_request("Request must carry a config"))?;
    PropagationParams::try_from(config).map_err(|e| Error::invalid_request(e.message))
}

/// Maps one inbound stream message to a session message. Transport failures
/// and messages that cannot be used are errors of the whole stream.
fn session_message(
    message: Result<TleStreamRequest, Status>,
) -> orbiter::Result<SessionMessage<orbiter_tonic_core::proto::TleLines, PropagationParams>> {
    match message {
        Ok(TleStreamRequest {
            message: Some(Message::Config(config)),
        }) => PropagationParams::try_from(&config)
            .map(SessionMessage::Config)
            .map_err(|e| orbiter::Error::protocol(format!("invalid config: {}", e.message))),
        Ok(TleStreamRequest {
            message: Some(Message::Tle(tle)),
        }) => Ok(SessionMessage::Item(tle)),
        Ok(TleStreamRequest { message: None }) => Err(orbiter::Error::protocol(
            "stream message carries neither a config nor a TLE",
        )),
        Err(status) => Err(orbiter::Error::Transport {
            reason: status.message().to_owned(),
        }),
    }
}

#[tonic::async_trait]
impl Propagation for PropagationService {
    type PropagateTleListStream = ResponseStream<TleBatch>;
    type StreamTlesStream = ResponseStream<TleBatch>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn propagate_tle(
        &self,
        req: Request<PropagateTleRequest>,
    ) -> Result<Response<PropagateTleResponse>, Status> {
        self.core.admit("PropagateTle")?;
        let req = req.into_inner();
        let params = params(req.config.as_ref())?;
        let tle = req
            .tle
            .ok_or_else(|| Error::invalid_request("Request must carry a TLE"))?;
        let satellite_id = catalog_number(&tle.line1).unwrap_or(0);

        let track = self
            .bulk
            .compute_one(tle, params)
            .await
            .map_err(Error::from)?
            .map_err(Error::from)?;

        Ok(Response::new(PropagateTleResponse {
            satellite_id,
            track: Some(track),
        }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tles = req.get_ref().tles.len())))]
    async fn batch_propagate_tle(
        &self,
        req: Request<TleListRequest>,
    ) -> Result<Response<TleBatchResponse>, Status> {
        self.core.admit("BatchPropagateTle")?;
        let req = req.into_inner();
        self.core.check_bulk_size(req.tles.len())?;
        let params = params(req.config.as_ref())?;

        let report = self
            .bulk
            .run_bulk(req.tles, params, self.core.call_token())
            .await
            .map_err(Error::from)?;
        record(Metric::bulk(&report));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Bulk propagation complete"
        );

        Ok(Response::new(encode_report(report)))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tles = req.get_ref().tles.len())))]
    async fn propagate_tle_list(
        &self,
        req: Request<TleListRequest>,
    ) -> Result<Response<Self::PropagateTleListStream>, Status> {
        self.core.admit("PropagateTleList")?;
        let req = req.into_inner();
        self.core.check_bulk_size(req.tles.len())?;
        let params = params(req.config.as_ref())?;

        let batcher = self.core.batcher(&params.span(), TRACK_WEIGHT);
        #[cfg(feature = "tracing")]
        tracing::debug!(batch_size = batcher.size().get(), "Streaming propagation");

        let cancel = self.core.call_token();
        let batches = self
            .bulk
            .stream_bulk(req.tles, params, batcher, cancel.clone());

        Ok(Response::new(self.core.respond(batches, cancel)))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn stream_tles(
        &self,
        req: Request<Streaming<TleStreamRequest>>,
    ) -> Result<Response<Self::StreamTlesStream>, Status> {
        self.core.admit("StreamTles")?;
        let cancel = self.core.call_token();
        let inbound = req.into_inner().map(session_message);

        let handle = StreamIngestion::new(self.core.config().ingestion)
            .open(inbound, cancel.clone())
            .await
            .map_err(|e| {
                if e.is_protocol() {
                    record(Metric::ProtocolViolation);
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("Stream refused: {}", e);
                Status::from(Error::from(e))
            })?;

        let batcher = self.core.batcher(&handle.config().span(), TRACK_WEIGHT);
        let batches = self.stream.stream_session(handle, batcher, cancel.clone());

        Ok(Response::new(self.core.respond(batches, cancel)))
    }
}
