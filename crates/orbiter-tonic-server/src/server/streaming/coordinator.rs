use crate::server::telemetry::{Metric, record};
use futures::StreamExt;
use orbiter::BatchStream;
use orbiter_tonic_core::{
    Error,
    wire::{WireBatch, WireOutcome, encode_batch},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Drives a batch stream and forwards every batch, encoded, to the response
/// channel of one call.
///
/// The call's `cancel` token is fired whenever forwarding stops early, so
/// that admission and dispatch stop with it:
///
/// - the client went away (`resp_tx` closed or a send failed): returns
///   without writing anything else;
/// - the engine yielded an error: it is surfaced to the client as the final
///   status and returned;
/// - the stream ended because the pool is shutting down: the client gets
///   `UNAVAILABLE` instead of a truncated but successful stream.
pub async fn feed_batches<B>(
    mut batches: BatchStream<<B::Outcome as WireOutcome>::Output>,
    resp_tx: mpsc::Sender<Result<B, Status>>,
    cancel: CancellationToken,
) -> orbiter_tonic_core::Result<()>
where
    B: WireBatch,
{
    loop {
        let next = tokio::select! {
            biased;
            () = resp_tx.closed() => {
                cancel.cancel();
                return Err(orbiter::Error::Cancelled.into());
            }
            next = batches.next() => next,
        };

        match next {
            Some(Ok(batch)) => {
                let failed = batch.failures().count();
                record(Metric::Items {
                    computed: batch.len() as u64,
                    failed: failed as u64,
                });

                if let Err(e) = resp_tx.send(Ok(encode_batch(batch))).await {
                    cancel.cancel();
                    return Err(
                        orbiter::Error::channel(format!("Failed to forward batch: {e}")).into(),
                    );
                }
            }
            Some(Err(e)) => {
                cancel.cancel();
                return Err(surface(&resp_tx, e.into()).await);
            }
            None if cancel.is_cancelled() => {
                return Err(surface(&resp_tx, orbiter::Error::ServiceShutdown.into()).await);
            }
            None => return Ok(()),
        }
    }
}

/// Best effort: the client may already be gone, in which case the error is
/// only logged.
async fn surface<B>(resp_tx: &mpsc::Sender<Result<B, Status>>, err: Error) -> Error {
    if let Err(_e) = resp_tx.send(Err(err.clone().into())).await {
        #[cfg(feature = "tracing")]
        tracing::warn!("Failed to forward error: {}", _e);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use orbiter::{Batch, ComputeError, ComputeOutcome, CorrelationKey};
    use orbiter_tonic_core::proto::{TleBatch, Track, tle_outcome};
    use tonic::Code;

    fn batch(sequence: u64, first: u64, len: u64) -> Batch<Track> {
        Batch::from_outcomes(
            sequence,
            (first..first + len)
                .map(|i| ComputeOutcome::Success {
                    key: CorrelationKey::new(i, Some(i + 1)),
                    output: Track::default(),
                })
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn forwards_batches_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let batches = stream::iter(vec![Ok(batch(0, 0, 2)), Ok(batch(1, 2, 1))]).boxed();

        feed_batches::<TleBatch>(batches, tx, CancellationToken::new())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.outcomes.len(), 2);
        assert_eq!(first.outcomes[1].satellite_id, 2);
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.sequence, 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn engine_error_becomes_final_status_and_cancels() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let batches = stream::iter(vec![
            Ok(batch(0, 0, 1)),
            Err(orbiter::Error::protocol("config already received")),
        ])
        .boxed();

        let err = feed_batches::<TleBatch>(batches, tx, cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline(ref e) if e.is_protocol()));
        assert!(cancel.is_cancelled());

        assert!(rx.recv().await.unwrap().is_ok());
        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn shutdown_truncation_is_reported_as_unavailable() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batches = stream::empty().boxed();
        assert!(feed_batches::<TleBatch>(batches, tx, cancel).await.is_err());
        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn closed_client_cancels_the_call() {
        let (tx, rx) = mpsc::channel::<Result<TleBatch, Status>>(1);
        drop(rx);
        let cancel = CancellationToken::new();
        let batches = stream::pending().boxed();

        assert!(feed_batches(batches, tx, cancel.clone()).await.is_err());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn failures_are_encoded_as_entries() {
        let failed = Batch::from_outcomes(
            4,
            vec![ComputeOutcome::<Track>::Failure {
                key: CorrelationKey::new(9, None),
                error: ComputeError::compute("diverged"),
            }],
        )
        .unwrap();
        let wire: TleBatch = encode_batch(failed);
        assert!(matches!(
            wire.outcomes[0].outcome,
            Some(tle_outcome::Outcome::Failure(_))
        ));
    }
}
