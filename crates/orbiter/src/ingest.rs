//! Streaming ingestion with a config-first handshake.
//!
//! [`StreamIngestion::open`] reads the first inbound message and refuses the
//! stream unless it is a config. Only then is a receive pump spawned; it
//! feeds admitted items into a bounded buffer that the dispatcher drains.
//! When the buffer is full the pump stops reading from the network, which is
//! what pushes backpressure back to the caller.

use crate::{
    Accepted, Admitted, CONFIG_MUST_PRECEDE_DATA, Error, ReconfigPolicy, Result,
    STREAM_ENDED_BEFORE_CONFIG, SessionMessage, StreamSession,
};
use core::{num::NonZeroUsize, pin::Pin, time::Duration};
use futures::{FutureExt, Stream, StreamExt, future::BoxFuture};
use std::sync::Arc;
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INGEST_BUFFER_SIZE: NonZeroUsize = NonZeroUsize::new(32_768).unwrap();

#[derive(Clone, Copy, Debug)]
pub struct IngestionOptions {
    /// Capacity of the buffer between the receive pump and the dispatcher.
    pub buffer_size: NonZeroUsize,
    /// How long the pump may stay blocked on a full buffer before the
    /// session fails with [`Error::ResourceExhausted`]. `None` blocks
    /// indefinitely.
    pub stall_timeout: Option<Duration>,
    pub reconfig: ReconfigPolicy,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_INGEST_BUFFER_SIZE,
            stall_timeout: None,
            reconfig: ReconfigPolicy::Reject,
        }
    }
}

/// Totals reported by a pump that ran to the end of its inbound stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    pub admitted: u64,
    pub reconfigurations: u64,
}

/// An open session: the handshake config, the admitted items, and the
/// pump's completion.
pub struct IngestionHandle<T, C> {
    config: Arc<C>,
    items: ReceiverStream<Admitted<T, C>>,
    completion: BoxFuture<'static, Result<IngestionSummary>>,
}

impl<T, C> IngestionHandle<T, C> {
    /// The config received during the handshake.
    pub const fn config(&self) -> &Arc<C> {
        &self.config
    }

    pub fn into_parts(
        self,
    ) -> (
        Arc<C>,
        ReceiverStream<Admitted<T, C>>,
        BoxFuture<'static, Result<IngestionSummary>>,
    ) {
        (self.config, self.items, self.completion)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StreamIngestion {
    options: IngestionOptions,
}

impl StreamIngestion {
    pub const fn new(options: IngestionOptions) -> Self {
        Self { options }
    }

    pub const fn options(&self) -> &IngestionOptions {
        &self.options
    }

    /// Performs the handshake and starts the receive pump.
    ///
    /// `inbound` yields decoded session messages; transport failures and
    /// undecodable messages should already be mapped to [`Error`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Protocol`] if the first message is not a config
    /// or the stream ends before one arrives, with the inbound error if the
    /// first read fails, and with [`Error::Cancelled`] if `cancel` fires
    /// first. Nothing has been admitted in any of these cases.
    pub async fn open<S, T, C>(
        &self,
        inbound: S,
        cancel: CancellationToken,
    ) -> Result<IngestionHandle<T, C>>
    where
        S: Stream<Item = Result<SessionMessage<T, C>>> + Send + 'static,
        T: Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        let mut inbound = Box::pin(inbound);
        let mut session = StreamSession::new(self.options.reconfig);

        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            next = inbound.next() => next,
        };

        let config = match first {
            Some(Ok(message)) => match session.accept(message)? {
                Accepted::Configured(config) => config,
                Accepted::Reconfigured(_) | Accepted::Admitted(_) => {
                    return Err(Error::protocol(CONFIG_MUST_PRECEDE_DATA));
                }
            },
            Some(Err(e)) => return Err(e),
            None => return Err(Error::protocol(STREAM_ENDED_BEFORE_CONFIG)),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Session handshake complete (buffer_size={})",
            self.options.buffer_size
        );

        let (tx, rx) = mpsc::channel(self.options.buffer_size.get());
        let pump = pump(inbound, session, tx, self.options.stall_timeout, cancel);

        #[cfg(feature = "tracing")]
        let pump = tracing::Instrument::instrument(pump, tracing::info_span!("ingest"));

        let completion = tokio::spawn(pump)
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(Error::channel(format!("ingestion pump failed: {e}"))))
            })
            .boxed();

        Ok(IngestionHandle {
            config,
            items: ReceiverStream::new(rx),
            completion,
        })
    }
}

async fn pump<S, T, C>(
    mut inbound: Pin<Box<S>>,
    mut session: StreamSession<C>,
    tx: mpsc::Sender<Admitted<T, C>>,
    stall_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Result<IngestionSummary>
where
    S: Stream<Item = Result<SessionMessage<T, C>>>,
{
    let result = loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break Err(Error::Cancelled),
            next = inbound.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                session.fail();
                break Err(e);
            }
            None => break session.close(),
        };

        match session.accept(message) {
            Ok(Accepted::Admitted(admitted)) => {
                if let Err(e) = forward(&tx, admitted, stall_timeout, &cancel).await {
                    session.fail();
                    break Err(e);
                }
            }
            Ok(Accepted::Reconfigured(_)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Session reconfigured after {} items",
                    session.admitted()
                );
            }
            Ok(Accepted::Configured(_)) => {}
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Inbound stream closed after {} items", session.admitted());
            Ok(IngestionSummary {
                admitted: session.admitted(),
                reconfigurations: session.reconfigurations(),
            })
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Session failed: {e}");
            // Stop the rest of the job; nothing more may be emitted.
            cancel.cancel();
            Err(e)
        }
    }
}

async fn forward<T, C>(
    tx: &mpsc::Sender<Admitted<T, C>>,
    admitted: Admitted<T, C>,
    stall_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<()> {
    let send = async {
        let sent = match stall_timeout {
            Some(limit) => timeout(limit, tx.send(admitted)).await.map_err(|_| {
                Error::resource_exhausted(format!(
                    "ingestion buffer full for more than {}ms",
                    limit.as_millis()
                ))
            })?,
            None => tx.send(admitted).await,
        };
        sent.map_err(|_| Error::channel("ingestion buffer closed"))
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        sent = send => sent,
    }
}
