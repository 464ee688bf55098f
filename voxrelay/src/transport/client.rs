use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use relay_envelope::{Envelope, EnvelopeCodec, MessageKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

const OUTBOUND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

type Pending = Arc<DashMap<String, oneshot::Sender<Envelope>>>;

/// Client side of the transport. Correlates replies to requests and fans
/// EVENT envelopes out to subscribers.
pub struct TransportClient {
    outbound: mpsc::Sender<Envelope>,
    pending: Pending,
    events: broadcast::Sender<Envelope>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl TransportClient {
    pub async fn connect(addr: impl ToSocketAddrs, request_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut sink, mut frames) = Framed::new(stream, EnvelopeCodec::default()).split();

        let (outbound, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let pending: Pending = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => {
                            if let Err(e) = sink.send(envelope).await {
                                warn!(error = %e, "Transport write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let reader_cancel = cancel.clone();
        let reader_pending = pending.clone();
        let reader_events = events.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(envelope)) => match envelope.kind {
                        MessageKind::Reply => {
                            match reader_pending.remove(&envelope.correlation_id) {
                                Some((_, waiter)) => {
                                    let _ = waiter.send(envelope);
                                }
                                None => debug!(
                                    correlation_id = %envelope.correlation_id,
                                    "Reply for an abandoned request"
                                ),
                            }
                        }
                        MessageKind::Event => {
                            let _ = reader_events.send(envelope);
                        }
                        MessageKind::Request => warn!("Server sent a request, ignoring"),
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Malformed frame from server");
                        break;
                    }
                    None => break,
                }
            }
            // Dropping the waiters fails every outstanding call.
            reader_pending.clear();
            reader_cancel.cancel();
        });

        Ok(Self {
            outbound,
            pending,
            events,
            request_timeout,
            cancel,
        })
    }

    /// Send a request and wait for its reply payload. An error reply comes
    /// back as the matching [`Error`] variant.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(Error::transport("connection closed"));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let request = Envelope::request(correlation_id.clone(), payload);
        // An unframeable request would fail the writer and every other call.
        EnvelopeCodec::default()
            .check(&request)
            .map_err(|e| Error::validation(format!("request cannot be sent: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);
        if self.outbound.send(request).await.is_err() {
            self.pending.remove(&correlation_id);
            return Err(Error::transport("connection closed"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => match reply.error {
                Some(error) => Err(Error::from_wire(error)),
                None => Ok(reply.payload),
            },
            Ok(Err(_)) => Err(Error::transport("connection closed before reply")),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(Error::Timeout(format!(
                    "no reply within {}ms",
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    /// JSON convenience over [`TransportClient::call`].
    pub async fn call_json<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.call(payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// EVENT envelopes received from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
