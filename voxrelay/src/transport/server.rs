use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use relay_envelope::{Envelope, EnvelopeCodec, ErrorCode, MessageKind, WireError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::delivery::TerminalEvent;
use crate::{Error, Result};

/// Answers REQUEST payloads. The transport never looks inside them.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: &Envelope) -> Result<Bytes>;
}

/// Per-connection limits copied out of [`TransportConfig`].
#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    max_frame_len: usize,
    request_timeout: Duration,
    outbound_buffer: usize,
}

/// Framed TCP server: request/reply plus a publish stream of terminal
/// events sent to every connection as EVENT envelopes.
pub struct TransportServer {
    listener: TcpListener,
    limits: ConnectionLimits,
    handler: Arc<dyn RequestHandler>,
    events: broadcast::Sender<TerminalEvent>,
}

impl TransportServer {
    pub async fn bind(
        config: &TransportConfig,
        handler: Arc<dyn RequestHandler>,
        events: broadcast::Sender<TerminalEvent>,
    ) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::transport(format!("cannot bind {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            limits: ConnectionLimits {
                max_frame_len: config.max_frame_len,
                request_timeout: Duration::from_millis(config.request_timeout_ms),
                outbound_buffer: config.outbound_buffer.max(1),
            },
            handler,
            events,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then wait for open
    /// connections to close.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Transport listening on {}", addr);

        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            self.handler.clone(),
                            self.events.subscribe(),
                            self.limits,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Transport shutting down");
        connections.close();
        connections.wait().await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    mut events: broadcast::Receiver<TerminalEvent>,
    limits: ConnectionLimits,
    cancel: CancellationToken,
) {
    let codec = EnvelopeCodec::new(limits.max_frame_len);
    let framed = Framed::new(stream, codec);
    let (mut sink, mut frames) = framed.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(limits.outbound_buffer);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = sink.send(envelope).await {
                debug!(%peer, error = %e, "Write failed, closing connection");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut requests = JoinSet::new();
    let mut events_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(_) = requests.join_next(), if !requests.is_empty() => {}
            frame = frames.next() => match frame {
                Some(Ok(envelope)) if envelope.kind == MessageKind::Request => {
                    requests.spawn(answer(handler.clone(), envelope, tx.clone(), limits.request_timeout, codec));
                }
                Some(Ok(envelope)) => {
                    warn!(%peer, kind = %envelope.kind, "Ignoring envelope that is not a request");
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "Malformed frame, closing connection");
                    break;
                }
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => match publish(&event, &codec) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(job_id = %event.job_id, error = %e, "Failed to encode terminal event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "Connection fell behind the event stream");
                }
                Err(RecvError::Closed) => events_open = false,
            },
        }
    }

    requests.shutdown().await;
    drop(tx);
    let _ = writer.await;
    debug!(%peer, "Connection closed");
}

async fn answer(
    handler: Arc<dyn RequestHandler>,
    request: Envelope,
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
    codec: EnvelopeCodec,
) {
    let mut reply = match tokio::time::timeout(timeout, handler.handle(&request)).await {
        Ok(Ok(payload)) => Envelope::reply_to(&request, payload),
        Ok(Err(e)) => {
            debug!(correlation_id = %request.correlation_id, error = %e, "Request failed");
            Envelope::error_reply(&request, e.to_wire())
        }
        Err(_) => Envelope::error_reply(
            &request,
            WireError::new(
                ErrorCode::Timeout,
                format!("no reply within {}ms", timeout.as_millis()),
            ),
        ),
    };
    // A reply the writer cannot frame would take the whole connection down.
    if let Err(e) = codec.check(&reply) {
        warn!(correlation_id = %request.correlation_id, error = %e, "Reply cannot be framed");
        reply = Envelope::error_reply(
            &request,
            WireError::new(ErrorCode::Internal, "reply exceeds frame limit"),
        );
    }
    // The connection may already be gone.
    let _ = tx.send(reply).await;
}

fn publish(event: &TerminalEvent, codec: &EnvelopeCodec) -> Result<Envelope> {
    let payload = serde_json::to_vec(event)?;
    let envelope =
        Envelope::event(event.job_id.as_str(), payload).with_stage(event.stage.as_str());
    codec.check(&envelope)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, JobStatus, Stage};
    use chrono::Utc;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: &Envelope) -> Result<Bytes> {
            match request.payload.as_ref() {
                b"fail" => Err(Error::Overloaded("queue full".into())),
                b"big" => Ok(Bytes::from(vec![b'x'; 4096])),
                b"long-error" => Err(Error::ModelFailure("e".repeat(70_000))),
                b"slow-echo" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Bytes::from_static(b"slow-echo"))
                }
                b"slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Bytes::new())
                }
                other => Ok(Bytes::copy_from_slice(other)),
            }
        }
    }

    fn config(request_timeout_ms: u64) -> TransportConfig {
        TransportConfig {
            port: 0,
            request_timeout_ms,
            ..Default::default()
        }
    }

    async fn start(
        request_timeout_ms: u64,
    ) -> (SocketAddr, broadcast::Sender<TerminalEvent>, CancellationToken) {
        start_with(config(request_timeout_ms)).await
    }

    async fn start_with(
        config: TransportConfig,
    ) -> (SocketAddr, broadcast::Sender<TerminalEvent>, CancellationToken) {
        let (events, _) = broadcast::channel(16);
        let server = TransportServer::bind(&config, Arc::new(Echo), events.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, events, cancel)
    }

    async fn connect(addr: SocketAddr) -> Framed<TcpStream, EnvelopeCodec> {
        Framed::new(TcpStream::connect(addr).await.unwrap(), EnvelopeCodec::default())
    }

    #[tokio::test]
    async fn test_reply_matches_correlation_id() {
        let (addr, _events, cancel) = start(1_000).await;
        let mut conn = connect(addr).await;

        conn.send(Envelope::request("c-1", "hello")).await.unwrap();
        let reply = conn.next().await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.correlation_id, "c-1");
        assert_eq!(reply.payload, Bytes::from_static(b"hello"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_error_and_timeout_replies() {
        let (addr, _events, cancel) = start(100).await;
        let mut conn = connect(addr).await;

        conn.send(Envelope::request("c-1", "fail")).await.unwrap();
        let reply = conn.next().await.unwrap().unwrap();
        let error = reply.error.unwrap();
        assert_eq!(error.code, ErrorCode::Overloaded);
        assert!(error.is_retryable());

        conn.send(Envelope::request("c-2", "slow")).await.unwrap();
        let reply = conn.next().await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, "c-2");
        assert_eq!(reply.error.unwrap().code, ErrorCode::Timeout);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_terminal_events_are_published() {
        let (addr, events, cancel) = start(1_000).await;
        let mut conn = connect(addr).await;

        // Round-trip once so the connection is registered before publishing.
        conn.send(Envelope::request("c-1", "ping")).await.unwrap();
        conn.next().await.unwrap().unwrap();

        events
            .send(TerminalEvent {
                job_id: JobId::from("job-7"),
                terminal_status: JobStatus::Succeeded,
                stage: Stage::Translate,
                result: None,
                error: None,
                retry_count: 0,
                completed_at: Utc::now(),
                callback_metadata: None,
                webhook_url: None,
            })
            .unwrap();

        let event = conn.next().await.unwrap().unwrap();
        assert_eq!(event.kind, MessageKind::Event);
        assert_eq!(event.job_id.as_deref(), Some("job-7"));
        assert_eq!(event.stage.as_deref(), Some("TRANSLATE"));
        let body: TerminalEvent = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(body.terminal_status, JobStatus::Succeeded);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unframeable_reply_becomes_error_and_connection_survives() {
        let (addr, _events, cancel) = start_with(TransportConfig {
            port: 0,
            request_timeout_ms: 1_000,
            max_frame_len: 1024,
            ..Default::default()
        })
        .await;
        let mut conn = Framed::new(TcpStream::connect(addr).await.unwrap(), EnvelopeCodec::new(1024));

        conn.send(Envelope::request("slow-1", "slow-echo")).await.unwrap();
        conn.send(Envelope::request("big-1", "big")).await.unwrap();
        conn.send(Envelope::request("long-1", "long-error")).await.unwrap();

        let mut replies = std::collections::HashMap::new();
        for _ in 0..3 {
            let reply = conn.next().await.unwrap().unwrap();
            replies.insert(reply.correlation_id.clone(), reply);
        }

        assert_eq!(replies["slow-1"].payload, Bytes::from_static(b"slow-echo"));
        assert!(replies["slow-1"].error.is_none());
        for id in ["big-1", "long-1"] {
            let error = replies[id].error.as_ref().unwrap();
            assert_eq!(error.code, ErrorCode::Internal);
            assert_eq!(error.message, "reply exceeds frame limit");
        }

        conn.send(Envelope::request("after", "still-open")).await.unwrap();
        let reply = conn.next().await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, "after");
        assert_eq!(reply.payload, Bytes::from_static(b"still-open"));
        cancel.cancel();
    }
}
