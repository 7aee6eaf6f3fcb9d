//! WebSocket session handling
//!
//! One [`Session`] drives one connection: it decodes request frames, hands
//! them to the connection's [`MiningCoordinator`] and writes each outcome
//! back as a response frame.

use crate::coordinator::{JobId, MiningCoordinator};
use crate::protocol::{decode_request, encode_response, Response};
use crate::{Error, MiningResult, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single client connection and its job slot
pub struct Session<S> {
    id: SessionId,
    stream: S,
    coordinator: MiningCoordinator,
    shutdown: CancellationToken,
}

impl<S> Session<S>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    /// Create a session; `shutdown` ends it from the outside
    pub fn new(
        id: SessionId,
        stream: S,
        coordinator: MiningCoordinator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            stream,
            coordinator,
            shutdown,
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Serve the connection until it closes, fails or is shut down
    pub async fn run(mut self) -> Result<()> {
        debug!("Session {} opened", self.id);
        let result = self.serve().await;

        if let Some(job) = self.coordinator.cancel_current() {
            debug!("Cancelled job {} on session close", job);
        }
        info!("Session {} closed", self.id);
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    if let Err(e) = self.stream.close().await {
                        debug!("Close during shutdown failed: {}", e);
                    }
                    return Ok(());
                }

                frame = self.stream.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            if !self.handle_frame(message).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }

                (job, outcome) = self.coordinator.next_outcome() => {
                    self.handle_outcome(job, outcome).await?;
                }
            }
        }
    }

    /// Returns `false` once the peer has closed the connection
    async fn handle_frame(&mut self, message: Message) -> Result<bool> {
        match message {
            Message::Text(text) => self.handle_request(text.as_str()).await?,
            Message::Binary(_) => {
                self.coordinator.cancel_current();
                let err = Error::invalid_request("binary frames are not supported");
                self.send_response(&Response::from_error(&err)).await?;
            }
            Message::Ping(payload) => self.stream.send(Message::Pong(payload)).await?,
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(frame) => {
                debug!("Peer closed connection: {:?}", frame);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_request(&mut self, text: &str) -> Result<()> {
        let submitted = decode_request(text).and_then(|request| {
            debug!(
                "Request for kind {} at target {}",
                request.event.kind, request.target_pow
            );
            self.coordinator.submit(request)
        });

        match submitted {
            Ok(job) => {
                debug!("Accepted job {}", job);
                Ok(())
            }
            Err(e) => {
                // A rejected frame still supersedes the job in flight
                self.coordinator.cancel_current();
                warn!(category = e.category(), "Rejected request: {}", e);
                self.send_response(&Response::from_error(&e)).await
            }
        }
    }

    async fn handle_outcome(&mut self, job: JobId, outcome: Result<MiningResult>) -> Result<()> {
        match outcome {
            Err(e) if !e.is_wire_visible() => {
                debug!("Job {} cancelled", job);
                Ok(())
            }
            outcome => {
                if let Err(e) = &outcome {
                    warn!(job, category = e.category(), "Job failed: {}", e);
                }
                self.send_response(&Response::from(outcome)).await
            }
        }
    }

    async fn send_response(&mut self, response: &Response) -> Result<()> {
        self.stream
            .send(Message::text(encode_response(response)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::PowLimits;
    use crate::protocol::decode_response;
    use crate::worker::{CpuWorker, CpuWorkerConfig};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    const HELLO: &str = concat!(
        r#"{"event":{"created_at":1700000000,"kind":1,"tags":[],"#,
        r#""content":"Hello, World!","pubkey":"test_pubkey"},"target_pow":6}"#
    );

    async fn connected() -> (
        WebSocketStream<DuplexStream>,
        tokio::task::JoinHandle<Result<()>>,
        CancellationToken,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let shutdown = CancellationToken::new();
        let engine = Arc::new(CpuWorker::new(CpuWorkerConfig {
            threads: 1,
            batch_size: 512,
        }));
        let coordinator =
            MiningCoordinator::new(engine, PowLimits::default(), shutdown.child_token());
        let session = Session::new(SessionId::new(), server, coordinator, shutdown.clone());
        (client, tokio::spawn(session.run()), shutdown)
    }

    async fn next_response(client: &mut WebSocketStream<DuplexStream>) -> Response {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), client.next())
                .await
                .expect("no response in time")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = message {
                return decode_response(text.as_str()).unwrap();
            }
        }
    }

    #[test]
    fn test_session_id_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::new().to_string().len(), 36);
    }

    #[tokio::test]
    async fn test_request_gets_ok_response() {
        let (mut client, _handle, _shutdown) = connected().await;
        client.send(Message::text(HELLO)).await.unwrap();

        assert_matches!(next_response(&mut client).await, Response::Ok(result) if result.pow >= 6);
    }

    #[tokio::test]
    async fn test_malformed_and_binary_frames_keep_session_open() {
        let (mut client, _handle, _shutdown) = connected().await;

        client.send(Message::text("{not json")).await.unwrap();
        assert_matches!(next_response(&mut client).await, Response::Err(_));

        client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_matches!(
            next_response(&mut client).await,
            Response::Err(msg) if msg.contains("binary")
        );

        client.send(Message::text(HELLO)).await.unwrap();
        assert_matches!(next_response(&mut client).await, Response::Ok(_));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut client, _handle, _shutdown) = connected().await;
        client.send(Message::Ping(vec![7u8, 7].into())).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_matches!(message, Message::Pong(payload) if payload.to_vec() == vec![7u8, 7]);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let (mut client, handle, _shutdown) = connected().await;
        client.close(None).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let (_client, handle, shutdown) = connected().await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
