//! OCPP WebSocket channel
//!
//! One WebSocket connection to one peer, either dialled (uplink to a CSMS or
//! a parent node) or accepted (a station or child node connecting to us).
//! Handles:
//! - OCPP 2.0.1 subprotocol negotiation and frame size limits
//! - CALLRESULT / CALLERROR delivery to the node's correlator
//! - Inbound CALLs handed to an [`IncomingRequest`] queue with a responder
//! - Failing in-flight requests when the connection goes away

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, TransportChannel};
use crate::correlator::{Correlator, ResponseFrame};
use crate::identity::NodeId;
use crate::ocpp::{Call, OcppMessage};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

const OUTGOING_QUEUE: usize = 64;

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(64 * 1024),
        max_frame_size: Some(16 * 1024),
        ..Default::default()
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Sends the answer to one inbound CALL back over the channel it arrived on
#[derive(Clone)]
pub struct Responder {
    peer: NodeId,
    outgoing: mpsc::Sender<String>,
}

impl Responder {
    pub async fn respond(&self, frame: ResponseFrame) -> Result<(), ChannelError> {
        let bytes = match &frame {
            ResponseFrame::Result(result) => result.to_bytes(),
            ResponseFrame::Error(error) => error.to_bytes(),
        }
        .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        self.outgoing
            .send(text)
            .await
            .map_err(|_| ChannelError::Closed(self.peer.clone()))
    }
}

/// A CALL received from a peer
pub struct IncomingRequest {
    pub peer: NodeId,
    pub call: Call,
    pub responder: Responder,
}

/// State shared by the channel handle and its I/O tasks
struct Link {
    peer: NodeId,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    correlator: Arc<Correlator>,
}

impl Link {
    fn shutdown(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Channel to {} closed: {}", self.peer, reason);
            self.closed_tx.send_replace(true);
            self.correlator.fail_peer(&self.peer);
        }
    }
}

/// [`TransportChannel`] over an OCPP WebSocket connection
pub struct WebSocketChannel {
    link: Arc<Link>,
    outgoing: mpsc::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketChannel {
    /// Dial `url` and speak OCPP to `peer` over it
    pub async fn connect(
        peer: impl Into<NodeId>,
        url: &str,
        correlator: Arc<Correlator>,
        incoming: mpsc::Sender<IncomingRequest>,
    ) -> Result<Arc<Self>, ChannelError> {
        let peer = peer.into();

        let mut request = url
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config()), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection to {} failed: {}", url, e);
                ChannelError::ConnectFailed(e.to_string())
            })?;

        // Verify subprotocol
        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "{} did not accept OCPP 2.0.1 subprotocol, got: {:?}",
                peer, accepted_protocol
            );
        }

        info!("WebSocket connected to {} at {}", peer, url);
        Ok(Self::spawn(peer, ws_stream, correlator, incoming))
    }

    /// Complete the handshake of a peer dialling us
    ///
    /// The peer is named by the last segment of the request path, as in
    /// `ws://node/ocpp/CS001`.
    pub async fn accept(
        stream: TcpStream,
        correlator: Arc<Correlator>,
        incoming: mpsc::Sender<IncomingRequest>,
    ) -> Result<Arc<Self>, ChannelError> {
        let requested_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured = requested_id.clone();

        let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let id = request
                .uri()
                .path()
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(str::to_string);

            match id {
                Some(id) => {
                    *captured.lock() = Some(id);
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("missing station id in path".to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config()))
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        let peer = requested_id
            .lock()
            .take()
            .map(NodeId::from)
            .ok_or_else(|| ChannelError::ConnectFailed("handshake carried no station id".to_string()))?;

        info!("WebSocket accepted from {}", peer);
        Ok(Self::spawn(peer, ws_stream, correlator, incoming))
    }

    fn spawn<S>(
        peer: NodeId,
        ws_stream: WebSocketStream<S>,
        correlator: Arc<Correlator>,
        incoming: mpsc::Sender<IncomingRequest>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let link = Arc::new(Link {
            peer,
            open: AtomicBool::new(true),
            closed_tx,
            correlator,
        });

        let (ws_tx, ws_rx) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);

        let sender = tokio::spawn(send_loop(link.clone(), ws_tx, outgoing_rx));
        let receiver = tokio::spawn(receive_loop(link.clone(), ws_rx, outgoing.clone(), incoming));

        Arc::new(Self {
            link,
            outgoing,
            tasks: Mutex::new(vec![sender, receiver]),
        })
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        let mut rx = self.link.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Drop the connection, failing whatever is still in flight on it
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.link.shutdown("closed locally");
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl TransportChannel for WebSocketChannel {
    fn peer(&self) -> &NodeId {
        &self.link.peer
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.link.peer.clone()));
        }
        let text = String::from_utf8(frame).map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        self.outgoing
            .send(text)
            .await
            .map_err(|_| ChannelError::Closed(self.link.peer.clone()))
    }
}

async fn send_loop<S>(
    link: Arc<Link>,
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::Receiver<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = outgoing.recv().await {
        debug!("Sending to {}: {}", link.peer, text);

        if let Err(e) = ws_tx.send(Message::Text(text)).await {
            error!("Failed to send WebSocket message to {}: {}", link.peer, e);
            link.shutdown("send failed");
            return;
        }
    }
    let _ = ws_tx.close().await;
}

async fn receive_loop<S>(
    link: Arc<Link>,
    mut ws_rx: SplitStream<WebSocketStream<S>>,
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Sender<IncomingRequest>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("Received from {}: {}", link.peer, text);

                match OcppMessage::parse(text.as_bytes()) {
                    Ok(OcppMessage::Call(call)) => {
                        let request = IncomingRequest {
                            peer: link.peer.clone(),
                            call,
                            responder: Responder {
                                peer: link.peer.clone(),
                                outgoing: outgoing.clone(),
                            },
                        };
                        if incoming.send(request).await.is_err() {
                            warn!("Nobody handles requests from {}, dropping", link.peer);
                        }
                    }
                    Ok(OcppMessage::CallResult(result)) => {
                        link.correlator.resolve(&link.peer, ResponseFrame::Result(result));
                    }
                    Ok(OcppMessage::CallError(error)) => {
                        link.correlator.resolve(&link.peer, ResponseFrame::Error(error));
                    }
                    Err(e) => {
                        warn!("Failed to parse OCPP message from {}: {}", link.peer, e);
                    }
                }
            }
            Some(Ok(Message::Close(_))) => break "closed by peer",
            Some(Ok(Message::Ping(_))) => {
                // Pong is sent by tungstenite
                debug!("Received ping from {}", link.peer);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket error from {}: {}", link.peer, e);
                break "transport error";
            }
            None => break "stream ended",
        }
    };

    link.shutdown(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{Action, CallResult, CorrelationId};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", "EK3-001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );

        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", "EK3-001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );
    }

    #[tokio::test]
    async fn test_dial_and_accept_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accepting side: a parent node serving CS001
        let parent_correlator = Arc::new(Correlator::new());
        let (parent_incoming, mut parent_requests) = mpsc::channel(8);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let channel = WebSocketChannel::accept(stream, parent_correlator, parent_incoming)
                .await
                .unwrap();

            let request = parent_requests.recv().await.unwrap();
            assert_eq!(request.peer, NodeId::new("CS001"));
            assert_eq!(request.call.action, Action::Heartbeat);
            let reply = CallResult::new(
                request.call.message_id.clone(),
                serde_json::json!({"currentTime": "2026-01-01T00:00:00Z"}),
            )
            .unwrap();
            request.responder.respond(ResponseFrame::Result(reply)).await.unwrap();
            channel
        });

        // Dialling side
        let correlator = Arc::new(Correlator::new());
        let (incoming, _requests) = mpsc::channel(8);
        let url = build_ocpp_url(&format!("ws://{}/ocpp", addr), "CS001");
        let channel = WebSocketChannel::connect(NodeId::csms(), &url, correlator.clone(), incoming)
            .await
            .unwrap();

        let call = Call::new(Action::Heartbeat, serde_json::json!({})).unwrap();
        let id: CorrelationId = call.message_id.clone();
        let response = correlator
            .dispatch(
                channel.as_ref(),
                id.clone(),
                Action::Heartbeat,
                call.to_bytes().unwrap(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(response.message_id(), &id);

        let server_side = server.await.unwrap();
        assert_eq!(server_side.peer(), &NodeId::new("CS001"));

        server_side.close();
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();
        assert!(!channel.is_open());
    }
}
