use crate::pending::{PendingTable, Reply};
use figlink_core::{
    decode_frame, encode_frame,
    wire::{CONNECTED, PING, PONG},
    Envelope, RelayError,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;

/// Builds `<base>/ws/<connection_id>`, keeping a base that already ends in
/// `/ws`.
pub fn endpoint_url(base: &Url, connection_id: &str) -> Result<Url, RelayError> {
    let invalid = || RelayError::ConnectionFailed(format!("hub url '{base}' cannot carry a path"));
    let mut url = base.clone();
    url.path_segments_mut().map_err(|_| invalid())?.pop_if_empty();
    let ends_in_ws = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|last| last == "ws");
    {
        let mut segments = url.path_segments_mut().map_err(|_| invalid())?;
        if !ends_in_ws {
            segments.push("ws");
        }
        segments.push(connection_id);
    }
    Ok(url)
}

/// Write side of a link, cheap to clone into request paths.
#[derive(Clone, Debug)]
pub struct LinkSender {
    generation: u64,
    max_frame_bytes: usize,
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

impl LinkSender {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if !self.is_open() {
            return Err(RelayError::ConnectionClosed);
        }
        let text = encode_frame(envelope, self.max_frame_bytes)?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Registers `envelope`'s request id, sends it and waits for the
    /// correlated reply.
    pub async fn request(
        &self,
        pending: &PendingTable,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Reply {
        let request_id = envelope
            .request_id
            .clone()
            .ok_or_else(|| RelayError::ProtocolError("request without requestId".into()))?;
        let rx = pending.insert(request_id.clone(), self.generation);
        // The reader marks the link closed before failing its requests, so an
        // entry inserted after that sweep is caught here.
        if !self.is_open() {
            pending.evict(&request_id);
            return Err(RelayError::ConnectionClosed);
        }
        if let Err(err) = self.send(&envelope).await {
            pending.evict(&request_id);
            return Err(err);
        }
        pending.wait(&request_id, rx, timeout).await
    }

    fn queue_close(&self) {
        let _ = self.outbound.try_send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client_disconnect".into(),
        })));
    }
}

/// One established websocket connection to the hub.
pub struct Link {
    sender: LinkSender,
    pending: PendingTable,
    closed_rx: watch::Receiver<bool>,
}

impl Link {
    /// Dials `url` and waits for the hub's `connected` greeting. A hub that
    /// closes the socket instead (a rejected newcomer) is a connection failure.
    pub async fn open(
        url: &Url,
        generation: u64,
        connect_timeout: Duration,
        max_frame_bytes: usize,
        pending: PendingTable,
        events: broadcast::Sender<Envelope>,
    ) -> Result<(Link, Envelope), RelayError> {
        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| RelayError::ConnectionFailed(format!("timed out dialing {url}")))?
            .map_err(|err| RelayError::ConnectionFailed(err.to_string()))?;
        let (mut write, mut read) = ws.split();

        let greeting = tokio::time::timeout(
            connect_timeout,
            await_greeting(&mut read, max_frame_bytes),
        )
        .await
        .map_err(|_| RelayError::ConnectionFailed("hub sent no greeting".into()))??;

        let (outbound, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = watch::channel(false);
        let sender = LinkSender {
            generation,
            max_frame_bytes,
            outbound,
            closed: closed.clone(),
        };

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || is_close {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_sender = sender.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            read_loop(read, &reader_sender, &reader_pending, &events).await;
            closed.store(true, Ordering::SeqCst);
            let rejected = reader_pending.fail_link(generation, RelayError::ConnectionClosed);
            let _ = closed_tx.send(true);
            info!(event = "link_closed", generation = generation, rejected = rejected);
        });

        debug!(event = "link_open", url = %url, generation = generation);
        Ok((
            Link {
                sender,
                pending,
                closed_rx,
            },
            greeting,
        ))
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    pub fn generation(&self) -> u64 {
        self.sender.generation
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// Closes the socket and rejects every request sent over it.
    pub fn close(&self) {
        self.sender.closed.store(true, Ordering::SeqCst);
        self.sender.queue_close();
        self.pending
            .fail_link(self.sender.generation, RelayError::ConnectionClosed);
    }

    /// Resolves once the reader has stopped.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if !self.sender.closed.load(Ordering::SeqCst) {
            self.close();
        }
    }
}

async fn await_greeting(
    read: &mut SplitStream<WsStream>,
    max_frame_bytes: usize,
) -> Result<Envelope, RelayError> {
    while let Some(frame) = read.next().await {
        match frame.map_err(|err| RelayError::ConnectionFailed(err.to_string()))? {
            Message::Text(text) => {
                let envelope = decode_frame(text.as_bytes(), max_frame_bytes)?;
                if envelope.kind == CONNECTED {
                    return Ok(envelope);
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|frame| frame.reason.to_string())
                    .unwrap_or_default();
                return Err(RelayError::ConnectionFailed(format!(
                    "hub closed the connection: {reason}"
                )));
            }
            _ => {}
        }
    }
    Err(RelayError::ConnectionFailed(
        "hub closed before the greeting".into(),
    ))
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    sender: &LinkSender,
    pending: &PendingTable,
    events: &broadcast::Sender<Envelope>,
) {
    while let Some(frame) = read.next().await {
        let msg = match frame {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "link_read_error", generation = sender.generation, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            _ => continue,
        };
        let envelope = match decode_frame(&data, sender.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", generation = sender.generation, error = %err);
                continue;
            }
        };
        match envelope.kind.as_str() {
            PING => {
                if let Err(err) = sender.send(&Envelope::pong()).await {
                    debug!(event = "pong_failed", error = %err);
                }
                continue;
            }
            PONG => continue,
            _ => {}
        }
        if let Some(unmatched) = pending.resolve(envelope) {
            let _ = events.send(unmatched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_appends_ws_and_escapes_the_id() {
        let base = Url::parse("ws://127.0.0.1:3055").expect("url");
        assert_eq!(
            endpoint_url(&base, "mcp_abc").expect("url").as_str(),
            "ws://127.0.0.1:3055/ws/mcp_abc"
        );
        let with_ws = Url::parse("ws://127.0.0.1:3055/ws/").expect("url");
        assert_eq!(
            endpoint_url(&with_ws, "plugin_abc_device_1").expect("url").as_str(),
            "ws://127.0.0.1:3055/ws/plugin_abc_device_1"
        );
        let prefixed = Url::parse("wss://relay.example/figma").expect("url");
        assert_eq!(
            endpoint_url(&prefixed, "a/b").expect("url").as_str(),
            "wss://relay.example/figma/ws/a%2Fb"
        );
    }

    #[test]
    fn endpoint_url_rejects_opaque_bases() {
        let base = Url::parse("mailto:someone@example.com").expect("url");
        assert!(matches!(
            endpoint_url(&base, "mcp_abc"),
            Err(RelayError::ConnectionFailed(_))
        ));
    }
}
