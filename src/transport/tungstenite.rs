use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{
    Connector, connect_async_tls_with_config,
    tungstenite::{
        Error as WsError, Message as TungsteniteMessage, Utf8Bytes,
        client::IntoClientRequest,
        handshake::client::Request,
        protocol::{CloseFrame, WebSocketConfig},
    },
};
use tracing::debug;

use crate::core::{CLOSE_ABNORMAL, ConnectionId, ErrorCategory, ErrorCause, Event};
use crate::machine::TransportEvents;
use crate::transport::{Transport, TransportHandle};

/// Close code reported when the peer's close frame carried no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// rustls 0.23 requires a process-level CryptoProvider selection.
///
/// If multiple dependencies enable both `rustls` providers (`ring` and `aws-lc-rs`),
/// rustls cannot infer a default and will panic during the first TLS config build.
fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Another part of the process may already have installed one; that's fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Websocket transport over `tokio-tungstenite`.
///
/// Each `open` spawns one IO task that owns the socket. The machine talks to it through
/// a command channel and hears back through [`TransportEvents`].
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
    config: Option<WebSocketConfig>,
}

impl TungsteniteTransport {
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
            config: None,
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }

    /// Cap inbound message and frame sizes.
    pub fn with_max_message_bytes(mut self, max_message: usize) -> Self {
        let config = self
            .config
            .unwrap_or_default()
            .max_message_size(Some(max_message))
            .max_frame_size(Some(max_message));
        self.config = Some(config);
        self
    }
}

impl Transport for TungsteniteTransport {
    type Handle = TungsteniteHandle;

    fn open(
        &mut self,
        id: ConnectionId,
        url: &str,
        protocols: &[String],
        events: TransportEvents,
    ) -> Self::Handle {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            url.to_string(),
            protocols.to_vec(),
            self.connector.clone(),
            self.config.clone(),
            events,
            rx,
        ));
        debug!(connection = %id, url, "spawned websocket io task");
        TungsteniteHandle {
            commands,
            task: task.abort_handle(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(Bytes),
    Probe,
    Close { code: u16, reason: String },
}

/// Handle to one websocket IO task.
///
/// Dropping it closes the command channel; the task then closes the socket and exits.
pub struct TungsteniteHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: AbortHandle,
}

impl TransportHandle for TungsteniteHandle {
    fn send(&mut self, data: Bytes) {
        let _ = self.commands.send(Command::Send(data));
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn terminate(&mut self) {
        self.task.abort();
    }

    fn probe(&mut self) -> bool {
        self.commands.send(Command::Probe).is_ok()
    }
}

fn build_request(url: &str, protocols: &[String]) -> Result<Request, ErrorCause> {
    let mut request = url
        .into_client_request()
        .map_err(|err| classify_ws_error(&err))?;
    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|err| ErrorCause::protocol(format!("invalid subprotocol list: {err}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    Ok(request)
}

/// Map a tungstenite failure onto the recovery taxonomy.
pub fn classify_ws_error(err: &WsError) -> ErrorCause {
    let category = match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            ErrorCategory::Network
        }
        WsError::Capacity(_) => ErrorCategory::Resource,
        WsError::Protocol(_) | WsError::Url(_) | WsError::HttpFormat(_) => {
            ErrorCategory::Protocol
        }
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 429 || status.as_u16() == 503 {
                ErrorCategory::Resource
            } else if status.is_server_error() {
                ErrorCategory::Network
            } else {
                ErrorCategory::Application
            }
        }
        _ => ErrorCategory::Network,
    };
    ErrorCause::new(category, err.to_string())
}

fn to_message(data: Bytes) -> TungsteniteMessage {
    match std::str::from_utf8(data.as_ref()) {
        Ok(_) => {
            let text = unsafe { Utf8Bytes::from_bytes_unchecked(data) };
            TungsteniteMessage::Text(text)
        }
        Err(_) => TungsteniteMessage::Binary(data),
    }
}

fn close_frame(code: u16, reason: String) -> CloseFrame {
    CloseFrame {
        code: code.into(),
        reason: Utf8Bytes::from(reason),
    }
}

/// Resolves once the handle asks to close or goes away before the socket opened.
async fn cancelled(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Close { .. }) | None => return,
            // Nothing can be written yet; the machine never sends before Open.
            Some(Command::Send(_)) | Some(Command::Probe) => {}
        }
    }
}

async fn run_connection(
    url: String,
    protocols: Vec<String>,
    connector: Option<Connector>,
    config: Option<WebSocketConfig>,
    events: TransportEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    install_rustls_crypto_provider();

    let request = match build_request(&url, &protocols) {
        Ok(request) => request,
        Err(cause) => {
            events.emit(Event::error(cause, Instant::now()));
            return;
        }
    };

    let connect = connect_async_tls_with_config(request, config, false, connector);
    let stream = tokio::select! {
        result = connect => match result {
            Ok((stream, _response)) => stream,
            Err(err) => {
                events.emit(Event::error(classify_ws_error(&err), Instant::now()));
                return;
            }
        },
        _ = cancelled(&mut commands) => {
            debug!(connection = %events.connection(), "connect abandoned before open");
            return;
        }
    };

    events.emit(Event::Open {
        timestamp: Instant::now(),
    });

    let (mut write, mut read) = stream.split();
    let mut probe_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(data)) => {
                    if let Err(err) = write.send(to_message(data)).await {
                        events.emit(Event::error(classify_ws_error(&err), Instant::now()));
                        return;
                    }
                }
                Some(Command::Probe) => {
                    probe_sent = Some(Instant::now());
                    if let Err(err) = write.send(TungsteniteMessage::Ping(Bytes::new())).await {
                        events.emit(Event::error(classify_ws_error(&err), Instant::now()));
                        return;
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = close_frame(code, reason);
                    if write.send(TungsteniteMessage::Close(Some(frame))).await.is_err() {
                        events.emit(Event::Close {
                            code: CLOSE_ABNORMAL,
                            reason: "close handshake failed".to_string(),
                            was_clean: false,
                        });
                        return;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    events.emit(Event::Message {
                        data: AsRef::<Bytes>::as_ref(&text).clone(),
                        timestamp: Instant::now(),
                    });
                }
                Some(Ok(TungsteniteMessage::Binary(data))) => {
                    events.emit(Event::Message {
                        data,
                        timestamp: Instant::now(),
                    });
                }
                Some(Ok(TungsteniteMessage::Pong(_))) => {
                    if let Some(sent) = probe_sent.take() {
                        let now = Instant::now();
                        events.emit(Event::Pong {
                            timestamp: now,
                            latency: now.saturating_duration_since(sent),
                        });
                    }
                }
                Some(Ok(TungsteniteMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    // Push out the queued close reply.
                    let _ = write.flush().await;
                    events.emit(Event::Close {
                        code,
                        reason,
                        was_clean: true,
                    });
                    return;
                }
                Some(Ok(TungsteniteMessage::Ping(_) | TungsteniteMessage::Frame(_))) => {}
                Some(Err(err)) => {
                    events.emit(Event::error(classify_ws_error(&err), Instant::now()));
                    return;
                }
                None => {
                    events.emit(Event::Close {
                        code: CLOSE_ABNORMAL,
                        reason: "connection dropped".to_string(),
                        was_clean: false,
                    });
                    return;
                }
            }
        }
    }
}
