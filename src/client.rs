//! User-facing handle over a [`ConnectionActor`].

use std::time::Duration;

use bytes::Bytes;
use kameo::Actor;
use kameo::error::SendError;
use kameo::prelude::ActorRef;
use tokio::sync::{broadcast, watch};

use crate::core::{
    ClientConfig, ConnectionMetrics, ConnectionState, Priority, SendOutcome, StreamError,
    StreamResult,
};
use crate::machine::{
    ClientSnapshot, Connect, ConnectionActor, ConnectionActorArgs, Disconnect, GetSnapshot,
    SendMessage, StateObserver, Subscribe, Terminate, validate_url,
};
use crate::transport::Transport;
use crate::transport::tungstenite::TungsteniteTransport;

fn map_send_error<M>(err: SendError<M, StreamError>) -> StreamError {
    match err {
        SendError::HandlerError(err) => err,
        _ => StreamError::ActorError("connection actor is not running".to_string()),
    }
}

/// Auto-reconnecting stream client.
///
/// Cheap to clone; all clones drive the same connection. The connection actor stops
/// (and terminates the connection) once the last clone is dropped.
pub struct StreamClient<T: Transport = TungsteniteTransport> {
    actor: ActorRef<ConnectionActor<T>>,
    state_rx: watch::Receiver<ConnectionState>,
    messages_tx: broadcast::Sender<Bytes>,
}

impl<T: Transport> Clone for StreamClient<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            state_rx: self.state_rx.clone(),
            messages_tx: self.messages_tx.clone(),
        }
    }
}

impl StreamClient<TungsteniteTransport> {
    /// Spawn a client over the default websocket transport.
    pub fn new(config: ClientConfig) -> StreamResult<Self> {
        Self::spawn(config, TungsteniteTransport::default())
    }
}

impl<T: Transport> StreamClient<T> {
    /// Spawn the connection actor. Must be called inside a tokio runtime.
    pub fn spawn(config: ClientConfig, transport: T) -> StreamResult<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (messages_tx, _) = broadcast::channel(config.inbound_buffer_capacity.max(1));
        let actor = ConnectionActor::spawn(ConnectionActorArgs {
            config,
            transport,
            state_tx,
            messages_tx: messages_tx.clone(),
        });
        Ok(Self {
            actor,
            state_rx,
            messages_tx,
        })
    }

    pub async fn connect(&self, url: impl Into<String>) -> StreamResult<ConnectionState> {
        self.connect_with_protocols(url, Vec::<String>::new()).await
    }

    /// Start connecting. Invalid URLs are rejected here and never reach the machine.
    pub async fn connect_with_protocols(
        &self,
        url: impl Into<String>,
        protocols: impl IntoIterator<Item = impl Into<String>>,
    ) -> StreamResult<ConnectionState> {
        let url = url.into();
        validate_url(&url)?;
        let protocols = protocols.into_iter().map(Into::into).collect();
        self.actor
            .ask(Connect { url, protocols })
            .await
            .map_err(map_send_error)
    }

    /// Graceful disconnect. Buffered outbound messages are kept for the next connection.
    pub async fn disconnect(
        &self,
        code: Option<u16>,
        reason: Option<String>,
    ) -> StreamResult<ConnectionState> {
        self.actor
            .ask(Disconnect {
                code,
                reason,
                clear_queue: false,
            })
            .await
            .map_err(map_send_error)
    }

    /// Graceful disconnect that also discards buffered outbound messages.
    pub async fn disconnect_and_clear(&self) -> StreamResult<ConnectionState> {
        self.actor
            .ask(Disconnect {
                code: None,
                reason: None,
                clear_queue: true,
            })
            .await
            .map_err(map_send_error)
    }

    pub async fn send(
        &self,
        data: impl Into<Bytes>,
        priority: Priority,
    ) -> StreamResult<SendOutcome> {
        self.actor
            .ask(SendMessage {
                data: data.into(),
                priority,
            })
            .await
            .map_err(map_send_error)
    }

    /// Move to the absorbing terminated state. Always succeeds, including repeat calls.
    pub async fn terminate(&self, reason: Option<String>) -> StreamResult<()> {
        self.actor
            .ask(Terminate { reason })
            .await
            .map_err(map_send_error)
    }

    pub async fn subscribe(&self, observer: impl StateObserver) -> StreamResult<()> {
        self.actor
            .ask(Subscribe(Box::new(observer)))
            .await
            .map_err(map_send_error)
    }

    /// State after the most recent transition.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the client reaches `target`, or fail after `timeout`.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> StreamResult<()> {
        let mut rx = self.state_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(StreamError::ActorError(
                "connection actor is not running".to_string(),
            )),
            Err(_) => Err(StreamError::InvalidState(format!(
                "still {} after {timeout:?}, expected {target}",
                self.state()
            ))),
        }
    }

    /// Received payloads, delivered in arrival order. Slow receivers observe lag.
    pub fn messages(&self) -> broadcast::Receiver<Bytes> {
        self.messages_tx.subscribe()
    }

    pub async fn snapshot(&self) -> StreamResult<ClientSnapshot> {
        self.actor.ask(GetSnapshot).await.map_err(map_send_error)
    }

    pub async fn metrics(&self) -> StreamResult<ConnectionMetrics> {
        Ok(self.snapshot().await?.context.metrics)
    }

    /// Most recently received payloads, oldest first.
    pub async fn recent_messages(&self) -> StreamResult<Vec<Bytes>> {
        Ok(self.snapshot().await?.recent_messages)
    }
}
