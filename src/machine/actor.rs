//! Kameo actor owning a [`ConnectionMachine`].
//!
//! The actor mailbox is the machine's serialization point: user commands arrive as
//! kameo messages, and a pump task forwards the machine's inbox (transport
//! notifications, timer firings, follow-up events) into the same mailbox.

use bytes::Bytes;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::clock::TokioClock;
use super::inbox::MachineInput;
use super::machine::ConnectionMachine;
use super::observer::{StateChange, StateObserver};
use super::transition::validate_url;
use crate::core::{
    ClientConfig, ConnectionState, Event, HealthStats, Priority, RejectReason, SendOutcome,
    StreamError, StreamResult,
};
use crate::transport::Transport;

/// Arguments passed when spawning a connection actor.
pub struct ConnectionActorArgs<T: Transport> {
    pub config: ClientConfig,
    pub transport: T,
    /// Receives the state after every transition.
    pub state_tx: watch::Sender<ConnectionState>,
    /// Receives every inbound payload.
    pub messages_tx: broadcast::Sender<Bytes>,
}

pub struct ConnectionActor<T: Transport> {
    machine: ConnectionMachine<T, TokioClock>,
    pump: Option<JoinHandle<()>>,
}

impl<T: Transport> Actor for ConnectionActor<T> {
    type Args = ConnectionActorArgs<T>;
    type Error = StreamError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> StreamResult<Self> {
        let ConnectionActorArgs {
            config,
            transport,
            state_tx,
            messages_tx,
        } = args;

        let (mut machine, mut inbox) =
            ConnectionMachine::new(config, transport, TokioClock::new())?;
        machine.subscribe(move |change: &StateChange| {
            state_tx.send_replace(change.to);
            if let Some(message) = &change.message {
                // No receivers is fine; payloads are also kept in the recent buffer.
                let _ = messages_tx.send(message.clone());
            }
        });

        let weak = actor_ref.downgrade();
        let pump = tokio::spawn(async move {
            while let Some(input) = inbox.recv().await {
                let Some(actor) = weak.upgrade() else {
                    break;
                };
                if actor.tell(Inbound(input)).send().await.is_err() {
                    break;
                }
            }
            debug!("connection inbox pump stopped");
        });

        Ok(Self {
            machine,
            pump: Some(pump),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> StreamResult<()> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.machine.dispatch(Event::Terminate {
            reason: Some("actor stopped".to_string()),
        });
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "ConnectionActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Inbox entry forwarded by the pump task.
#[derive(Debug)]
pub struct Inbound(pub MachineInput);

impl<T: Transport> KameoMessage<Inbound> for ConnectionActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: Inbound, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.machine.handle_input(msg.0);
    }
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub url: String,
    pub protocols: Vec<String>,
}

impl<T: Transport> KameoMessage<Connect> for ConnectionActor<T> {
    type Reply = StreamResult<ConnectionState>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        validate_url(&msg.url)?;
        let transition = self.machine.dispatch(Event::Connect {
            url: msg.url,
            protocols: msg.protocols,
        });
        if transition.from.is_terminal() {
            return Err(StreamError::Terminated);
        }
        if !transition.applied {
            return Err(StreamError::InvalidState(format!(
                "connect ignored while {}",
                transition.from
            )));
        }
        Ok(transition.to)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Disconnect {
    pub code: Option<u16>,
    pub reason: Option<String>,
    pub clear_queue: bool,
}

impl<T: Transport> KameoMessage<Disconnect> for ConnectionActor<T> {
    type Reply = StreamResult<ConnectionState>;

    async fn handle(
        &mut self,
        msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let transition = self.machine.dispatch(Event::Disconnect {
            code: msg.code,
            reason: msg.reason,
            clear_queue: msg.clear_queue,
        });
        if transition.from.is_terminal() {
            return Err(StreamError::Terminated);
        }
        Ok(transition.to)
    }
}

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub data: Bytes,
    pub priority: Priority,
}

impl<T: Transport> KameoMessage<SendMessage> for ConnectionActor<T> {
    type Reply = StreamResult<SendOutcome>;

    async fn handle(
        &mut self,
        msg: SendMessage,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let transition = self.machine.dispatch(Event::Send {
            data: msg.data,
            priority: msg.priority,
        });
        let outcome = transition
            .outcome
            .unwrap_or(SendOutcome::Rejected(RejectReason::NotConnected));
        if let SendOutcome::Rejected(reason) = outcome {
            debug!(state = %transition.from, reason = %reason, "outbound message rejected");
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Terminate {
    pub reason: Option<String>,
}

impl<T: Transport> KameoMessage<Terminate> for ConnectionActor<T> {
    type Reply = StreamResult<()>;

    async fn handle(
        &mut self,
        msg: Terminate,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if let Some(reason) = msg.reason.as_deref() {
            warn!(reason, "terminating stream client");
        }
        self.machine.dispatch(Event::Terminate { reason: msg.reason });
        Ok(())
    }
}

pub struct Subscribe(pub Box<dyn StateObserver>);

impl<T: Transport> KameoMessage<Subscribe> for ConnectionActor<T> {
    type Reply = StreamResult<()>;

    async fn handle(
        &mut self,
        msg: Subscribe,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.machine.subscribe_boxed(msg.0);
        Ok(())
    }
}

/// Read-only view of a client at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub state: ConnectionState,
    pub context: crate::core::Context,
    pub health: HealthStats,
    pub queued: usize,
    pub recent_messages: Vec<Bytes>,
}

pub struct GetSnapshot;

impl<T: Transport> KameoMessage<GetSnapshot> for ConnectionActor<T> {
    type Reply = StreamResult<ClientSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetSnapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(ClientSnapshot {
            state: self.machine.state(),
            context: self.machine.snapshot(),
            health: self.machine.health(),
            queued: self.machine.queued(),
            recent_messages: self.machine.recent_messages().cloned().collect(),
        })
    }
}
