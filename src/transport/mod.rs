use bytes::Bytes;

use crate::core::ConnectionId;
use crate::machine::TransportEvents;

pub mod tungstenite;

/// Connection factory consumed by the machine.
///
/// `open` is fire-and-forget: it returns a handle immediately and reports the outcome
/// (`Open`, `Error`, `Close`) later through `events`. Implementations must never block.
pub trait Transport: Send + 'static {
    type Handle: TransportHandle;

    fn open(
        &mut self,
        id: ConnectionId,
        url: &str,
        protocols: &[String],
        events: TransportEvents,
    ) -> Self::Handle;
}

/// One opened connection. Dropping the handle releases it.
pub trait TransportHandle: Send + 'static {
    fn send(&mut self, data: Bytes);

    /// Ask the peer to close; the outcome arrives as a `Close` notification.
    fn close(&mut self, code: u16, reason: &str);

    /// Tear the connection down immediately, without a closing handshake.
    fn terminate(&mut self);

    /// Send a liveness probe answered by a `Pong` notification.
    /// Returns false when the transport has no probe support.
    fn probe(&mut self) -> bool {
        false
    }
}
