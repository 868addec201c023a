//! Structured observability surface: one `Event` per listener/connection
//! transition, plus the sortable correlation id attached to every connection.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::Stream;
use tokio::sync::mpsc::Receiver;

use crate::connection::WsWriter;
use crate::error::{CloseCode, Error};
use crate::message::Message;

const CROCKFORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// A 13-character Crockford base32 id, lexicographically sortable by
/// creation order: the high bits come from a wall-clock-seeded millisecond
/// counter, the low bits from a per-process monotonic sequence.
///
/// This replaces a random UUID (see DESIGN.md): random ids are not sortable,
/// and correlating connections by creation order in logs is the whole point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64, u32);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(millis, sequence as u32)
    }

    /// Encodes as 13 Crockford base32 characters: 9 for the millisecond
    /// timestamp (45 bits, plenty until the year 3084) plus 4 for the
    /// sequence counter (20 bits).
    pub fn to_sortable_string(self) -> String {
        let combined: u64 = (self.0 << 20) | (self.1 as u64 & 0xF_FFFF);
        let mut out = [0u8; 13];
        for (i, slot) in out.iter_mut().enumerate().rev() {
            let shift = (12 - i) * 5;
            let index = ((combined >> shift) & 0x1F) as usize;
            *slot = CROCKFORD_ALPHABET[index];
        }
        String::from_utf8(out.to_vec()).expect("crockford alphabet is ASCII")
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sortable_string())
    }
}

/// One observable occurrence, emitted at the transitions named in the
/// external interfaces: listener lifecycle, per-connection lifecycle,
/// message traffic, and errors.
#[derive(Debug)]
pub enum Event {
    ListenerStarted { local_addr: SocketAddr },
    ListenerStopped,
    /// Carries the writer half, since this is the only place a consumer gets
    /// a handle to reply on this connection (see DESIGN.md).
    ConnectionOpened { id: ConnectionId, peer_addr: SocketAddr, compression: bool, writer: WsWriter },
    MessageReceived { id: ConnectionId, message: Message },
    MessageSent { id: ConnectionId, opcode_name: &'static str, len: usize, compressed: bool },
    ConnectionClosing { id: ConnectionId, code: CloseCode },
    ConnectionClosed { id: ConnectionId },
    ConnectionAborted { id: ConnectionId, error: Error },
}

/// Adapts the server's `mpsc::Receiver<Event>` into a `Stream`, so consumers
/// don't need to interact with the channel directly.
pub struct EventStream {
    receiver: Receiver<Event>,
}

impl EventStream {
    pub fn new(receiver: Receiver<Event>) -> Self {
        Self { receiver }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_sort_in_creation_order() {
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        assert!(first.to_sortable_string() <= second.to_sortable_string());
    }

    #[test]
    fn sortable_string_is_exactly_13_chars() {
        let id = ConnectionId::new();
        assert_eq!(id.to_sortable_string().len(), 13);
    }
}
