//! Connection lifecycle: the receive loop, control-frame handling, the close
//! handshake, and serialized sends over one negotiated socket.
//!
//! A connection is always used split: [`WsReader`] owns the read half and
//! drives the receive loop, [`WsWriter`] is a cheap, cloneable handle that
//! can send or initiate a close from any task. This lets the close handshake
//! run concurrently with an in-progress receive, which a single `&mut self`
//! type could not express.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::buffer::deflate::DeflateContext;
use crate::buffer::pool::SegmentPool;
use crate::buffer::recv::RecvBuffer;
use crate::buffer::send::SendBuffer;
use crate::codec::{decode_header, FrameHeader};
use crate::config::WebSocketConfig;
use crate::error::{CloseCode, Error};
use crate::event::ConnectionId;
use crate::frame::OpCode;
use crate::message::{CloseReason, Message};
use crate::stream::{Prefixed, WsStream};

/// Where a connection is in its lifecycle. There is no `None`/`Connecting`
/// variant: a connection only exists once the handshake has completed, so
/// `Open` is the initial state. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Closing,
    Closed,
    Aborted,
}

/// Which side of the handshake this connection is on, and what was
/// negotiated. Set once at construction, immutable thereafter.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub server: bool,
    pub compression: bool,
}

struct Inner {
    state: State,
    close_sent: bool,
    close_received: bool,
}

/// Everything a reader and writer half share: the serialized write path, the
/// lazily-built compression context, and the state machine.
struct Shared {
    id: ConnectionId,
    flags: Flags,
    config: WebSocketConfig,
    pool: &'static SegmentPool,
    inner: AsyncMutex<Inner>,
    codec: Option<AsyncMutex<DeflateContext>>,
    /// Per-connection PRNG for client-side masking, seeded from the OS at
    /// handshake time (see DESIGN.md: this replaces a single lock-guarded
    /// process-global PRNG, since a seeded-per-connection source needs no
    /// shared lock on the hot path).
    mask_rng: Option<std::sync::Mutex<StdRng>>,
    write_half: AsyncMutex<WriteHalf<WsStream>>,
    notify: Notify,
}

impl Shared {
    async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    async fn mark_close_received(&self) {
        self.inner.lock().await.close_received = true;
    }

    /// Moves to `new_state` if that's a change, firing `notify` off the
    /// calling task so a waiter's continuation never runs on the
    /// state-changing call stack. Entering `Closed` or `Aborted` also closes
    /// the underlying transport here, exactly once, regardless of which call
    /// site drove the transition.
    async fn transition(self: &Arc<Self>, new_state: State) {
        let mut inner = self.inner.lock().await;
        if inner.state == new_state {
            return;
        }
        inner.state = new_state;
        drop(inner);

        if matches!(new_state, State::Closed | State::Aborted) {
            let mut write_half = self.write_half.lock().await;
            let _ = write_half.shutdown().await;
            drop(write_half);

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.notify.notify_waiters();
            });
        }
    }

    fn next_mask(&self) -> Option<[u8; 4]> {
        self.mask_rng.as_ref().map(|rng| rng.lock().expect("mask rng poisoned").random())
    }

    /// `closeAsync`: composes and sends a close frame iff still `Open`; a
    /// no-op otherwise.
    async fn close(self: &Arc<Self>, code: CloseCode, description: String) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != State::Open {
                return Ok(());
            }
            inner.state = State::Closing;
            inner.close_sent = true;
        }
        self.send_frame(Message::Close(Some(CloseReason::new(code, description)))).await
    }

    /// The public send path: rejects anything but `Open`.
    async fn send_message(&self, message: Message) -> Result<(), Error> {
        if self.state().await != State::Open {
            return Err(Error::ConnectionNotOpen);
        }
        self.send_frame(message).await
    }

    /// Builds and writes one wire frame for `message` unconditionally. Used
    /// both for regular sends and for control frames the state machine
    /// writes itself (pong replies, close frames) regardless of state.
    async fn send_frame(&self, message: Message) -> Result<(), Error> {
        let opcode = match &message {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(_) => OpCode::Close,
        };
        let payload = message.as_bytes();
        let will_compress = self.codec.is_some() && opcode.is_data();

        let mut buf = SendBuffer::new(opcode, will_compress);
        buf.write(self.pool, &payload)?;

        let mask = self.next_mask();
        let framed = match &self.codec {
            Some(codec) if will_compress => {
                let mut codec = codec.lock().await;
                buf.finalize(self.pool, mask, Some(&mut codec))?
            }
            _ => buf.finalize(self.pool, mask, None)?,
        };

        let mut write_half = self.write_half.lock().await;
        framed.write_to(&mut *write_half, self.pool).await?;
        write_half.flush().await?;
        Ok(())
    }
}

/// Owns the read half; drives the receive loop. Not `Clone` — only one
/// receive may be outstanding per connection, and this is enforced at
/// compile time rather than with a runtime guard, since there is exactly one
/// `WsReader` per connection.
pub struct WsReader {
    shared: Arc<Shared>,
    read_half: BufReader<Prefixed<ReadHalf<WsStream>>>,
    in_progress: Option<RecvBuffer>,
}

/// A cheap, cloneable handle for sending and for initiating a close. Safe to
/// hand to multiple tasks; sends are serialized through the shared write lock.
#[derive(Clone)]
pub struct WsWriter {
    shared: Arc<Shared>,
}

/// Splits a negotiated stream into a reader/writer pair. `flags` and
/// `config` come from the handshake that produced `stream`. `leftover` is
/// any bytes the handshake's header reader pulled from the socket past the
/// end of the request/response it was parsing.
pub fn new_connection(
    stream: WsStream,
    flags: Flags,
    config: WebSocketConfig,
    leftover: Vec<u8>,
) -> (WsReader, WsWriter) {
    let (read_half, write_half) = tokio::io::split(stream);

    let codec = flags
        .compression
        .then(|| AsyncMutex::new(DeflateContext::new(flags.server, 15, 15, false, false)));
    let mask_rng = (!flags.server).then(|| std::sync::Mutex::new(StdRng::from_os_rng()));

    let shared = Arc::new(Shared {
        id: ConnectionId::new(),
        flags,
        config,
        pool: SegmentPool::global(),
        inner: AsyncMutex::new(Inner { state: State::Open, close_sent: false, close_received: false }),
        codec,
        mask_rng,
        write_half: AsyncMutex::new(write_half),
        notify: Notify::new(),
    });

    let reader = WsReader {
        shared: Arc::clone(&shared),
        read_half: BufReader::new(Prefixed::new(leftover, read_half)),
        in_progress: None,
    };
    let writer = WsWriter { shared };
    (reader, writer)
}

impl WsReader {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Reads and assembles the next complete message, handling ping/pong
    /// replies and the close handshake internally. On any error the
    /// connection transitions to `Aborted`; protocol errors attempt a
    /// best-effort close frame first, I/O-class errors do not (the socket is
    /// already broken).
    pub async fn receive(&mut self) -> Result<Message, Error> {
        loop {
            match self.receive_step().await {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => continue,
                Err(e) => {
                    if !e.is_io_class() {
                        if let Some(code) = e.protocol_close_code() {
                            let _ = self.shared.send_frame(Message::Close(Some(CloseReason::new(code, "")))).await;
                        }
                    }
                    self.shared.transition(State::Aborted).await;
                    return Err(e);
                }
            }
        }
    }

    async fn receive_step(&mut self) -> Result<Option<Message>, Error> {
        let header = self.read_header().await?;
        self.validate_mask_direction(&header)?;
        if header.payload_len as usize > self.shared.config.max_frame_size {
            return Err(Error::MaxFrameSize);
        }
        self.dispatch_header(header).await
    }

    async fn read_header(&mut self) -> Result<FrameHeader, Error> {
        match decode_header(&mut self.read_half).await {
            Ok(header) => Ok(header),
            // A clean EOF here means the peer dropped the TCP connection
            // without ever sending a Close frame: a protocol violation, not
            // a graceful shutdown.
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::AbruptDisconnect)
            }
            Err(e) => Err(e),
        }
    }

    fn validate_mask_direction(&self, header: &FrameHeader) -> Result<(), Error> {
        if self.shared.flags.server && !header.masked {
            Err(Error::UnmaskedClientFrame)
        } else if !self.shared.flags.server && header.masked {
            Err(Error::MaskedServerFrame)
        } else {
            Ok(())
        }
    }

    async fn read_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>, Error> {
        let mut payload = vec![0u8; header.payload_len as usize];
        self.read_half.read_exact(&mut payload).await?;
        if let Some(mask) = header.mask {
            crate::codec::mask_unmask(mask, 0, &mut payload);
        }
        Ok(payload)
    }

    async fn dispatch_header(&mut self, header: FrameHeader) -> Result<Option<Message>, Error> {
        if self.in_progress.is_some() {
            return match header.opcode {
                OpCode::Continuation => {
                    let payload = self.read_payload(&header).await?;
                    let mut buf = self.in_progress.take().expect("checked Some above");
                    buf.push(self.shared.pool, &payload)?;
                    if header.fin {
                        Ok(Some(self.finish_message(buf).await?))
                    } else {
                        self.in_progress = Some(buf);
                        Ok(None)
                    }
                }
                // Any non-continuation frame while a message is in progress
                // is a protocol violation; control frames cannot interleave
                // with fragments in this engine (see DESIGN.md).
                _ => Err(Error::InvalidFrameFragmentation),
            };
        }

        match header.opcode {
            OpCode::Ping => {
                let payload = self.read_payload(&header).await?;
                if !payload.is_empty() {
                    return Err(Error::ControlFramePayloadSize);
                }
                self.shared.send_frame(Message::Pong(Bytes::new())).await?;
                Ok(None)
            }
            OpCode::Pong => {
                let _ = self.read_payload(&header).await?;
                Ok(None)
            }
            OpCode::Close => {
                let payload = self.read_payload(&header).await?;
                let reason = CloseReason::from_payload(&payload)?;
                Ok(Some(self.handle_peer_close(reason).await?))
            }
            OpCode::Text | OpCode::Binary => {
                let mut buf = RecvBuffer::new(header.opcode, header.compressed, self.shared.config.max_message_size);
                let payload = self.read_payload(&header).await?;
                buf.push(self.shared.pool, &payload)?;
                if header.fin {
                    Ok(Some(self.finish_message(buf).await?))
                } else {
                    self.in_progress = Some(buf);
                    Ok(None)
                }
            }
            OpCode::Continuation => Err(Error::InvalidContinuationFrame),
        }
    }

    async fn finish_message(&mut self, buf: RecvBuffer) -> Result<Message, Error> {
        match &self.shared.codec {
            Some(codec) => {
                let mut codec = codec.lock().await;
                buf.finish(self.shared.pool, Some(&mut codec))
            }
            None => buf.finish(self.shared.pool, None),
        }
    }

    /// Handles a received Close frame. If we're `Open`, this is peer-initiated:
    /// reflect it back with no description and shut the write side down once
    /// that reflected frame is on the wire. If we're `Closing`, this is the
    /// peer's reply to our own `closeAsync` and simply completes the handshake.
    async fn handle_peer_close(&mut self, reason: Option<CloseReason>) -> Result<Message, Error> {
        self.shared.mark_close_received().await;
        match self.shared.state().await {
            State::Open => {
                self.shared.transition(State::Closing).await;
                let echo_code = reason.as_ref().map(|r| r.code).unwrap_or(CloseCode::NormalClosure);
                self.shared.send_frame(Message::Close(Some(CloseReason::new(echo_code, "")))).await?;
                // `transition` itself closes the write half once the
                // reflected frame is on the wire (see DESIGN.md Open
                // Question (a)).
                self.shared.transition(State::Closed).await;
            }
            State::Closing => {
                self.shared.transition(State::Closed).await;
            }
            State::Closed | State::Aborted => {}
        }
        Ok(Message::Close(reason))
    }
}

impl std::fmt::Debug for WsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriter").field("id", &self.shared.id).finish()
    }
}

impl WsWriter {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn compression(&self) -> bool {
        self.shared.flags.compression
    }

    pub async fn state(&self) -> State {
        self.shared.state().await
    }

    /// Sends one message. Rejected once the connection is no longer `Open`;
    /// use [`WsWriter::close`] to initiate the close handshake instead of
    /// sending a `Message::Close` directly.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.shared.send_message(message).await
    }

    /// `closeAsync`: starts the graceful close handshake. A no-op if the
    /// connection isn't `Open`. The handshake completes once the peer's
    /// Close frame reaches the reader loop (or the reader is dropped without
    /// ever seeing it, leaving the connection `Closing` forever — callers
    /// that need a hard deadline should race [`WsWriter::closed`] against a
    /// timeout).
    pub async fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), Error> {
        self.shared.close(code, reason.into()).await
    }

    /// Resolves once the connection reaches `Closed` or `Aborted`.
    pub async fn closed(&self) {
        loop {
            if matches!(self.shared.state().await, State::Closed | State::Aborted) {
                return;
            }
            let notified = self.shared.notify.notified();
            if matches!(self.shared.state().await, State::Closed | State::Aborted) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (WsStream, WsStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (WsStream::Plain(server), WsStream::Plain(client))
    }

    #[tokio::test]
    async fn client_and_server_exchange_a_text_message() {
        let (server_stream, client_stream) = loopback_pair().await;
        let (mut server_reader, server_writer) =
            new_connection(server_stream, Flags { server: true, compression: false }, WebSocketConfig::default(), Vec::new());
        let (mut client_reader, client_writer) =
            new_connection(client_stream, Flags { server: false, compression: false }, WebSocketConfig::default(), Vec::new());

        client_writer.send(Message::text("Hello")).await.unwrap();
        let received = server_reader.receive().await.unwrap();
        assert_eq!(received, Message::text("Hello"));

        server_writer.send(received).await.unwrap();
        let echoed = client_reader.receive().await.unwrap();
        assert_eq!(echoed, Message::text("Hello"));
    }

    #[tokio::test]
    async fn fragmented_text_message_is_reassembled() {
        let (server_stream, client_stream) = loopback_pair().await;
        let (mut server_reader, _server_writer) =
            new_connection(server_stream, Flags { server: true, compression: false }, WebSocketConfig::default(), Vec::new());
        let (_client_reader, client_writer) =
            new_connection(client_stream, Flags { server: false, compression: false }, WebSocketConfig::default(), Vec::new());

        // Manually frame two fragments, bypassing the single-frame send path,
        // to exercise the receive side's reassembly.
        let mut first = SendBuffer::new(OpCode::Text, false);
        first.write(client_writer.shared.pool, b"Hel").unwrap();
        let mask = client_writer.shared.next_mask();
        let mut header_buf = [0u8; crate::frame::HEADER_RESERVE];
        let offset =
            crate::codec::encode_header_into(&mut header_buf, false, false, OpCode::Text, 3, mask);
        let mut wire = header_buf[offset..].to_vec();
        let mut masked = b"Hel".to_vec();
        if let Some(mask) = mask {
            crate::codec::mask_unmask(mask, 0, &mut masked);
        }
        wire.extend_from_slice(&masked);

        let second_mask = client_writer.shared.next_mask();
        let mut second_header = [0u8; crate::frame::HEADER_RESERVE];
        let second_offset =
            crate::codec::encode_header_into(&mut second_header, true, false, OpCode::Continuation, 2, second_mask);
        let mut second_wire = second_header[second_offset..].to_vec();
        let mut second_masked = b"lo".to_vec();
        if let Some(mask) = second_mask {
            crate::codec::mask_unmask(mask, 0, &mut second_masked);
        }
        second_wire.extend_from_slice(&second_masked);

        {
            let mut write_half = client_writer.shared.write_half.lock().await;
            write_half.write_all(&wire).await.unwrap();
            write_half.write_all(&second_wire).await.unwrap();
        }

        let message = server_reader.receive().await.unwrap();
        assert_eq!(message, Message::text("Hello"));
    }

    #[tokio::test]
    async fn graceful_close_reaches_closed_on_both_sides() {
        let (server_stream, client_stream) = loopback_pair().await;
        let (mut server_reader, server_writer) =
            new_connection(server_stream, Flags { server: true, compression: false }, WebSocketConfig::default(), Vec::new());
        let (mut client_reader, client_writer) =
            new_connection(client_stream, Flags { server: false, compression: false }, WebSocketConfig::default(), Vec::new());

        server_writer.close(CloseCode::NormalClosure, "bye").await.unwrap();

        let on_client = client_reader.receive().await.unwrap();
        assert!(on_client.is_close());
        client_writer.closed().await;

        let on_server = server_reader.receive().await.unwrap();
        assert!(on_server.is_close());
        server_writer.closed().await;
    }

    #[tokio::test]
    async fn unmasked_client_frame_is_rejected() {
        let (server_stream, client_stream) = loopback_pair().await;
        let (mut server_reader, _server_writer) =
            new_connection(server_stream, Flags { server: true, compression: false }, WebSocketConfig::default(), Vec::new());
        let (_client_reader, client_writer) =
            new_connection(client_stream, Flags { server: false, compression: false }, WebSocketConfig::default(), Vec::new());

        let mut header_buf = [0u8; crate::frame::HEADER_RESERVE];
        let offset = crate::codec::encode_header_into(&mut header_buf, true, false, OpCode::Text, 2, None);
        let mut wire = header_buf[offset..].to_vec();
        wire.extend_from_slice(b"hi");
        {
            let mut write_half = client_writer.shared.write_half.lock().await;
            write_half.write_all(&wire).await.unwrap();
        }

        let err = server_reader.receive().await.unwrap_err();
        assert!(matches!(err, Error::UnmaskedClientFrame));
        assert_eq!(server_reader.shared.state().await, State::Aborted);
    }

    #[tokio::test]
    async fn aborting_closes_the_write_half() {
        let (server_stream, client_stream) = loopback_pair().await;
        let (mut server_reader, _server_writer) =
            new_connection(server_stream, Flags { server: true, compression: false }, WebSocketConfig::default(), Vec::new());
        let (_client_reader, client_writer) =
            new_connection(client_stream, Flags { server: false, compression: false }, WebSocketConfig::default(), Vec::new());

        let mut header_buf = [0u8; crate::frame::HEADER_RESERVE];
        let offset = crate::codec::encode_header_into(&mut header_buf, true, false, OpCode::Text, 2, None);
        let mut wire = header_buf[offset..].to_vec();
        wire.extend_from_slice(b"hi");
        {
            let mut write_half = client_writer.shared.write_half.lock().await;
            write_half.write_all(&wire).await.unwrap();
        }

        let err = server_reader.receive().await.unwrap_err();
        assert!(matches!(err, Error::UnmaskedClientFrame));

        // `transition` to `Aborted` should have already closed the server's
        // write half; a send attempted afterwards hits a dead socket rather
        // than silently succeeding.
        let write_err = server_reader.shared.send_frame(Message::Ping(Bytes::new())).await.unwrap_err();
        assert!(matches!(write_err, Error::Io { .. }));
    }
}
