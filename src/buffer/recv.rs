//! Accumulates an inbound message across one or more frames and turns the
//! result into a `Message`, inflating it first if it arrived compressed.

use bytes::Bytes;

use crate::buffer::deflate::DeflateContext;
use crate::buffer::pool::{SegmentChain, SegmentPool};
use crate::error::Error;
use crate::frame::OpCode;
use crate::message::{CloseReason, Message};

/// Accumulates the payload of one message, frame by frame.
pub struct RecvBuffer {
    chain: SegmentChain,
    opcode: OpCode,
    compressed: bool,
    max_message_size: usize,
}

impl RecvBuffer {
    pub fn new(opcode: OpCode, compressed: bool, max_message_size: usize) -> Self {
        Self { chain: SegmentChain::new(), opcode, compressed, max_message_size }
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Appends one frame's payload. Fails once the running total exceeds
    /// `max_message_size` so a malicious or buggy peer cannot force
    /// unbounded allocation.
    pub fn push(&mut self, pool: &SegmentPool, mut data: &[u8]) -> Result<(), Error> {
        if self.chain.total_written() + data.len() > self.max_message_size {
            return Err(Error::MaxMessageSize);
        }
        while !data.is_empty() {
            let needs_new_segment = match self.chain.tail_mut() {
                Some(segment) => segment.remaining() == 0,
                None => true,
            };
            if needs_new_segment {
                self.chain.append(pool.rent_for_hint(data.len()));
            }
            let segment = self.chain.tail_mut().expect("segment just ensured");
            let n = data.len().min(segment.remaining());
            segment.available_mut()[..n].copy_from_slice(&data[..n]);
            segment.advance(n);
            data = &data[n..];
        }
        Ok(())
    }

    /// Consumes the buffer, inflating the payload if needed, and produces the
    /// finished `Message`. The compressed-byte check in `push` only bounds
    /// the wire size; `max_message_size` is enforced again here against the
    /// inflated length, since a small compressed payload can expand well
    /// past it.
    pub fn finish(
        self,
        pool: &SegmentPool,
        compression: Option<&mut DeflateContext>,
    ) -> Result<Message, Error> {
        let max_message_size = self.max_message_size;
        let raw = self.chain.to_contiguous();
        self.chain.release(pool);

        let payload = if self.compressed {
            let ctx = compression.ok_or(Error::InvalidCompressedFrame)?;
            ctx.inflator().decompress_message(&raw, max_message_size)?
        } else {
            raw
        };

        match self.opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload).map_err(|_| Error::InvalidUtf8InTextMessage)?;
                Ok(Message::Text(Bytes::from(text)))
            }
            OpCode::Binary => Ok(Message::Binary(Bytes::from(payload))),
            OpCode::Ping => Ok(Message::Ping(Bytes::from(payload))),
            OpCode::Pong => Ok(Message::Pong(Bytes::from(payload))),
            OpCode::Close => Ok(Message::Close(CloseReason::from_payload(&payload)?)),
            OpCode::Continuation => Err(Error::InvalidContinuationFrame),
        }
    }
}
