//! Accumulates one outbound message's payload and turns it into a single
//! wire-ready frame: optional `permessage-deflate` compression and
//! client-side masking happen here, not in the connection loop.
//!
//! Outgoing messages are never split across frames (see DESIGN.md): every
//! finalized buffer produces exactly one `fin=1` frame.
//!
//! The finalized frame is never copied into a second buffer. The chain's
//! first segment reserves `HEADER_RESERVE` bytes up front (directly, when
//! uncompressed, or in the compressed-output chain when not); the header is
//! written backward into that reservation once the final payload length is
//! known, and `Framed::write_to` streams the chain's segments straight to
//! the transport.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::buffer::deflate::DeflateContext;
use crate::buffer::pool::{SegmentChain, SegmentPool};
use crate::codec::{encode_header_into, mask_unmask};
use crate::error::Error;
use crate::frame::{DEFLATE_TRAILER, HEADER_RESERVE, OpCode};

/// Incremental UTF-8 validator used while streaming a `Text` message in, so
/// a multi-byte character split across two `write` calls is not rejected.
#[derive(Default)]
struct Utf8Validator {
    pending: Vec<u8>,
}

impl Utf8Validator {
    fn push(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut combined = std::mem::take(&mut self.pending);
        combined.extend_from_slice(data);
        match std::str::from_utf8(&combined) {
            Ok(_) => Ok(combined),
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if e.error_len().is_some() {
                    return Err(Error::InvalidUtf8InTextMessage);
                }
                self.pending = combined[valid_up_to..].to_vec();
                let mut valid = combined;
                valid.truncate(valid_up_to);
                Ok(valid)
            }
        }
    }

    fn finish(self) -> Result<(), Error> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidUtf8InTextMessage)
        }
    }
}

/// A finalized, wire-ready frame. The header lives in the first segment's
/// reserved prefix rather than a second allocated buffer; `write_to` streams
/// straight from the pooled segments and releases them once sent.
pub struct Framed {
    chain: SegmentChain,
    offset: usize,
}

impl Framed {
    pub async fn write_to<W: AsyncWrite + Unpin>(self, writer: &mut W, pool: &SegmentPool) -> Result<(), Error> {
        for (i, segment) in self.chain.iter().enumerate() {
            let start = if i == 0 { self.offset } else { 0 };
            let bytes = &segment.written()[start..];
            if !bytes.is_empty() {
                writer.write_all(bytes).await?;
            }
        }
        self.chain.release(pool);
        Ok(())
    }
}

/// Builder for one outbound message. Call `write` any number of times, then
/// `finalize` once.
pub struct SendBuffer {
    chain: SegmentChain,
    opcode: OpCode,
    validator: Option<Utf8Validator>,
    /// Whether this message's payload will end up run through the deflater.
    /// When it won't, the header reservation happens up front in this
    /// accumulation chain; when it will, the reservation happens later, in
    /// the compressed-output chain `finalize` builds.
    will_compress: bool,
}

impl SendBuffer {
    pub fn new(opcode: OpCode, will_compress: bool) -> Self {
        Self {
            chain: SegmentChain::new(),
            opcode,
            validator: if opcode == OpCode::Text { Some(Utf8Validator::default()) } else { None },
            will_compress,
        }
    }

    fn append_bytes(&mut self, pool: &SegmentPool, mut data: &[u8]) {
        while !data.is_empty() {
            let segment = self.chain.ensure_tail(pool, data.len(), !self.will_compress);
            let n = data.len().min(segment.remaining());
            segment.available_mut()[..n].copy_from_slice(&data[..n]);
            segment.advance(n);
            data = &data[n..];
        }
    }

    /// Appends raw bytes. For `Binary`/`Ping`/`Pong`/`Close` this is a
    /// straight copy; for `Text` the bytes are UTF-8 validated incrementally.
    pub fn write(&mut self, pool: &SegmentPool, data: &[u8]) -> Result<(), Error> {
        if let Some(validator) = &mut self.validator {
            let valid = validator.push(data)?;
            self.append_bytes(pool, &valid);
        } else {
            self.append_bytes(pool, data);
        }
        Ok(())
    }

    /// Consumes the buffer, producing a wire-ready `Framed`. `mask` is
    /// `Some` for client-originated frames: since a send is always exactly
    /// one frame, the mask is generated once by the caller rather than
    /// threaded through as a per-frame callback. `compression` streams the
    /// accumulated payload through the deflater and sets RSV1; masking runs
    /// in place over whichever chain ends up holding the final payload, no
    /// separate masked copy.
    pub fn finalize(
        mut self,
        pool: &SegmentPool,
        mask: Option<[u8; 4]>,
        compression: Option<&mut DeflateContext>,
    ) -> Result<Framed, Error> {
        if let Some(validator) = self.validator.take() {
            validator.finish()?;
        }

        let mut chain = std::mem::take(&mut self.chain);
        let (mut payload_chain, compressed) = match compression {
            Some(ctx) if self.opcode.is_data() => {
                let mut out_chain = SegmentChain::new();
                let deflator = ctx.deflator();
                for segment in chain.iter() {
                    deflator.compress_into(pool, &mut out_chain, segment.written(), true)?;
                }
                deflator.finish_into(pool, &mut out_chain, true)?;
                chain.release(pool);
                let strip = out_chain.total_written().min(DEFLATE_TRAILER.len());
                out_chain.rewind_tail(pool, strip);
                (out_chain, true)
            }
            _ => {
                // An unwritten message (empty Ping/Pong/Close, or an
                // uncompressed empty Text/Binary) never called `append_bytes`,
                // so the chain may still be empty; the header still needs
                // somewhere to live.
                if chain.iter().next().is_none() {
                    chain.ensure_tail(pool, 0, true);
                }
                (chain, false)
            }
        };

        let payload_len = payload_chain.total_written() - HEADER_RESERVE;

        if let Some(mask) = mask {
            let mut offset = 0usize;
            for (i, segment) in payload_chain.iter_mut().enumerate() {
                let start = if i == 0 { HEADER_RESERVE } else { 0 };
                let region = segment.written_mut_from(start);
                mask_unmask(mask, offset, region);
                offset += region.len();
            }
        }

        let first = payload_chain.iter_mut().next().expect("payload chain always has a first segment");
        let header_buf = first.header_prefix_mut();
        let header_offset = encode_header_into(header_buf, true, compressed, self.opcode, payload_len as u64, mask);

        Ok(Framed { chain: payload_chain, offset: header_offset })
    }
}
