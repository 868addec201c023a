//! Streaming `permessage-deflate` adapter wrapping `flate2::{Compress,
//! Decompress}`.

use crate::buffer::pool::{SegmentChain, SegmentPool};
use crate::error::Error;
use crate::frame::{DEFAULT_SEGMENT_SIZE, DEFLATE_TRAILER};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Streaming compressor. One instance per connection, reused across messages
/// under context takeover unless `reset_after_message` is set (negotiated
/// `*_no_context_takeover`).
pub struct Deflator {
    compress: Compress,
    reset_after_message: bool,
}

impl Deflator {
    pub fn new(window_bits: u8, reset_after_message: bool) -> Self {
        Self {
            compress: Compress::new_with_window_bits(Compression::fast(), false, window_bits),
            reset_after_message,
        }
    }

    /// Compresses as much of `input` as fits into `output`, returning
    /// `(consumed, written)`. `Ok`/`BufError` are both normal: the caller
    /// supplies more output space and calls again.
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();
        let status = self
            .compress
            .compress(input, output, FlushCompress::None)
            .map_err(|e| Error::CompressionError(e.to_string()))?;
        match status {
            Status::Ok | Status::BufError | Status::StreamEnd => Ok((
                (self.compress.total_in() - before_in) as usize,
                (self.compress.total_out() - before_out) as usize,
            )),
        }
    }

    /// Flushes the deflater with `SyncFlush`, emitting the trailing
    /// `0x00 0x00 0xFF 0xFF` the caller is expected to strip, and returns
    /// `(written, completed)`.
    pub fn finish(&mut self, output: &mut [u8]) -> Result<(usize, bool), Error> {
        let before_out = self.compress.total_out();
        let status = self
            .compress
            .compress(&[], output, FlushCompress::Sync)
            .map_err(|e| Error::CompressionError(e.to_string()))?;
        let written = (self.compress.total_out() - before_out) as usize;
        let completed = match status {
            Status::Ok | Status::BufError => written < output.len(),
            Status::StreamEnd => true,
        };
        if completed && self.reset_after_message {
            self.compress.reset();
        }
        Ok((written, completed))
    }

    /// Streams `input` through the deflater directly into pooled segments of
    /// `chain`, renting new ones from `pool` as needed instead of building a
    /// separate contiguous output buffer. `reserve_header` advances a
    /// brand-new first segment past `HEADER_RESERVE`, so the frame header
    /// can be written into that prefix once the compressed length is known.
    pub fn compress_into(
        &mut self,
        pool: &SegmentPool,
        chain: &mut SegmentChain,
        mut input: &[u8],
        reserve_header: bool,
    ) -> Result<(), Error> {
        while !input.is_empty() {
            let segment = chain.ensure_tail(pool, input.len().max(64), reserve_header);
            let (consumed, written) = self.process(input, segment.available_mut())?;
            segment.advance(written);
            input = &input[consumed..];
            if consumed == 0 && written == 0 {
                chain.force_new_segment(pool, DEFAULT_SEGMENT_SIZE);
            }
        }
        Ok(())
    }

    /// Flushes with `SyncFlush` directly into `chain`, same reservation rule
    /// as `compress_into`. The trailing `0x00 0x00 0xFF 0xFF` this leaves at
    /// the tail is the caller's to strip via `SegmentChain::rewind_tail`.
    pub fn finish_into(&mut self, pool: &SegmentPool, chain: &mut SegmentChain, reserve_header: bool) -> Result<(), Error> {
        loop {
            let segment = chain.ensure_tail(pool, 32, reserve_header);
            let (written, completed) = self.finish(segment.available_mut())?;
            segment.advance(written);
            if completed {
                break;
            }
            if written == 0 {
                chain.force_new_segment(pool, DEFAULT_SEGMENT_SIZE);
            }
        }
        Ok(())
    }

    /// Test convenience: compresses the whole of `input` into an owned
    /// `Vec`, via a scratch pool and chain rather than the caller's real
    /// one, stripping the 4-byte trailer. Production sends go through
    /// `compress_into`/`finish_into` directly into the connection's chain.
    #[cfg(test)]
    pub fn compress_message(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let pool = SegmentPool::new_for_test();
        let mut chain = SegmentChain::new();
        self.compress_into(&pool, &mut chain, input, false)?;
        self.finish_into(&pool, &mut chain, false)?;
        // An empty message may not emit a full 4-byte trailer. Never underflow.
        let strip = chain.total_written().min(DEFLATE_TRAILER.len());
        chain.rewind_tail(&pool, strip);
        let out = chain.to_contiguous();
        chain.release(&pool);
        Ok(out)
    }
}

/// Streaming decompressor, mirror image of `Deflator`.
pub struct Inflator {
    decompress: Decompress,
    reset_after_message: bool,
}

impl Inflator {
    pub fn new(window_bits: u8, reset_after_message: bool) -> Self {
        Self {
            decompress: Decompress::new_with_window_bits(false, window_bits),
            reset_after_message,
        }
    }

    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(input, output, FlushDecompress::Sync)
            .map_err(|e| Error::CompressionError(e.to_string()))?;
        match status {
            Status::Ok | Status::BufError | Status::StreamEnd => Ok((
                (self.decompress.total_in() - before_in) as usize,
                (self.decompress.total_out() - before_out) as usize,
            )),
        }
    }

    /// Appends the `0x00 0x00 0xFF 0xFF` tail and inflates the whole of
    /// `compressed`, growing the output buffer as needed. `max_output` bounds
    /// the inflated size directly: a small compressed payload that expands
    /// past it fails rather than growing the output buffer without limit,
    /// since the compressed byte count alone says nothing about how large
    /// the decompressed message will be.
    pub fn decompress_message(&mut self, compressed: &[u8], max_output: usize) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(compressed.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(compressed);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut output = vec![0u8; (compressed.len() * 3).max(256)];
        let mut consumed = 0;
        let mut written = 0;
        loop {
            if consumed >= input.len() {
                break;
            }
            if written == output.len() {
                output.resize(output.len() * 2, 0);
            }
            let (c, w) = self.process(&input[consumed..], &mut output[written..])?;
            consumed += c;
            written += w;
            if written > max_output {
                return Err(Error::MaxMessageSize);
            }
            if c == 0 && w == 0 {
                output.resize(output.len() + 4096, 0);
            }
        }
        output.truncate(written);
        if self.reset_after_message {
            self.decompress.reset(false);
        }
        Ok(output)
    }
}

/// Lazily-built, connection-shared deflate/inflate state. Rust's `Arc` already
/// gives atomic refcounting and a single safe drop path, so no manual refcount
/// wrapper is needed here (see DESIGN.md).
pub struct DeflateContext {
    pub deflator: Option<Deflator>,
    pub inflator: Option<Inflator>,
    server_window_bits: u8,
    client_window_bits: u8,
    compress_reset: bool,
    decompress_reset: bool,
    is_server: bool,
}

impl DeflateContext {
    pub fn new(
        is_server: bool,
        server_window_bits: u8,
        client_window_bits: u8,
        compress_reset: bool,
        decompress_reset: bool,
    ) -> Self {
        Self {
            deflator: None,
            inflator: None,
            server_window_bits,
            client_window_bits,
            compress_reset,
            decompress_reset,
            is_server,
        }
    }

    pub fn deflator(&mut self) -> &mut Deflator {
        let bits = if self.is_server { self.server_window_bits } else { self.client_window_bits };
        let reset = self.compress_reset;
        self.deflator.get_or_insert_with(|| Deflator::new(bits, reset))
    }

    pub fn inflator(&mut self) -> &mut Inflator {
        let bits = if self.is_server { self.client_window_bits } else { self.server_window_bits };
        let reset = self.decompress_reset;
        self.inflator.get_or_insert_with(|| Inflator::new(bits, reset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_inflate_roundtrip_small() {
        let mut deflator = Deflator::new(15, false);
        let mut inflator = Inflator::new(15, false);
        let input = b"hello hello hello hello world".to_vec();
        let compressed = deflator.compress_message(&input).unwrap();
        let decompressed = inflator.decompress_message(&compressed, 1024).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn deflate_inflate_roundtrip_large_repeating() {
        let mut deflator = Deflator::new(15, false);
        let mut inflator = Inflator::new(15, false);
        let input: Vec<u8> = "ab".repeat(10_000).into_bytes();
        let compressed = deflator.compress_message(&input).unwrap();
        assert!(compressed.len() < input.len());
        let decompressed = inflator.decompress_message(&compressed, input.len()).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn empty_message_does_not_underflow_trailer_strip() {
        let mut deflator = Deflator::new(15, false);
        let compressed = deflator.compress_message(b"").unwrap();
        let mut inflator = Inflator::new(15, false);
        let decompressed = inflator.decompress_message(&compressed, 1024).unwrap();
        assert_eq!(decompressed, b"");
    }

    #[test]
    fn context_takeover_reuses_instance_across_messages() {
        let mut deflator = Deflator::new(15, false);
        let mut inflator = Inflator::new(15, false);
        for chunk in ["first message", "second message", "third message"] {
            let compressed = deflator.compress_message(chunk.as_bytes()).unwrap();
            let decompressed = inflator.decompress_message(&compressed, 1024).unwrap();
            assert_eq!(decompressed, chunk.as_bytes());
        }
    }

    #[test]
    fn decompression_past_max_output_is_rejected() {
        let mut deflator = Deflator::new(15, false);
        let mut inflator = Inflator::new(15, false);
        let input: Vec<u8> = "ab".repeat(10_000).into_bytes();
        let compressed = deflator.compress_message(&input).unwrap();
        let err = inflator.decompress_message(&compressed, 100).unwrap_err();
        assert!(matches!(err, Error::MaxMessageSize));
    }
}
