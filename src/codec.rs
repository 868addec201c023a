//! RFC 6455 §5.2 frame header encode/decode.

use crate::error::Error;
use crate::frame::{OpCode, HEADER_RESERVE};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One decoded frame header. `payload_len` and `mask` describe the payload that
/// follows on the wire; this type carries no payload bytes itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub compressed: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Total header size on the wire: 2 base bytes + extended length + mask.
    pub fn wire_len(&self) -> usize {
        let ext = if self.payload_len > 65535 {
            8
        } else if self.payload_len > 125 {
            2
        } else {
            0
        };
        2 + ext + if self.masked { 4 } else { 0 }
    }
}

/// Reads and decodes one frame header from `reader`. Does not read the payload.
pub async fn decode_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameHeader, Error> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = (head[0] & 0b1000_0000) != 0;
    let rsv1 = (head[0] & 0b0100_0000) != 0;
    let rsv2 = (head[0] & 0b0010_0000) != 0;
    let rsv3 = (head[0] & 0b0001_0000) != 0;
    if rsv2 || rsv3 {
        return Err(Error::RsvNotZero);
    }
    let opcode = OpCode::from_u8(head[0] & 0b0000_1111)?;

    if !fin && opcode.is_control() {
        return Err(Error::ControlFramesFragmented);
    }

    let masked = (head[1] & 0b1000_0000) != 0;
    let mut payload_len = (head[1] & 0b0111_1111) as u64;

    if payload_len > 125 && opcode.is_control() {
        return Err(Error::ControlFramePayloadSize);
    }

    if payload_len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        payload_len = u16::from_be_bytes(ext) as u64;
    } else if payload_len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        payload_len = u64::from_be_bytes(ext);
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    if rsv1 && !opcode.is_data() {
        // The compressed flag only ever makes sense on the first frame of a data
        // message, never on a continuation or control frame.
        return Err(Error::InvalidCompressedFrame);
    }

    Ok(FrameHeader {
        fin,
        compressed: rsv1,
        opcode,
        masked,
        payload_len,
        mask,
    })
}

/// Writes a frame header into `buf`, a `HEADER_RESERVE`-byte (14-byte) scratch
/// region, right-aligned so that short headers start partway through the buffer.
/// Returns the start offset into `buf` at which the valid header bytes begin.
pub fn encode_header_into(
    buf: &mut [u8; HEADER_RESERVE],
    fin: bool,
    compressed: bool,
    opcode: OpCode,
    payload_len: u64,
    mask: Option<[u8; 4]>,
) -> usize {
    let ext_len = if payload_len > 65535 {
        8
    } else if payload_len > 125 {
        2
    } else {
        0
    };
    let mask_len = if mask.is_some() { 4 } else { 0 };
    let total = 2 + ext_len + mask_len;
    let offset = HEADER_RESERVE - total;

    let mut first_byte = opcode.as_u8();
    if fin {
        first_byte |= 0b1000_0000;
    }
    if compressed {
        first_byte |= 0b0100_0000;
    }
    buf[offset] = first_byte;

    let masked_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
    let (len_byte, ext_bytes): (u8, &[u8]) = if payload_len <= 125 {
        (payload_len as u8, &[])
    } else if payload_len <= 65535 {
        (126, &(payload_len as u16).to_be_bytes())
    } else {
        (127, &payload_len.to_be_bytes())
    };
    buf[offset + 1] = masked_bit | len_byte;

    let mut cursor = offset + 2;
    buf[cursor..cursor + ext_len].copy_from_slice(&ext_bytes[..ext_len]);
    cursor += ext_len;

    if let Some(mask) = mask {
        buf[cursor..cursor + 4].copy_from_slice(&mask);
    }

    offset
}

/// XORs `data` in place against `mask`, treating `data` as starting at byte
/// `offset` within the logical payload (so masking can resume correctly across
/// chunked reads/writes of one frame).
pub fn mask_unmask(mask: [u8; 4], offset: usize, data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(fin: bool, compressed: bool, opcode: OpCode, len: u64, mask: Option<[u8; 4]>) {
        let mut buf = [0u8; HEADER_RESERVE];
        let offset = encode_header_into(&mut buf, fin, compressed, opcode, len, mask);
        let mut cursor = Cursor::new(&buf[offset..]);
        let decoded = decode_header(&mut cursor).await.unwrap();
        assert_eq!(decoded.fin, fin);
        assert_eq!(decoded.compressed, compressed && opcode.is_data());
        assert_eq!(decoded.opcode, opcode);
        assert_eq!(decoded.payload_len, len);
        assert_eq!(decoded.mask, mask);
    }

    #[tokio::test]
    async fn header_roundtrips_all_length_classes() {
        for &len in &[0u64, 1, 125, 126, 127, 65535, 65536, 4_294_967_295] {
            roundtrip(true, false, OpCode::Binary, len, None).await;
            roundtrip(true, false, OpCode::Binary, len, Some([1, 2, 3, 4])).await;
            roundtrip(false, false, OpCode::Text, len, Some([9, 9, 9, 9])).await;
        }
    }

    #[tokio::test]
    async fn compressed_flag_roundtrips_on_fin_data_frame() {
        roundtrip(true, true, OpCode::Text, 10, None).await;
    }

    #[tokio::test]
    async fn rsv2_or_rsv3_is_rejected() {
        let mut buf = [0u8; 2];
        buf[0] = 0b1010_0001; // fin=1, rsv2=1, opcode=text
        let mut cursor = Cursor::new(&buf[..]);
        let err = decode_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::RsvNotZero));
    }

    #[tokio::test]
    async fn fragmented_control_frame_is_rejected() {
        let mut buf = [0u8; 2];
        buf[0] = 0b0000_1000; // fin=0, opcode=close
        let mut cursor = Cursor::new(&buf[..]);
        let err = decode_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::ControlFramesFragmented));
    }

    #[test]
    fn mask_unmask_is_involution() {
        let mask = [0xDE, 0xAD, 0xBE, 0xEF];
        let original = b"hello world, this is a masking test".to_vec();
        let mut data = original.clone();
        mask_unmask(mask, 0, &mut data);
        assert_ne!(data, original);
        mask_unmask(mask, 0, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn mask_unmask_respects_running_offset() {
        let mask = [1, 2, 3, 4];
        let mut whole = vec![10u8; 10];
        mask_unmask(mask, 0, &mut whole);

        let mut first_half = vec![10u8; 4];
        let mut second_half = vec![10u8; 6];
        mask_unmask(mask, 0, &mut first_half);
        mask_unmask(mask, 4, &mut second_half);

        assert_eq!(whole[..4], first_half[..]);
        assert_eq!(whole[4..], second_half[..]);
    }
}
