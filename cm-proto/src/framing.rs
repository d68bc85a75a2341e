use crate::{ChannelCipher, Message, Payload, ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

/// Maximum frame size (10MB for safety)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Default maximum frame size for most deployments (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Frame flag: the body is sealed with the channel cipher
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// kind (4) + source job (8) + target job (8)
const HEADER_LEN: usize = 20;

/// Codec for use with tokio_util::codec::Framed
///
/// Frames are a 4-byte big-endian length followed by a flags byte and the
/// message. Once a cipher is installed every outgoing frame is encrypted and
/// every incoming frame must be.
pub struct CmFrameCodec {
    max_frame_size: u32,
    cipher: Option<ChannelCipher>,
}

impl CmFrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
            cipher: None,
        }
    }

    pub fn set_cipher(&mut self, cipher: ChannelCipher) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn open(&self, flags: u8, data: &[u8]) -> Result<Vec<u8>> {
        match (flags & FLAG_ENCRYPTED != 0, &self.cipher) {
            (true, Some(cipher)) => cipher.decrypt(data),
            (true, None) => Err(ProtocolError::Decryption(
                "encrypted frame before channel setup".to_string(),
            )),
            (false, Some(_)) => Err(ProtocolError::Decryption(
                "plaintext frame on encrypted channel".to_string(),
            )),
            (false, None) => Ok(data.to_vec()),
        }
    }
}

impl Default for CmFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl tokio_util::codec::Decoder for CmFrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 4 bytes for length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at length without consuming
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes);

        if length > self.max_frame_size {
            warn!("Received oversized frame: {} bytes (max: {})", length, self.max_frame_size);
            return Err(ProtocolError::FrameTooLarge(length, self.max_frame_size));
        }

        let frame_size = 4 + length as usize;
        if src.len() < frame_size {
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(length as usize);

        if frame.is_empty() {
            return Err(ProtocolError::Truncated(0));
        }
        let flags = frame.get_u8();
        let plain = self.open(flags, &frame)?;

        if plain.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(plain.len()));
        }

        let mut header = &plain[..HEADER_LEN];
        let kind = header.get_u32();
        let source_job = header.get_u64();
        let target_job = header.get_u64();
        let payload = Payload::decode_lenient(kind, &plain[HEADER_LEN..]);

        debug!("Decoded message kind {} ({} bytes)", kind, length);

        Ok(Some(Message {
            source_job,
            target_job,
            payload,
        }))
    }
}

impl tokio_util::codec::Encoder<Message> for CmFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body = item.payload.encode()?;

        let mut plain = Vec::with_capacity(HEADER_LEN + body.len());
        plain.put_u32(item.payload.kind_code());
        plain.put_u64(item.source_job);
        plain.put_u64(item.target_job);
        plain.extend_from_slice(&body);

        let (flags, data) = match &self.cipher {
            Some(cipher) => (FLAG_ENCRYPTED, cipher.encrypt(&plain)?),
            None => (0, plain),
        };

        let length = (1 + data.len()) as u32;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(length, self.max_frame_size));
        }

        debug!("Encoding frame of {} bytes, kind: {}", length, item.payload.kind_code());

        dst.reserve(4 + length as usize);
        dst.put_u32(length);
        dst.put_u8(flags);
        dst.put_slice(&data);

        Ok(())
    }
}
