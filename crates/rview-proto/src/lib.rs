//! rview wire protocol
//!
//! Message types exchanged between the `rview` client and a remote-session
//! server, plus the length-prefixed framing used on the socket.

pub mod input;

use serde::{Deserialize, Serialize};

pub use input::{KeyFlags, PointerFlags, WHEEL_ROTATION_MASK, WHEEL_STEP};

/// Default TCP port of a remote-session server
pub const DEFAULT_PORT: u16 = 3390;

/// Bytes per pixel of every framebuffer payload (32-bit BGRX)
pub const BYTES_PER_PIXEL: usize = 4;

/// Default upper bound for one encoded frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Server → Client
// ============================================================================

/// Messages sent from the remote-session server to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake reply carrying the negotiated desktop size
    Hello { width: u32, height: u32 },

    /// Start of a batch of paints
    BeginPaint,

    /// Raw pixels for a rectangle; the frame payload holds
    /// `width * height * BYTES_PER_PIXEL` tightly packed bytes
    Paint {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// End of a batch of paints
    EndPaint,

    /// The remote desktop changed size
    DesktopResize { width: u32, height: u32 },

    /// The server is closing the session
    Disconnect { reason: String },
}

// ============================================================================
// Client → Server
// ============================================================================

/// Messages sent from the client to the remote-session server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake request with the desired desktop size
    ClientInfo {
        width: u32,
        height: u32,
        fullscreen: bool,
    },

    /// Pointer event, `flags` holds [`PointerFlags`] bits
    Pointer { flags: u16, x: u16, y: u16 },

    /// Keyboard event, `flags` holds [`KeyFlags`] bits and `code` a Set-1 scancode
    Keyboard { flags: u16, code: u16 },

    /// The client is closing the session
    Disconnect,
}

impl ClientMessage {
    /// Build a pointer message
    pub fn pointer(flags: PointerFlags, x: u16, y: u16) -> Self {
        Self::Pointer {
            flags: flags.bits(),
            x,
            y,
        }
    }

    /// Build a keyboard message
    pub fn keyboard(flags: KeyFlags, code: u16) -> Self {
        Self::Keyboard {
            flags: flags.bits(),
            code,
        }
    }
}

// ============================================================================
// Message Framing
// ============================================================================

/// A framed message: JSON header plus an opaque binary payload.
///
/// On the wire each section is preceded by its length (4 bytes, big-endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message without payload
    pub fn new<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        Self::with_payload(msg, Vec::new())
    }

    /// Create a new framed message carrying `payload`
    pub fn with_payload<T: Serialize>(msg: &T, payload: Vec<u8>) -> anyhow::Result<Self> {
        let header = serde_json::to_vec(msg)?;
        Ok(Self { header, payload })
    }

    /// Number of bytes [`Self::encode`] produces
    pub fn encoded_len(&self) -> usize {
        8 + self.header.len() + self.payload.len()
    }

    /// Encode both sections with their length prefixes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode the header as a server message
    pub fn decode_server_message(&self) -> anyhow::Result<ServerMessage> {
        Ok(serde_json::from_slice(&self.header)?)
    }

    /// Decode the header as a client message
    pub fn decode_client_message(&self) -> anyhow::Result<ClientMessage> {
        Ok(serde_json::from_slice(&self.header)?)
    }
}

/// Reassembles [`FramedMessage`]s from a byte stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Fails when a declared length exceeds the configured maximum; the
    /// stream cannot be resynchronized after that.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<FramedMessage>> {
        let Some(header_len) = read_len(&self.buf, 0) else {
            return Ok(None);
        };
        if header_len > self.max_frame_bytes {
            anyhow::bail!("frame header of {} bytes exceeds limit {}", header_len, self.max_frame_bytes);
        }

        let payload_at = 4 + header_len;
        let Some(payload_len) = read_len(&self.buf, payload_at) else {
            return Ok(None);
        };
        if header_len + payload_len > self.max_frame_bytes {
            anyhow::bail!(
                "frame of {} bytes exceeds limit {}",
                header_len + payload_len,
                self.max_frame_bytes
            );
        }

        let end = payload_at + 4 + payload_len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let header = self.buf[4..payload_at].to_vec();
        let payload = self.buf[payload_at + 4..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(FramedMessage { header, payload }))
    }
}

fn read_len(buf: &[u8], at: usize) -> Option<usize> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_paint_with_payload() {
        let msg = ServerMessage::Paint {
            x: 10,
            y: 20,
            width: 2,
            height: 1,
        };
        let framed = FramedMessage::with_payload(&msg, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        decoder.push(&framed.encode());
        let decoded = decoder.next_frame().unwrap().expect("complete frame");

        assert_eq!(decoded.decode_server_message().unwrap(), msg);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_waits_for_partial_frames() {
        let first = FramedMessage::new(&ServerMessage::BeginPaint).unwrap().encode();
        let second = FramedMessage::new(&ServerMessage::EndPaint).unwrap().encode();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        let mut decoded = Vec::new();
        // Feed one byte at a time
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame.decode_server_message().unwrap());
            }
        }

        assert_eq!(decoded, vec![ServerMessage::BeginPaint, ServerMessage::EndPaint]);
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let framed = FramedMessage::with_payload(&ServerMessage::EndPaint, vec![0; 64]).unwrap();
        let mut decoder = FrameDecoder::new(32);
        decoder.push(&framed.encode());

        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_client_message_carries_flag_bits() {
        let msg = ClientMessage::pointer(PointerFlags::DOWN | PointerFlags::BUTTON1, 5, 6);
        let framed = FramedMessage::new(&msg).unwrap();

        match framed.decode_client_message().unwrap() {
            ClientMessage::Pointer { flags, x, y } => {
                assert_eq!(
                    PointerFlags::from_bits_retain(flags),
                    PointerFlags::DOWN | PointerFlags::BUTTON1
                );
                assert_eq!((x, y), (5, 6));
            }
            _ => panic!("Wrong message type"),
        }
    }
}
