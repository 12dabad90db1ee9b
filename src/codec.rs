//! Frame decoding and encoding.
//!
//! Inbound frames optionally pass through a streaming zlib inflater
//! (`zlib-stream` transport compression), then decode as one logical
//! message in the negotiated wire encoding. Outbound packets encode
//! with the same encoding.

use flate2::{Decompress, FlushDecompress, Status};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use crate::error::GatewayError;
use crate::protocol::Packet;

/// Sync-flush trailer marking the end of a zlib-stream frame.
pub(crate) const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Growth step for the inflater's output buffer.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Wire encoding for gateway messages.
///
/// ETF is used whenever the codec is compiled in (`etf` feature);
/// JSON otherwise. The same encoding is used for encode and decode
/// within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text frames.
    Json,
    /// External Term Format binary frames.
    #[cfg(feature = "etf")]
    Etf,
}

impl Encoding {
    /// The encoding negotiated by this build.
    #[must_use]
    pub fn negotiated() -> Self {
        #[cfg(feature = "etf")]
        {
            Self::Etf
        }
        #[cfg(not(feature = "etf"))]
        {
            Self::Json
        }
    }

    /// Query-parameter value for the encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            #[cfg(feature = "etf")]
            Self::Etf => "etf",
        }
    }
}

/// Streaming zlib inflater shared by every frame of a connection.
struct Inflater {
    stream: Decompress,
    message: Vec<u8>,
}

impl Inflater {
    fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            message: Vec::with_capacity(INFLATE_CHUNK),
        }
    }

    /// Feed one frame's bytes into the stream, appending inflated
    /// output to the pending message buffer.
    fn push(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        let mut offset = 0usize;
        while offset < data.len() {
            if self.message.len() == self.message.capacity() {
                self.message.reserve(INFLATE_CHUNK);
            }
            let before = self.stream.total_in();
            let status = self
                .stream
                .decompress_vec(&data[offset..], &mut self.message, FlushDecompress::Sync)
                .map_err(|e| GatewayError::Inflate(e.to_string()))?;
            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.stream.total_in() - before) as usize;
            offset += consumed;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            if consumed == 0 && self.message.len() < self.message.capacity() {
                // No progress with output space left: the stream needs
                // more input, which arrives with the next frame.
                break;
            }
        }
        Ok(())
    }

    /// Take the accumulated inflated message.
    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.message)
    }
}

/// Decodes inbound frames into packets and encodes outbound packets.
pub(crate) struct FrameCodec {
    encoding: Encoding,
    compress: bool,
    inflater: Option<Inflater>,
}

impl FrameCodec {
    pub(crate) fn new(encoding: Encoding, compress: bool) -> Self {
        Self {
            encoding,
            compress,
            inflater: compress.then(Inflater::new),
        }
    }

    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Start a fresh zlib stream. Called once per connection: the
    /// server starts a new stream on every socket.
    pub(crate) fn reset(&mut self) {
        self.inflater = self.compress.then(Inflater::new);
    }

    /// Decode a text frame. Text frames are always JSON.
    pub(crate) fn decode_text(&self, text: &str) -> Result<Packet, GatewayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame.
    ///
    /// With compression, the frame feeds the streaming inflater and a
    /// packet is produced only when the frame ends with the
    /// `00 00 FF FF` sync-flush trailer; intermediate frames return
    /// `Ok(None)`. Without compression each frame is one message.
    pub(crate) fn decode_binary(&mut self, data: &[u8]) -> Result<Option<Packet>, GatewayError> {
        if let Some(inflater) = &mut self.inflater {
            inflater.push(data)?;
            if data.len() < ZLIB_SUFFIX.len() || data[data.len() - ZLIB_SUFFIX.len()..] != ZLIB_SUFFIX
            {
                return Ok(None);
            }
            let message = inflater.take();
            return self.decode_message(&message).map(Some);
        }
        self.decode_message(data).map(Some)
    }

    /// Decode a frame delivered as a list of byte chunks.
    #[allow(dead_code)]
    pub(crate) fn decode_fragments<'a, I>(&mut self, chunks: I) -> Result<Option<Packet>, GatewayError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut frame = Vec::new();
        for chunk in chunks {
            frame.extend_from_slice(chunk);
        }
        self.decode_binary(&frame)
    }

    /// Decode one logical message in the negotiated encoding.
    fn decode_message(&self, bytes: &[u8]) -> Result<Packet, GatewayError> {
        match self.encoding {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            #[cfg(feature = "etf")]
            Encoding::Etf => {
                let value = crate::etf::decode(bytes)?;
                Ok(serde_json::from_value(value)?)
            }
        }
    }
}

/// Encode an outbound `{op, d}` packet as a socket message.
pub(crate) fn encode_packet(op: u8, data: &Value, encoding: Encoding) -> Result<Message, GatewayError> {
    let packet = json!({ "op": op, "d": data });
    match encoding {
        Encoding::Json => Ok(Message::Text(serde_json::to_string(&packet)?.into())),
        #[cfg(feature = "etf")]
        Encoding::Etf => Ok(Message::Binary(crate::etf::encode(&packet)?.into())),
    }
}
