//! Length-framed request/response wire protocol.
//!
//! A frame is `[total_len: u64][header_len: u64][header][body]` where
//! `total_len = 16 + header_len + body_len`, the header is an encoded
//! [`MessageType`] and the body an encoded [`ProtocolMessage`]. Receivers
//! read exactly `total_len` bytes before parsing; partial reads on a stream
//! socket are looped until satisfied or the connection errors out.

use crate::codec::{self, Decode, Decoder, Encode, Encoder};
use crate::error::{Result, WardError};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame prefix: total length + header length, both u64.
pub const FRAME_PREFIX_LEN: usize = 16;

/// Upper bound on a single frame. A declared length above this is treated
/// as a protocol violation and closes the connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Operation selector carried in every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opt {
    Load = 0,
    Enabled = 1,
    Disabled = 2,
    Remove = 3,
    Query = 4,
    QueryAll = 5,
    QuerySubGraph = 6,
    QueryAllSubGraph = 7,
    List = 8,
    Info = 9,
    Download = 10,
    Subscribe = 11,
    Unsubscribe = 12,
    Publish = 13,
    Data = 14,
    ResponseOk = 15,
    ResponseError = 16,
    Shutdown = 17,
}

impl Opt {
    pub fn from_i32(raw: i32) -> Result<Self> {
        Ok(match raw {
            0 => Opt::Load,
            1 => Opt::Enabled,
            2 => Opt::Disabled,
            3 => Opt::Remove,
            4 => Opt::Query,
            5 => Opt::QueryAll,
            6 => Opt::QuerySubGraph,
            7 => Opt::QueryAllSubGraph,
            8 => Opt::List,
            9 => Opt::Info,
            10 => Opt::Download,
            11 => Opt::Subscribe,
            12 => Opt::Unsubscribe,
            13 => Opt::Publish,
            14 => Opt::Data,
            15 => Opt::ResponseOk,
            16 => Opt::ResponseError,
            17 => Opt::Shutdown,
            other => return Err(WardError::Codec(format!("unknown opt value {other}"))),
        })
    }
}

/// Frame header discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

impl MessageType {
    fn from_i32(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            other => Err(WardError::Codec(format!("unknown message type {other}"))),
        }
    }
}

/// One request, response or async data push.
///
/// `payload` entries are length-prefixed raw byte strings on the wire, so
/// they carry UTF-8 command arguments and binary DataList encodings alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub opt: Opt,
    pub payload: Vec<Vec<u8>>,
}

impl ProtocolMessage {
    pub fn new(opt: Opt) -> Self {
        Self {
            opt,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(opt: Opt, payload: Vec<Vec<u8>>) -> Self {
        Self { opt, payload }
    }

    pub fn push_str(&mut self, arg: &str) -> &mut Self {
        self.payload.push(arg.as_bytes().to_vec());
        self
    }

    pub fn push_bytes(&mut self, arg: Vec<u8>) -> &mut Self {
        self.payload.push(arg);
        self
    }

    /// Payload entry `idx` as UTF-8 text.
    pub fn arg_str(&self, idx: usize) -> Result<&str> {
        let raw = self
            .payload
            .get(idx)
            .ok_or_else(|| WardError::Codec(format!("missing payload argument {idx}")))?;
        std::str::from_utf8(raw)
            .map_err(|e| WardError::Codec(format!("payload argument {idx} is not utf-8: {e}")))
    }

    /// Payload entry `idx` as raw bytes.
    pub fn arg_bytes(&self, idx: usize) -> Result<&[u8]> {
        self.payload
            .get(idx)
            .map(Vec::as_slice)
            .ok_or_else(|| WardError::Codec(format!("missing payload argument {idx}")))
    }

    pub fn ok(payload: Vec<Vec<u8>>) -> Self {
        Self::with_payload(Opt::ResponseOk, payload)
    }

    pub fn ok_str(text: &str) -> Self {
        Self::with_payload(Opt::ResponseOk, vec![text.as_bytes().to_vec()])
    }

    pub fn err(err: &WardError) -> Self {
        Self::with_payload(Opt::ResponseError, vec![err.to_string().into_bytes()])
    }
}

impl Encode for ProtocolMessage {
    fn encode(&self, enc: &mut Encoder) {
        (self.opt as i32).encode(enc);
        self.payload.encode(enc);
    }
}

impl Decode for ProtocolMessage {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let opt = Opt::from_i32(i32::decode(dec)?)?;
        let payload = Vec::<Vec<u8>>::decode(dec)?;
        Ok(Self { opt, payload })
    }
}

/// Encode a complete frame into a buffer.
pub fn encode_frame(msg_type: MessageType, msg: &ProtocolMessage) -> Vec<u8> {
    let header = codec::encode_to_vec(&(msg_type as i32));
    let body = codec::encode_to_vec(msg);

    let total_len = (FRAME_PREFIX_LEN + header.len() + body.len()) as u64;
    let mut enc = Encoder::new();
    total_len.encode(&mut enc);
    (header.len() as u64).encode(&mut enc);
    enc.put_raw(&header);
    enc.put_raw(&body);
    enc.into_bytes()
}

/// Parse a complete frame (everything after the leading total-length word
/// must already be present in `frame`, including the length word itself).
pub fn decode_frame(frame: &[u8]) -> Result<(MessageType, ProtocolMessage)> {
    let mut dec = Decoder::new(frame);
    let total_len = u64::decode(&mut dec)? as usize;
    if total_len != frame.len() {
        return Err(WardError::Protocol(format!(
            "declared frame length {} but {} bytes present",
            total_len,
            frame.len()
        )));
    }
    let header_len = u64::decode(&mut dec)? as usize;
    if FRAME_PREFIX_LEN + header_len > total_len {
        return Err(WardError::Protocol(format!(
            "header length {} exceeds frame boundary",
            header_len
        )));
    }
    let header = dec.take(header_len)?;
    let msg_type = MessageType::from_i32(codec::decode_from_slice::<i32>(header)?)?;

    let body = dec.take(dec.remaining())?;
    let msg = codec::decode_from_slice::<ProtocolMessage>(body)?;
    Ok((msg_type, msg))
}

/// Write one frame to a stream.
pub async fn write_message<W>(
    writer: &mut W,
    msg_type: MessageType,
    msg: &ProtocolMessage,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg_type, msg);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a stream.
///
/// EOF before the first byte maps to [`WardError::ConnectionClosed`]; EOF
/// in the middle of a declared frame is a protocol violation.
pub async fn read_message<R>(reader: &mut R) -> Result<(MessageType, ProtocolMessage)>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
            WardError::ConnectionClosed
        } else {
            WardError::Io(e)
        });
    }

    let total_len = u64::from_ne_bytes(len_buf) as usize;
    if total_len < FRAME_PREFIX_LEN || total_len > MAX_FRAME_LEN {
        return Err(WardError::Protocol(format!(
            "frame length {total_len} outside [{FRAME_PREFIX_LEN}, {MAX_FRAME_LEN}]"
        )));
    }

    let mut frame = vec![0u8; total_len];
    frame[..8].copy_from_slice(&len_buf);
    if let Err(e) = reader.read_exact(&mut frame[8..]).await {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
            WardError::Protocol("stream closed inside a declared frame".into())
        } else {
            WardError::Io(e)
        });
    }

    decode_frame(&frame)
}
