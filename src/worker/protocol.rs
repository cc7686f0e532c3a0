//! Framed IPC between the parent and a worker process
//!
//! Frames ride the worker's stdin/stdout: `u32 length (LE), u8 type,
//! payload`, where `length` counts the type byte plus the payload. The
//! worker side is blocking `std::io` (the worker is a single-threaded
//! actor); the parent side is async over the child's pipes.
//!
//! Payload shapes:
//! - `EMBED`: `batch_id: u64, n: u32`, then n × `{len: u32, utf-8 bytes}`
//! - `EMBED_OK`: `batch_id: u64, n: u32`, then n × `dim × f32`
//! - error/ack variants: `batch_id: u64` (0 if N/A), `code: u16`,
//!   `message_len: u32`, `message: utf-8`
//! - `INIT`: `worker_id: u64, dim: u32, cache_capacity: u32`, then three
//!   `{len: u32, utf-8}` strings: cache path, model path, backend name

use std::io::{Read, Write};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as stream
/// corruption rather than a legitimate batch.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

// Frame type bytes. Requests are parent→worker, responses worker→parent.
const TYPE_INIT: u8 = 1;
const TYPE_EMBED: u8 = 2;
const TYPE_ABORT: u8 = 3;
const TYPE_SHUTDOWN: u8 = 4;
const TYPE_INIT_OK: u8 = 11;
const TYPE_EMBED_OK: u8 = 12;
const TYPE_EMBED_ERR: u8 = 13;
const TYPE_ABORT_ACK: u8 = 14;
const TYPE_EXITING: u8 = 15;

/// Error codes carried by `EMBED_ERR`.
pub const ERR_CODE_ABORTED: u16 = 1;
pub const ERR_CODE_MODEL: u16 = 2;
pub const ERR_CODE_INTERNAL: u16 = 3;

/// Errors from frame encoding/decoding.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("ipc io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("malformed {frame} payload: {detail}")]
    Malformed {
        frame: &'static str,
        detail: String,
    },
}

/// Parent → worker messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Init(InitRequest),
    Embed { batch_id: u64, texts: Vec<String> },
    Abort { batch_id: Option<u64> },
    Shutdown,
}

/// `INIT` payload: everything a worker needs to attach to the shared cache
/// and load its model.
#[derive(Debug, Clone, PartialEq)]
pub struct InitRequest {
    pub worker_id: u64,
    pub dim: u32,
    pub cache_capacity: u32,
    pub cache_path: String,
    pub model_path: String,
    pub backend: String,
}

/// Worker → parent messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    InitOk,
    EmbedOk {
        batch_id: u64,
        vectors: Vec<Vec<f32>>,
    },
    EmbedErr {
        batch_id: u64,
        code: u16,
        message: String,
    },
    AbortAck,
    Exiting,
}

// ===== encoding =====

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_ack(type_byte: u8, batch_id: u64, code: u16, message: &str) -> (u8, Vec<u8>) {
    let mut buf = Vec::with_capacity(14 + message.len());
    buf.extend_from_slice(&batch_id.to_le_bytes());
    buf.extend_from_slice(&code.to_le_bytes());
    push_str(&mut buf, message);
    (type_byte, buf)
}

impl Request {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            Request::Init(init) => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&init.worker_id.to_le_bytes());
                buf.extend_from_slice(&init.dim.to_le_bytes());
                buf.extend_from_slice(&init.cache_capacity.to_le_bytes());
                push_str(&mut buf, &init.cache_path);
                push_str(&mut buf, &init.model_path);
                push_str(&mut buf, &init.backend);
                (TYPE_INIT, buf)
            }
            Request::Embed { batch_id, texts } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&batch_id.to_le_bytes());
                buf.extend_from_slice(&(texts.len() as u32).to_le_bytes());
                for text in texts {
                    push_str(&mut buf, text);
                }
                (TYPE_EMBED, buf)
            }
            Request::Abort { batch_id } => {
                // Reuses the ack shape: batch_id 0 means "abort whatever".
                encode_ack(TYPE_ABORT, batch_id.unwrap_or(0), 0, "")
            }
            Request::Shutdown => (TYPE_SHUTDOWN, Vec::new()),
        }
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        match type_byte {
            TYPE_INIT => {
                let mut cursor = Cursor::new(payload, "INIT");
                let worker_id = cursor.u64()?;
                let dim = cursor.u32()?;
                let cache_capacity = cursor.u32()?;
                let cache_path = cursor.string()?;
                let model_path = cursor.string()?;
                let backend = cursor.string()?;
                Ok(Request::Init(InitRequest {
                    worker_id,
                    dim,
                    cache_capacity,
                    cache_path,
                    model_path,
                    backend,
                }))
            }
            TYPE_EMBED => {
                let mut cursor = Cursor::new(payload, "EMBED");
                let batch_id = cursor.u64()?;
                let n = cursor.u32()? as usize;
                let mut texts = Vec::with_capacity(n.min(65_536));
                for _ in 0..n {
                    texts.push(cursor.string()?);
                }
                Ok(Request::Embed { batch_id, texts })
            }
            TYPE_ABORT => {
                let mut cursor = Cursor::new(payload, "ABORT");
                let batch_id = cursor.u64()?;
                Ok(Request::Abort {
                    batch_id: (batch_id != 0).then_some(batch_id),
                })
            }
            TYPE_SHUTDOWN => Ok(Request::Shutdown),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl Response {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            Response::InitOk => encode_ack(TYPE_INIT_OK, 0, 0, ""),
            Response::EmbedOk { batch_id, vectors } => {
                let per_vector = vectors.first().map(|v| v.len() * 4).unwrap_or(0);
                let mut buf = Vec::with_capacity(12 + vectors.len() * per_vector);
                buf.extend_from_slice(&batch_id.to_le_bytes());
                buf.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
                for vector in vectors {
                    for value in vector {
                        buf.extend_from_slice(&value.to_le_bytes());
                    }
                }
                (TYPE_EMBED_OK, buf)
            }
            Response::EmbedErr {
                batch_id,
                code,
                message,
            } => encode_ack(TYPE_EMBED_ERR, *batch_id, *code, message),
            Response::AbortAck => encode_ack(TYPE_ABORT_ACK, 0, 0, ""),
            Response::Exiting => encode_ack(TYPE_EXITING, 0, 0, ""),
        }
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        match type_byte {
            TYPE_INIT_OK => Ok(Response::InitOk),
            TYPE_EMBED_OK => {
                let mut cursor = Cursor::new(payload, "EMBED_OK");
                let batch_id = cursor.u64()?;
                let n = cursor.u32()? as usize;
                let rest = cursor.remaining();
                if n == 0 {
                    return Ok(Response::EmbedOk {
                        batch_id,
                        vectors: Vec::new(),
                    });
                }
                if rest.len() % n != 0 || (rest.len() / n) % 4 != 0 {
                    return Err(ProtocolError::Malformed {
                        frame: "EMBED_OK",
                        detail: format!("{} vector bytes not divisible into {} vectors", rest.len(), n),
                    });
                }
                let dim = rest.len() / n / 4;
                let mut vectors = Vec::with_capacity(n);
                for i in 0..n {
                    let mut vector = Vec::with_capacity(dim);
                    for j in 0..dim {
                        let at = (i * dim + j) * 4;
                        let bytes: [u8; 4] =
                            rest[at..at + 4].try_into().expect("4-byte window");
                        vector.push(f32::from_le_bytes(bytes));
                    }
                    vectors.push(vector);
                }
                Ok(Response::EmbedOk { batch_id, vectors })
            }
            TYPE_EMBED_ERR => {
                let mut cursor = Cursor::new(payload, "EMBED_ERR");
                let batch_id = cursor.u64()?;
                let code = cursor.u16()?;
                let message = cursor.string()?;
                Ok(Response::EmbedErr {
                    batch_id,
                    code,
                    message,
                })
            }
            TYPE_ABORT_ACK => Ok(Response::AbortAck),
            TYPE_EXITING => Ok(Response::Exiting),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Little bounds-checked reader over a payload slice.
struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
    frame: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], frame: &'static str) -> Self {
        Self { data, at: 0, frame }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.at + n > self.data.len() {
            return Err(ProtocolError::Malformed {
                frame: self.frame,
                detail: format!(
                    "need {} bytes at offset {}, have {}",
                    n,
                    self.at,
                    self.data.len()
                ),
            });
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Malformed {
            frame: self.frame,
            detail: format!("invalid utf-8: {}", e),
        })
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.at..]
    }
}

// ===== blocking codec (worker side) =====

fn write_frame_blocking(
    writer: &mut impl Write,
    type_byte: u8,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let len = payload.len() as u32 + 1;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&[type_byte])?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_frame_blocking(reader: &mut impl Read) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    let type_byte = body[0];
    body.remove(0);
    Ok((type_byte, body))
}

/// Worker side: read the next request from the parent (blocking).
pub fn recv_request_blocking(reader: &mut impl Read) -> Result<Request, ProtocolError> {
    let (type_byte, payload) = read_frame_blocking(reader)?;
    Request::decode(type_byte, &payload)
}

/// Worker side: send a response to the parent (blocking).
pub fn send_response_blocking(
    writer: &mut impl Write,
    response: &Response,
) -> Result<(), ProtocolError> {
    let (type_byte, payload) = response.encode();
    write_frame_blocking(writer, type_byte, &payload)
}

/// Parent side, blocking variant (tests and simple tooling).
pub fn send_request_blocking(
    writer: &mut impl Write,
    request: &Request,
) -> Result<(), ProtocolError> {
    let (type_byte, payload) = request.encode();
    write_frame_blocking(writer, type_byte, &payload)
}

/// Parent side, blocking variant (tests and simple tooling).
pub fn recv_response_blocking(reader: &mut impl Read) -> Result<Response, ProtocolError> {
    let (type_byte, payload) = read_frame_blocking(reader)?;
    Response::decode(type_byte, &payload)
}

// ===== async codec (parent side) =====

async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    type_byte: u8,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let len = payload.len() as u32 + 1;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&[type_byte]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Parent side: send a request down a worker's stdin.
pub async fn send_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<(), ProtocolError> {
    let (type_byte, payload) = request.encode();
    write_frame_async(writer, type_byte, &payload).await
}

/// Parent side: read the next response from a worker's stdout.
pub async fn recv_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Response, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let type_byte = body[0];
    Response::decode(type_byte, &body[1..])
}
