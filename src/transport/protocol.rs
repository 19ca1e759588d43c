//! Bridge message payloads.
//!
//! Every payload travels inside one frame (see [`super::write_frame`]).
//! All integers are little-endian.
//!
//! Host → worker:
//! - `0` EvalRequest: `request_id:u64, segment_count:u64, segments.., return_kind:u8`
//! - `1` HandleFree: `handle:u64`
//! - `2` Close
//!
//! Worker → host:
//! - `0` EvalResult: `request_id:u64, status:u8, len:u64, bytes`
//! - `1` FatalError: `len:u64, bytes`

const MSG_EVAL: u8 = 0;
const MSG_FREE: u8 = 1;
const MSG_CLOSE: u8 = 2;

const SEG_CODE: u8 = 0;
const SEG_BUFFER: u8 = 1;
const SEG_STRING: u8 = 2;
const SEG_JSON: u8 = 3;
const SEG_HANDLE: u8 = 4;

const RESP_EVAL: u8 = 0;
const RESP_FATAL: u8 = 1;

const STATUS_FAILURE: u8 = 0;
const STATUS_SUCCESS: u8 = 1;

/// Payload decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: u64,
        available: usize,
    },
    #[error("unknown message tag {0}")]
    UnknownMessage(u8),
    #[error("unknown segment tag {0}")]
    UnknownSegment(u8),
    #[error("unknown return kind {0}")]
    UnknownValueKind(u8),
    #[error("invalid UTF-8 in code segment: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("{0} trailing bytes after message")]
    Trailing(usize),
    #[error("unknown response tag {0}")]
    UnknownResponse(u8),
    #[error("invalid status byte {0}")]
    InvalidStatus(u8),
}

/// How a successful result is marshaled back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Discard the value, reply with an empty payload.
    None,
    /// Raw bytes.
    Bytes,
    /// JSON text.
    Json,
    /// A new handle, as 8 little-endian bytes.
    Handle,
}

impl TryFrom<u8> for ValueKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Bytes),
            2 => Ok(Self::Json),
            3 => Ok(Self::Handle),
            other => Err(ProtocolError::UnknownValueKind(other)),
        }
    }
}

impl From<ValueKind> for u8 {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::None => 0,
            ValueKind::Bytes => 1,
            ValueKind::Json => 2,
            ValueKind::Handle => 3,
        }
    }
}

/// One chunk of a composite expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Source text, spliced verbatim.
    Code(String),
    /// Injected as a binary value.
    BufferLiteral(Vec<u8>),
    /// Injected as a string; UTF-8 is checked at assembly.
    StringLiteral(Vec<u8>),
    /// Injected as the value parsed from JSON text.
    JsonLiteral(Vec<u8>),
    /// Injected as the value bound to a handle.
    HandleLiteral(u64),
}

/// Ordered segments of one expression.
pub type ExpressionSpec = Vec<Segment>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalRequest {
    pub request_id: u64,
    pub expression: ExpressionSpec,
    pub wants_async: bool,
    pub return_kind: ValueKind,
}

/// Host → worker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Eval(EvalRequest),
    HandleFree { handle: u64 },
    Close,
}

/// Why [`Message::decode`] failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The message cannot be attributed to a request.
    #[error(transparent)]
    Envelope(ProtocolError),

    /// The request id was read but the rest of the request is bad.
    #[error("request {request_id}: {source}")]
    Request {
        request_id: u64,
        #[source]
        source: ProtocolError,
    },
}

/// Worker → host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    EvalSuccess { request_id: u64, result: Vec<u8> },
    EvalFailure { request_id: u64, error: Vec<u8> },
    FatalError { error: Vec<u8> },
}

/// Whether a payload is a `Close` message. Only the tag byte is inspected.
pub fn is_close(payload: &[u8]) -> bool {
    payload.first() == Some(&MSG_CLOSE)
}

/// Cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], ProtocolError> {
        let available = self.buf.len() - self.pos;
        let truncated = ProtocolError::Truncated {
            offset: self.pos,
            needed: len,
            available,
        };
        let len = usize::try_from(len).map_err(|_| truncated.clone())?;
        if len > available {
            return Err(truncated);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn sized(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u64()?;
        self.take(len)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            rest => Err(ProtocolError::Trailing(rest)),
        }
    }
}

fn put_sized(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

impl Segment {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let segment = match reader.u8()? {
            SEG_CODE => Self::Code(String::from_utf8(reader.sized()?.to_vec())?),
            SEG_BUFFER => Self::BufferLiteral(reader.sized()?.to_vec()),
            SEG_STRING => Self::StringLiteral(reader.sized()?.to_vec()),
            SEG_JSON => Self::JsonLiteral(reader.sized()?.to_vec()),
            SEG_HANDLE => Self::HandleLiteral(reader.u64()?),
            other => return Err(ProtocolError::UnknownSegment(other)),
        };
        Ok(segment)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Code(code) => {
                out.push(SEG_CODE);
                put_sized(out, code.as_bytes());
            }
            Self::BufferLiteral(bytes) => {
                out.push(SEG_BUFFER);
                put_sized(out, bytes);
            }
            Self::StringLiteral(bytes) => {
                out.push(SEG_STRING);
                put_sized(out, bytes);
            }
            Self::JsonLiteral(bytes) => {
                out.push(SEG_JSON);
                put_sized(out, bytes);
            }
            Self::HandleLiteral(handle) => {
                out.push(SEG_HANDLE);
                out.extend_from_slice(&handle.to_le_bytes());
            }
        }
    }
}

impl Message {
    /// Decode a host → worker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);
        let tag = reader
            .u8()
            .map_err(|_| DecodeError::Envelope(ProtocolError::Empty))?;
        match tag {
            MSG_EVAL => {
                let request_id = reader.u64().map_err(DecodeError::Envelope)?;
                Self::decode_eval(&mut reader, request_id)
                    .map(Self::Eval)
                    .map_err(|source| DecodeError::Request { request_id, source })
            }
            MSG_FREE => {
                let handle = reader.u64().map_err(DecodeError::Envelope)?;
                reader.finish().map_err(DecodeError::Envelope)?;
                Ok(Self::HandleFree { handle })
            }
            MSG_CLOSE => Ok(Self::Close),
            other => Err(DecodeError::Envelope(ProtocolError::UnknownMessage(other))),
        }
    }

    fn decode_eval(reader: &mut Reader<'_>, request_id: u64) -> Result<EvalRequest, ProtocolError> {
        let count = reader.u64()?;
        let mut expression = Vec::new();
        for _ in 0..count {
            expression.push(Segment::decode(reader)?);
        }
        let return_kind = ValueKind::try_from(reader.u8()?)?;
        reader.finish()?;
        Ok(EvalRequest {
            request_id,
            expression,
            wants_async: true,
            return_kind,
        })
    }

    /// Encode a host → worker payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Eval(request) => {
                out.push(MSG_EVAL);
                out.extend_from_slice(&request.request_id.to_le_bytes());
                out.extend_from_slice(&(request.expression.len() as u64).to_le_bytes());
                for segment in &request.expression {
                    segment.encode(&mut out);
                }
                out.push(request.return_kind.into());
            }
            Self::HandleFree { handle } => {
                out.push(MSG_FREE);
                out.extend_from_slice(&handle.to_le_bytes());
            }
            Self::Close => out.push(MSG_CLOSE),
        }
        out
    }
}

impl Response {
    /// Encode a worker → host payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::EvalSuccess { request_id, result } => {
                out.push(RESP_EVAL);
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(STATUS_SUCCESS);
                put_sized(&mut out, result);
            }
            Self::EvalFailure { request_id, error } => {
                out.push(RESP_EVAL);
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(STATUS_FAILURE);
                put_sized(&mut out, error);
            }
            Self::FatalError { error } => {
                out.push(RESP_FATAL);
                put_sized(&mut out, error);
            }
        }
        out
    }

    /// Decode a worker → host payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let response = match reader.u8().map_err(|_| ProtocolError::Empty)? {
            RESP_EVAL => {
                let request_id = reader.u64()?;
                let status = reader.u8()?;
                let bytes = reader.sized()?.to_vec();
                match status {
                    STATUS_SUCCESS => Self::EvalSuccess {
                        request_id,
                        result: bytes,
                    },
                    STATUS_FAILURE => Self::EvalFailure {
                        request_id,
                        error: bytes,
                    },
                    other => return Err(ProtocolError::InvalidStatus(other)),
                }
            }
            RESP_FATAL => Self::FatalError {
                error: reader.sized()?.to_vec(),
            },
            other => return Err(ProtocolError::UnknownResponse(other)),
        };
        reader.finish()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(id: u64, expression: ExpressionSpec, return_kind: ValueKind) -> Message {
        Message::Eval(EvalRequest {
            request_id: id,
            expression,
            wants_async: true,
            return_kind,
        })
    }

    #[test]
    fn eval_request_layout() {
        let msg = eval(7, vec![Segment::Code("1+1".into())], ValueKind::Json);
        let bytes = msg.encode();

        let mut expected = vec![0u8];
        expected.extend_from_slice(&7u64.to_le_bytes());
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.push(0);
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(b"1+1");
        expected.push(2);
        assert_eq!(bytes, expected);

        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn handle_literal_has_no_length_prefix() {
        let msg = eval(1, vec![Segment::HandleLiteral(9)], ValueKind::None);
        let bytes = msg.encode();
        // tag + id + count + (seg tag + handle) + return kind
        assert_eq!(bytes.len(), 1 + 8 + 8 + 1 + 8 + 1);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_free_and_close() {
        let mut free = vec![1u8];
        free.extend_from_slice(&5u64.to_le_bytes());
        assert_eq!(
            Message::decode(&free).unwrap(),
            Message::HandleFree { handle: 5 }
        );
        assert_eq!(Message::decode(&[2]).unwrap(), Message::Close);
        assert!(is_close(&[2]));
        assert!(!is_close(&free));
        assert!(!is_close(&[]));
    }

    #[test]
    fn bad_envelope_is_not_correlated() {
        assert_eq!(
            Message::decode(&[]),
            Err(DecodeError::Envelope(ProtocolError::Empty))
        );
        assert_eq!(
            Message::decode(&[9]),
            Err(DecodeError::Envelope(ProtocolError::UnknownMessage(9)))
        );
        assert!(matches!(
            Message::decode(&[0, 1, 2]),
            Err(DecodeError::Envelope(ProtocolError::Truncated { .. }))
        ));
    }

    #[test]
    fn truncated_segment_is_attributed_to_request() {
        let msg = eval(3, vec![Segment::BufferLiteral(vec![1, 2, 3, 4])], ValueKind::Bytes);
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 3);
        match Message::decode(&bytes) {
            Err(DecodeError::Request { request_id, source }) => {
                assert_eq!(request_id, 3);
                assert!(matches!(source, ProtocolError::Truncated { .. }));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn unknown_return_kind_and_segment() {
        let mut bytes = eval(4, vec![], ValueKind::None).encode();
        *bytes.last_mut().unwrap() = 9;
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::Request {
                request_id: 4,
                source: ProtocolError::UnknownValueKind(9)
            })
        );

        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&4u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.push(7);
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::Request {
                request_id: 4,
                source: ProtocolError::UnknownSegment(7)
            })
        );
    }

    #[test]
    fn huge_declared_length_is_truncation() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(DecodeError::Request {
                source: ProtocolError::Truncated { .. },
                ..
            })
        ));
    }

    #[test]
    fn response_layout() {
        let ok = Response::EvalSuccess {
            request_id: 1,
            result: b"2".to_vec(),
        };
        let bytes = ok.encode();
        assert_eq!(bytes.len(), 18 + 1);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[9], 1);
        assert_eq!(Response::decode(&bytes).unwrap(), ok);

        let fatal = Response::FatalError {
            error: b"boom".to_vec(),
        };
        let bytes = fatal.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..9], &4u64.to_le_bytes());
        assert_eq!(Response::decode(&bytes).unwrap(), fatal);
    }
}
