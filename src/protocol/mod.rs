//! MongoDB wire protocol framing.
//! - 16-byte little-endian message header
//! - OP_MSG with kind-0 and kind-1 sections, CRC-32C checksum trailer
//! - OP_QUERY / OP_REPLY for the legacy handshake

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{DecodeError, Document};

pub const HEADER_LEN: usize = 16;
/// Largest message accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

// Relevant op codes
pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_MSG: i32 = 2013;

/// OP_MSG flag bits.
pub mod flags {
    pub const CHECKSUM_PRESENT: u32 = 1 << 0;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;
    /// Bits 0-15 must be understood by the receiver.
    pub const REQUIRED_MASK: u32 = 0xffff;
    pub const KNOWN: u32 = CHECKSUM_PRESENT | MORE_TO_COME;
}

/// OP_REPLY response flag set when the query failed.
pub const REPLY_QUERY_FAILURE: u32 = 1 << 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("incomplete message: expected {expected} bytes, received {received}")]
    Incomplete { expected: usize, received: usize },

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("malformed document: {0}")]
    Malformed(#[from] DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The peer closed the connection cleanly between messages.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Incomplete { received: 0, .. })
    }
}

fn violation(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Violation(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        let mut b = &buf[..];
        Self {
            message_length: b.get_i32_le(),
            request_id: b.get_i32_le(),
            response_to: b.get_i32_le(),
            op_code: b.get_i32_le(),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_i32_le(self.message_length);
        out.put_i32_le(self.request_id);
        out.put_i32_le(self.response_to);
        out.put_i32_le(self.op_code);
    }

    /// Declared body length, after checking it against the size limits.
    pub fn body_len(&self) -> Result<usize, ProtocolError> {
        let len = self.message_length;
        if len < HEADER_LEN as i32 {
            return Err(violation(format!("message length {len} shorter than header")));
        }
        if len as usize > MAX_MESSAGE_SIZE {
            return Err(violation(format!(
                "message length {len} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }
        Ok(len as usize - HEADER_LEN)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Kind 0: the single command document.
    Body(Document),
    /// Kind 1: an identified document sequence.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl OpMsg {
    /// A message carrying one body document and no flags.
    pub fn new(doc: Document) -> Self {
        Self {
            flags: 0,
            sections: vec![Section::Body(doc)],
        }
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & flags::MORE_TO_COME != 0
    }

    /// All documents across sections, body first.
    pub fn documents(&self) -> Vec<&Document> {
        let mut out = Vec::new();
        for section in &self.sections {
            match section {
                Section::Body(doc) => out.push(doc),
                Section::Sequence { documents, .. } => out.extend(documents.iter()),
            }
        }
        out
    }

    fn decode(body: &[u8], header: &MessageHeader) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(violation("OP_MSG shorter than its flags"));
        }
        let mut buf = body;
        let flag_bits = buf.get_u32_le();
        let unknown = flag_bits & flags::REQUIRED_MASK & !flags::KNOWN;
        if unknown != 0 {
            return Err(violation(format!("unknown required OP_MSG flags {unknown:#x}")));
        }
        if flag_bits & flags::CHECKSUM_PRESENT != 0 {
            if buf.len() < 4 {
                return Err(violation("OP_MSG checksum flag set without checksum"));
            }
            let (rest, trailer) = buf.split_at(buf.len() - 4);
            let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let mut head = Vec::with_capacity(HEADER_LEN);
            header.write_to(&mut head);
            let actual = crc32c::crc32c_append(crc32c::crc32c(&head), &body[..body.len() - 4]);
            if actual != expected {
                return Err(violation(format!(
                    "OP_MSG checksum mismatch: expected {expected:#010x}, computed {actual:#010x}"
                )));
            }
            buf = rest;
        }

        let mut sections = Vec::new();
        let mut bodies = 0;
        while !buf.is_empty() {
            let kind = buf.get_u8();
            match kind {
                0 => {
                    let (doc, n) = Document::decode(buf)?;
                    buf.advance(n);
                    bodies += 1;
                    sections.push(Section::Body(doc));
                }
                1 => {
                    if buf.len() < 4 {
                        return Err(ProtocolError::Malformed(DecodeError::UnexpectedEnd {
                            needed: 4,
                            available: buf.len(),
                        }));
                    }
                    let size = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    if size < 5 || size as usize > buf.len() {
                        return Err(violation(format!("invalid document sequence size {size}")));
                    }
                    let mut seq = &buf[4..size as usize];
                    buf.advance(size as usize);
                    let end = seq
                        .iter()
                        .position(|b| *b == 0)
                        .ok_or(DecodeError::MissingTerminator)?;
                    let identifier = std::str::from_utf8(&seq[..end])
                        .map_err(|_| DecodeError::InvalidUtf8)?
                        .to_string();
                    seq.advance(end + 1);
                    let mut documents = Vec::new();
                    while !seq.is_empty() {
                        let (doc, n) = Document::decode(seq)?;
                        seq.advance(n);
                        documents.push(doc);
                    }
                    sections.push(Section::Sequence {
                        identifier,
                        documents,
                    });
                }
                other => return Err(violation(format!("unknown OP_MSG section kind {other}"))),
            }
        }
        if bodies != 1 {
            return Err(violation(format!(
                "OP_MSG must carry exactly one body section, found {bodies}"
            )));
        }
        Ok(Self {
            flags: flag_bits,
            sections,
        })
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.flags);
        for section in &self.sections {
            match section {
                Section::Body(doc) => {
                    out.put_u8(0);
                    doc.write_to(out);
                }
                Section::Sequence {
                    identifier,
                    documents,
                } => {
                    out.put_u8(1);
                    let start = out.len();
                    out.put_i32_le(0);
                    out.put_slice(identifier.as_bytes());
                    out.put_u8(0);
                    for doc in documents {
                        doc.write_to(out);
                    }
                    let size = (out.len() - start) as i32;
                    out[start..start + 4].copy_from_slice(&size.to_le_bytes());
                }
            }
        }
    }
}

/// Legacy query; only `<db>.$cmd` commands are served.
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

impl OpQuery {
    pub fn database(&self) -> &str {
        self.full_collection_name
            .split_once('.')
            .map(|(db, _)| db)
            .unwrap_or(&self.full_collection_name)
    }

    pub fn is_command(&self) -> bool {
        self.full_collection_name.ends_with(".$cmd")
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = body;
        if buf.len() < 4 {
            return Err(violation("OP_QUERY shorter than its flags"));
        }
        let flags = buf.get_u32_le();
        let end = buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::MissingTerminator)?;
        let full_collection_name = std::str::from_utf8(&buf[..end])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        buf.advance(end + 1);
        if buf.len() < 8 {
            return Err(violation("OP_QUERY truncated before skip/return"));
        }
        let number_to_skip = buf.get_i32_le();
        let number_to_return = buf.get_i32_le();
        let (query, n) = Document::decode(buf)?;
        buf.advance(n);
        let return_fields = if buf.is_empty() {
            None
        } else {
            let (doc, n) = Document::decode(buf)?;
            buf.advance(n);
            Some(doc)
        };
        if !buf.is_empty() {
            return Err(violation(format!("{} trailing bytes in OP_QUERY", buf.len())));
        }
        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields,
        })
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.flags);
        out.put_slice(self.full_collection_name.as_bytes());
        out.put_u8(0);
        out.put_i32_le(self.number_to_skip);
        out.put_i32_le(self.number_to_return);
        self.query.write_to(out);
        if let Some(fields) = &self.return_fields {
            fields.write_to(out);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub fn new(doc: Document) -> Self {
        Self {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc],
        }
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = body;
        if buf.len() < 20 {
            return Err(violation("OP_REPLY shorter than its fixed fields"));
        }
        let response_flags = buf.get_u32_le();
        let cursor_id = buf.get_i64_le();
        let starting_from = buf.get_i32_le();
        let number_returned = buf.get_i32_le();
        let mut documents = Vec::new();
        while !buf.is_empty() {
            let (doc, n) = Document::decode(buf)?;
            buf.advance(n);
            documents.push(doc);
        }
        if documents.len() as i64 != number_returned as i64 {
            return Err(violation(format!(
                "OP_REPLY declares {number_returned} documents, carries {}",
                documents.len()
            )));
        }
        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.response_flags);
        out.put_i64_le(self.cursor_id);
        out.put_i32_le(self.starting_from);
        out.put_i32_le(self.documents.len() as i32);
        for doc in &self.documents {
            doc.write_to(out);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Msg(OpMsg),
    Query(OpQuery),
    Reply(OpReply),
}

impl Message {
    pub fn op_code(&self) -> i32 {
        match self {
            Message::Msg(_) => OP_MSG,
            Message::Query(_) => OP_QUERY,
            Message::Reply(_) => OP_REPLY,
        }
    }

    /// First document of a reply, whichever envelope carried it.
    pub fn first_document(&self) -> Option<&Document> {
        match self {
            Message::Msg(m) => m.documents().into_iter().next(),
            Message::Query(q) => Some(&q.query),
            Message::Reply(r) => r.documents.first(),
        }
    }
}

/// One undecoded message: parsed header plus raw body bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(&self) -> Result<Message, ProtocolError> {
        decode_body(&self.header, &self.body)
    }

    /// False only for an OP_MSG carrying `moreToCome`, which the receiver must not
    /// answer. Reads the flag word without decoding the sections.
    pub fn expects_reply(&self) -> bool {
        if self.header.op_code != OP_MSG {
            return true;
        }
        match self.body.get(..4) {
            Some(word) => {
                let flag_bits = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                flag_bits & flags::MORE_TO_COME == 0
            }
            None => true,
        }
    }
}

fn decode_body(header: &MessageHeader, body: &[u8]) -> Result<Message, ProtocolError> {
    match header.op_code {
        OP_MSG => OpMsg::decode(body, header).map(Message::Msg),
        OP_QUERY => OpQuery::decode(body).map(Message::Query),
        OP_REPLY => OpReply::decode(body).map(Message::Reply),
        other => Err(violation(format!("unsupported opcode {other}"))),
    }
}

/// Decodes one complete message from the front of `bytes`.
pub fn decode_message(bytes: &[u8]) -> Result<(MessageHeader, Message), ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Incomplete {
            expected: HEADER_LEN,
            received: bytes.len(),
        });
    }
    let mut head = [0u8; HEADER_LEN];
    head.copy_from_slice(&bytes[..HEADER_LEN]);
    let header = MessageHeader::parse(&head);
    let total = HEADER_LEN + header.body_len()?;
    if bytes.len() < total {
        return Err(ProtocolError::Incomplete {
            expected: total,
            received: bytes.len(),
        });
    }
    let message = decode_body(&header, &bytes[HEADER_LEN..total])?;
    Ok((header, message))
}

/// Encodes a full wire message; the length field is computed from the payload.
pub fn encode_message(request_id: i32, response_to: i32, message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    MessageHeader {
        message_length: 0,
        request_id,
        response_to,
        op_code: message.op_code(),
    }
    .write_to(&mut out);
    let checksum = match message {
        Message::Msg(m) => {
            m.write_body(&mut out);
            m.flags & flags::CHECKSUM_PRESENT != 0
        }
        Message::Query(q) => {
            q.write_body(&mut out);
            false
        }
        Message::Reply(r) => {
            r.write_body(&mut out);
            false
        }
    };
    let len = out.len() + if checksum { 4 } else { 0 };
    out[..4].copy_from_slice(&(len as i32).to_le_bytes());
    if checksum {
        let crc = crc32c::crc32c(&out);
        out.put_u32_le(crc);
    }
    out
}

async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    offset: usize,
    expected: usize,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::Incomplete {
                expected,
                received: offset + filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Reads exactly one frame: a full header, then `length - 16` body bytes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    read_full(reader, &mut head, 0, HEADER_LEN).await?;
    let header = MessageHeader::parse(&head);
    let body_len = header.body_len()?;
    let mut body = vec![0u8; body_len];
    read_full(reader, &mut body, HEADER_LEN, HEADER_LEN + body_len).await?;
    Ok(Frame { header, body })
}

pub async fn read_message<R>(reader: &mut R) -> Result<(MessageHeader, Message), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader).await?;
    let message = frame.decode()?;
    Ok((frame.header, message))
}

pub async fn write_message<W>(
    writer: &mut W,
    request_id: i32,
    response_to: i32,
    message: &Message,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(request_id, response_to, message);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
