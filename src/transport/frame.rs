//! RPC message framing: length-prefixed records carrying
//! `(verb, metadata, payload)`, with an optional CRC32 over header + payload.

use bytes::{Bytes, BytesMut};

use crate::utils::TsoError;

/// RPC verb type as it appears on the wire.
pub type Verb = u8;

/// Controller <-> consensus verbs.
pub const GET_PAXOS_LEADER_URL: Verb = 110;
pub const UPDATE_PAXOS: Verb = 111;
pub const ACK_PAXOS: Verb = 112;

/// Controller -> hardware clock service.
pub const GET_ATOMIC_CLOCK_TIME: Verb = 115;
/// Client -> worker: get a timestamp batch.
pub const GET_GPS_CLOCK_TIME: Verb = 116;
/// Response wrapper.
pub const ACK_TIME: Verb = 117;

/// Client -> controller queries.
pub const GET_TSO_MASTER_URL: Verb = 118;
pub const GET_TSO_WORKERS_URLS: Verb = 119;

const FRAME_MAGIC: u8 = 0xC5;
const FRAME_VERSION: u8 = 1;

const FEAT_REQUEST_ID: u8 = 0x1;
const FEAT_RESPONSE_ID: u8 = 0x2;
const FEAT_CHECKSUM: u8 = 0x4;
const FEAT_KNOWN_MASK: u8 =
    FEAT_REQUEST_ID | FEAT_RESPONSE_ID | FEAT_CHECKSUM;

/// magic + version + features + verb + payload_len.
const FIXED_HEADER_LEN: usize = 8;

/// Hard cap on a single record's payload; anything larger is treated as a
/// framing error rather than an allocation request.
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Per-message metadata carried in the frame header.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct MessageMetadata {
    /// Set by the requester for reply correlation.
    pub request_id: Option<u64>,

    /// Echoes the request's id on a reply.
    pub response_id: Option<u64>,
}

impl MessageMetadata {
    /// Metadata of a fresh request.
    pub fn request(id: u64) -> Self {
        MessageMetadata {
            request_id: Some(id),
            response_id: None,
        }
    }

    /// Metadata of a reply to the given request id.
    pub fn response_to(id: u64) -> Self {
        MessageMetadata {
            request_id: None,
            response_id: Some(id),
        }
    }
}

/// One parsed inbound RPC record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RpcMessage {
    pub verb: Verb,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

/// Encodes one record into its wire form, ready to hand to a connection.
pub fn encode_frame(
    verb: Verb,
    payload: &[u8],
    metadata: &MessageMetadata,
    with_checksum: bool,
) -> Result<Bytes, TsoError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(TsoError::msg(format!(
            "payload of {} bytes exceeds frame limit",
            payload.len()
        )));
    }

    let mut features = 0u8;
    if metadata.request_id.is_some() {
        features |= FEAT_REQUEST_ID;
    }
    if metadata.response_id.is_some() {
        features |= FEAT_RESPONSE_ID;
    }
    if with_checksum {
        features |= FEAT_CHECKSUM;
    }

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + 20 + payload.len());
    buf.extend_from_slice(&[FRAME_MAGIC, FRAME_VERSION, features, verb]);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    if let Some(id) = metadata.request_id {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    if let Some(id) = metadata.response_id {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    let crc_offset = buf.len();
    if with_checksum {
        buf.extend_from_slice(&0u32.to_le_bytes());
    }
    buf.extend_from_slice(payload);

    if with_checksum {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..crc_offset]);
        hasher.update(&buf[crc_offset + 4..]);
        let crc = hasher.finalize();
        buf[crc_offset..crc_offset + 4].copy_from_slice(&crc.to_le_bytes());
    }

    Ok(buf.freeze())
}

/// Incremental framing parser. Fed arbitrary byte chunks; a single chunk may
/// carry a partial record or several records.
#[derive(Debug, Default)]
pub struct RpcParser {
    buf: BytesMut,
}

impl RpcParser {
    pub fn new() -> Self {
        RpcParser {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Appends an inbound chunk to the parse buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// True if at least one whole record (or a malformed header that will
    /// produce a parse error) is buffered.
    pub fn can_dispatch(&self) -> bool {
        match self.frame_len() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(_) => true, // error is also "dispatchable"
        }
    }

    /// Pops the next complete record, `Ok(None)` if more bytes are needed.
    pub fn next_msg(&mut self) -> Result<Option<RpcMessage>, TsoError> {
        let total = match self.frame_len()? {
            Some(total) => total,
            None => return Ok(None),
        };

        let frame = self.buf.split_to(total);
        let features = frame[2];
        let verb = frame[3];

        let mut metadata = MessageMetadata::default();
        let mut off = FIXED_HEADER_LEN;
        if features & FEAT_REQUEST_ID != 0 {
            metadata.request_id =
                Some(u64::from_le_bytes(frame[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        if features & FEAT_RESPONSE_ID != 0 {
            metadata.response_id =
                Some(u64::from_le_bytes(frame[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        if features & FEAT_CHECKSUM != 0 {
            let expected =
                u32::from_le_bytes(frame[off..off + 4].try_into().unwrap());
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&frame[..off]);
            hasher.update(&frame[off + 4..]);
            let got = hasher.finalize();
            if got != expected {
                return Err(TsoError::ParserError(format!(
                    "crc mismatch: expected {:08x} got {:08x}",
                    expected, got
                )));
            }
            off += 4;
        }

        let payload = Bytes::copy_from_slice(&frame[off..]);
        Ok(Some(RpcMessage {
            verb,
            metadata,
            payload,
        }))
    }

    /// Pops up to `max` complete records. Stops early at the first incomplete
    /// record; a parse error aborts the batch.
    pub fn dispatch_some(
        &mut self,
        max: usize,
    ) -> Result<Vec<RpcMessage>, TsoError> {
        let mut msgs = Vec::new();
        while msgs.len() < max {
            match self.next_msg()? {
                Some(msg) => msgs.push(msg),
                None => break,
            }
        }
        Ok(msgs)
    }

    /// Total byte length of the frame at the head of the buffer, `None` if
    /// not enough bytes have arrived to know or to complete it.
    fn frame_len(&self) -> Result<Option<usize>, TsoError> {
        if self.buf.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0] != FRAME_MAGIC {
            return Err(TsoError::ParserError(format!(
                "bad frame magic {:#04x}",
                self.buf[0]
            )));
        }
        if self.buf[1] != FRAME_VERSION {
            return Err(TsoError::ParserError(format!(
                "unsupported frame version {}",
                self.buf[1]
            )));
        }
        let features = self.buf[2];
        if features & !FEAT_KNOWN_MASK != 0 {
            return Err(TsoError::ParserError(format!(
                "unknown feature bits {:#04x}",
                features
            )));
        }
        let payload_len =
            u32::from_le_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(TsoError::ParserError(format!(
                "payload length {} exceeds frame limit",
                payload_len
            )));
        }

        let mut total = FIXED_HEADER_LEN + payload_len;
        if features & FEAT_REQUEST_ID != 0 {
            total += 8;
        }
        if features & FEAT_RESPONSE_ID != 0 {
            total += 8;
        }
        if features & FEAT_CHECKSUM != 0 {
            total += 4;
        }

        if self.buf.len() < total {
            Ok(None)
        } else {
            Ok(Some(total))
        }
    }
}
