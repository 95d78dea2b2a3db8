//! The legacy MGWSI gateway format.
//!
//! A request is a single text header line followed by items:
//!
//! ```text
//! PHP<product>^P^<server>#<uci>#0#<timeout>#<no_retry>#<version>#<storage_mode>^<command>^SSSSS\n
//! ```
//!
//! `SSSSS` is the base-62 size of everything after the header, right aligned
//! and zero padded. Each item is a one byte code (digit count + type * 8 +
//! byref * 64), the decimal item length, then the raw payload.
//!
//! A reply starts with a five character base-62 payload size and a two
//! character reply type; the payload begins at [`RECV_HEAD`].

use crate::buffer::Buffer;
use crate::error::{ProtocolError, ProtocolResult};

pub const BUFSIZE: usize = 32768;
pub const RECV_HEAD: usize = 8;
pub const CHUNK_SIZE_BASE: u32 = 62;
pub const SIZE_FIELD_LEN: usize = 5;
pub const PRODUCT: &str = "g";

const ERROR_MARKER: &[u8] = b"ce";
const MAX_ITEM_DIGITS: usize = 7;

/// Base-62 digit for `n` (`0-9`, `A-Z`, `a-z`), or `None` when out of range.
pub fn encode_digit(n: u32) -> Option<u8> {
    match n {
        0..=9 => Some(b'0' + n as u8),
        10..=35 => Some(b'A' + (n - 10) as u8),
        36..=61 => Some(b'a' + (n - 36) as u8),
        _ => None,
    }
}

/// Value of a base-62 digit. Characters outside the alphabet count as 0.
pub fn decode_digit(c: u8) -> u32 {
    match c {
        b'0'..=b'9' => u32::from(c - b'0'),
        b'A'..=b'Z' => u32::from(c - b'A') + 10,
        b'a'..=b'z' => u32::from(c - b'a') + 36,
        _ => 0,
    }
}

/// Render `size` in base 10 or base 62, most significant digit first.
pub fn encode_size(size: u64, base: u32) -> String {
    if base == 10 {
        return size.to_string();
    }
    let base = u64::from(base);
    let mut digits = Vec::new();
    let mut rest = size;
    loop {
        // rest % base < 62, always a valid digit
        digits.push(encode_digit((rest % base) as u32).unwrap_or(b'0'));
        rest /= base;
        if rest == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

pub fn decode_size(encoded: &[u8], base: u32) -> u64 {
    if base == 10 {
        return encoded
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .fold(0u64, |acc, c| {
                acc.saturating_mul(10).saturating_add(u64::from(c - b'0'))
            });
    }
    encoded.iter().fold(0u64, |acc, &c| {
        acc.saturating_mul(u64::from(base))
            .saturating_add(u64::from(decode_digit(c)))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Data = 0,
    ArrayKey = 1,
    ArrayRecord = 2,
    Eod = 3,
    Oref = 5,
    /// Pre-formatted record data, appended without an item header
    ArrayRecordFormatted = 9,
}

impl ItemType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ItemType::Data),
            1 => Some(ItemType::ArrayKey),
            2 => Some(ItemType::ArrayRecord),
            3 => Some(ItemType::Eod),
            5 => Some(ItemType::Oref),
            9 => Some(ItemType::ArrayRecordFormatted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub size: usize,
    pub byref: bool,
    pub type_code: u8,
    /// Bytes taken by the code byte and the length digits
    pub header_len: usize,
}

pub fn encode_item_header(size: usize, byref: bool, item_type: ItemType) -> ProtocolResult<Vec<u8>> {
    let digits = encode_size(size as u64, 10);
    if digits.len() > MAX_ITEM_DIGITS {
        return Err(ProtocolError::MessageTooLarge(size));
    }
    let code = digits.len() as u8 + (item_type as u8) * 8 + u8::from(byref) * 64;
    let mut head = Vec::with_capacity(digits.len() + 1);
    head.push(code);
    head.extend_from_slice(digits.as_bytes());
    Ok(head)
}

pub fn decode_item_header(head: &[u8]) -> ProtocolResult<ItemHeader> {
    let code = *head
        .first()
        .ok_or_else(|| ProtocolError::InvalidItemHeader("empty item".to_string()))?;
    let digit_count = usize::from(code % 8);
    let digits = head.get(1..1 + digit_count).ok_or_else(|| {
        ProtocolError::InvalidItemHeader(format!(
            "expected {} length digits, found {}",
            digit_count,
            head.len() - 1
        ))
    })?;
    Ok(ItemHeader {
        size: decode_size(digits, 10) as usize,
        byref: code / 64 != 0,
        type_code: (code % 64) / 8,
        header_len: digit_count + 1,
    })
}

/// Per-gateway fields rendered into every request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayHeader {
    pub product: String,
    pub server: String,
    pub uci: String,
    pub timeout: u32,
    pub no_retry: bool,
    pub version: String,
    pub storage_mode: u32,
}

impl GatewayHeader {
    pub fn render(&self, command: &str) -> String {
        format!(
            "PHP{}^P^{}#{}#0#{}#{}#{}#{}^{}^00000\n",
            self.product,
            self.server,
            self.uci,
            self.timeout,
            u8::from(self.no_retry),
            self.version,
            self.storage_mode,
            command
        )
    }
}

/// An MGWSI request under construction
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    buf: Buffer,
    header_len: usize,
}

impl GatewayRequest {
    pub fn new(header: &GatewayHeader, command: &str) -> Self {
        let line = header.render(command);
        let mut buf = Buffer::new(BUFSIZE, BUFSIZE);
        buf.copy(line.as_bytes());
        Self {
            buf,
            header_len: line.len(),
        }
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn add(&mut self, data: &[u8], byref: bool, item_type: ItemType) -> ProtocolResult<()> {
        if item_type == ItemType::ArrayRecordFormatted {
            self.buf.append(data);
            return Ok(());
        }
        let head = encode_item_header(data.len(), byref, item_type)?;
        self.buf.append(&head);
        self.buf.append(data);
        Ok(())
    }

    /// Patch the body size into the header and return the frame.
    pub fn finish(mut self) -> ProtocolResult<Vec<u8>> {
        let body = self.buf.len() - self.header_len;
        let size = encode_size(body as u64, CHUNK_SIZE_BASE);
        if size.len() > SIZE_FIELD_LEN {
            return Err(ProtocolError::MessageTooLarge(body));
        }
        // the five size characters sit just before the trailing newline
        let field_end = self.header_len - 1;
        let at = field_end - size.len();
        self.buf.write_at(at, size.as_bytes());
        Ok(self.buf.into_vec())
    }
}

/// Total reply length announced by the first `RECV_HEAD` bytes, or `None`
/// while fewer bytes have arrived.
pub fn reply_len(received: &[u8]) -> Option<usize> {
    if received.len() < RECV_HEAD {
        return None;
    }
    let payload = decode_size(&received[..SIZE_FIELD_LEN], CHUNK_SIZE_BASE) as usize;
    Some(payload + RECV_HEAD)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayReply {
    Data(Vec<u8>),
    Error(String),
}

pub fn parse_reply(buf: &[u8]) -> GatewayReply {
    let payload = buf.get(RECV_HEAD..).unwrap_or_default();
    if buf.get(SIZE_FIELD_LEN..SIZE_FIELD_LEN + 2) == Some(ERROR_MARKER) {
        let message: Vec<u8> = payload
            .iter()
            .map(|&c| if c == b'%' { b'^' } else { c })
            .collect();
        return GatewayReply::Error(String::from_utf8_lossy(&message).into_owned());
    }
    GatewayReply::Data(payload.to_vec())
}

/// Build a reply frame the way a gateway server does.
pub fn encode_reply(reply_type: &str, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let size = encode_size(payload.len() as u64, CHUNK_SIZE_BASE);
    if size.len() > SIZE_FIELD_LEN {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(RECV_HEAD + payload.len());
    out.extend_from_slice(format!("{:0>5}", size).as_bytes());
    let mut kind = reply_type.as_bytes().to_vec();
    kind.resize(2, b' ');
    out.extend_from_slice(&kind);
    out.push(b'\n');
    out.extend_from_slice(payload);
    Ok(out)
}
