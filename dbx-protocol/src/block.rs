//! Wire blocks.
//!
//! Every item on the wire is a 5-byte header followed by its payload:
//!
//! ```text
//! +------------------+-----------------------+-----------------+
//! | len: u32 (LE)    | tag: sort * 20 + type | payload (len)   |
//! +------------------+-----------------------+-----------------+
//! ```
//!
//! A request starts with a 15-byte prefix (three such headers carrying the
//! request length, the output capacity and the connection handle) followed
//! by argument blocks terminated by an end-of-data block.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};

pub const HEADER_LEN: usize = 5;
pub const PREFIX_LEN: usize = 3 * HEADER_LEN;
pub const MAX_ARGS: usize = 64;
pub const DEFAULT_OUTPUT_SIZE: u32 = 32768;

const TAG_BASE: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Sort {
    Invalid = 0,
    Data = 1,
    Subscript = 2,
    Global = 3,
    Eod = 9,
    Status = 10,
    Error = 11,
}

impl Sort {
    /// Unrecognised codes collapse to `Invalid`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Sort::Data,
            2 => Sort::Subscript,
            3 => Sort::Global,
            9 => Sort::Eod,
            10 => Sort::Status,
            11 => Sort::Error,
            _ => Sort::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DataType {
    None = 0,
    DbxStr = 1,
    Str = 2,
    Int = 4,
    Int64 = 5,
    Double = 6,
    Oref = 7,
    Null = 10,
}

impl DataType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DataType::DbxStr,
            2 => DataType::Str,
            4 => DataType::Int,
            5 => DataType::Int64,
            6 => DataType::Double,
            7 => DataType::Oref,
            10 => DataType::Null,
            _ => DataType::None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Decoded 5-byte block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub len: u32,
    pub sort: Sort,
    pub data_type: DataType,
}

impl BlockHeader {
    pub fn new(len: u32, sort: Sort, data_type: DataType) -> Self {
        Self {
            len,
            sort,
            data_type,
        }
    }

    /// Header of an ordinary result block
    pub fn data(len: u32) -> Self {
        Self::new(len, Sort::Data, DataType::DbxStr)
    }

    /// Header of an error message block
    pub fn error(len: u32) -> Self {
        Self::new(len, Sort::Error, DataType::DbxStr)
    }

    pub fn eod() -> Self {
        Self::new(0, Sort::Eod, DataType::None)
    }

    pub fn tag(&self) -> u8 {
        self.sort.code() * TAG_BASE + self.data_type.code()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.len.to_le_bytes();
        [len[0], len[1], len[2], len[3], self.tag()]
    }

    /// Write the header at `offset`. The caller guarantees room for
    /// `HEADER_LEN` bytes there.
    pub fn write_to(&self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + HEADER_LEN].copy_from_slice(&self.encode());
    }

    /// The length field as sent, whatever the sort. A peer reading blocks
    /// off a stream consumes this many payload bytes.
    pub fn wire_len(raw: [u8; HEADER_LEN]) -> u32 {
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    /// Status blocks carry no length-prefixed payload, so their length is
    /// reported as zero whatever the first four bytes say.
    pub fn decode(raw: [u8; HEADER_LEN]) -> Self {
        let len = Self::wire_len(raw);
        let sort = Sort::from_code(raw[4] / TAG_BASE);
        let data_type = DataType::from_code(raw[4] % TAG_BASE);
        let len = if sort == Sort::Status { 0 } else { len };
        Self {
            len,
            sort,
            data_type,
        }
    }

    pub fn read_from(buf: &[u8], offset: usize) -> ProtocolResult<Self> {
        let raw = buf
            .get(offset..offset + HEADER_LEN)
            .ok_or(ProtocolError::Truncated {
                offset,
                needed: HEADER_LEN,
                available: buf.len().saturating_sub(offset),
            })?;
        Ok(Self::decode([raw[0], raw[1], raw[2], raw[3], raw[4]]))
    }
}

/// Length field for `len` payload bytes.
pub fn block_len(len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::MessageTooLarge(len))
}

/// Append one block (header and payload) to `out`.
pub fn encode_block(
    out: &mut Buffer,
    data: &[u8],
    sort: Sort,
    data_type: DataType,
) -> ProtocolResult<()> {
    let header = BlockHeader::new(block_len(data.len())?, sort, data_type);
    out.append(&header.encode());
    out.append(data);
    Ok(())
}

/// One argument of a request, borrowed from the input buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Argument<'a> {
    pub sort: Sort,
    pub data_type: DataType,
    pub bytes: &'a [u8],
}

impl<'a> Argument<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            sort: Sort::Data,
            data_type: DataType::Str,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_str(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.bytes)
    }

    /// Integer value of the leading digits, 0 when there are none.
    pub fn to_int(&self) -> i64 {
        leading_int(self.bytes)
    }

    pub fn to_double(&self) -> f64 {
        leading_double(self.bytes)
    }

    pub fn to_owned_arg(&self) -> OwnedArgument {
        OwnedArgument {
            sort: self.sort,
            data_type: self.data_type,
            bytes: self.bytes.to_vec(),
        }
    }
}

/// An argument that owns its bytes, for values that must outlive the
/// request buffer (e.g. work handed to another thread)
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedArgument {
    pub sort: Sort,
    pub data_type: DataType,
    pub bytes: Vec<u8>,
}

impl OwnedArgument {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            sort: Sort::Data,
            data_type: DataType::Str,
            bytes: bytes.into(),
        }
    }

    pub fn borrow(&self) -> Argument<'_> {
        Argument {
            sort: self.sort,
            data_type: self.data_type,
            bytes: &self.bytes,
        }
    }
}

/// Decode argument blocks starting at `offset`.
///
/// Stops at the first end-of-data block, at the `MAX_ARGS` ceiling, or at
/// the end of the buffer, whichever comes first. Bytes after the
/// terminator are never inspected.
pub fn decode_arguments(buf: &[u8], mut offset: usize) -> ProtocolResult<Vec<Argument<'_>>> {
    let mut args = Vec::new();
    while args.len() < MAX_ARGS && offset < buf.len() {
        let header = BlockHeader::read_from(buf, offset)?;
        offset += HEADER_LEN;
        if header.sort == Sort::Eod {
            break;
        }
        let bytes = payload(buf, offset, header.len)?;
        offset += bytes.len();
        args.push(Argument {
            sort: header.sort,
            data_type: header.data_type,
            bytes,
        });
    }
    Ok(args)
}

/// A decoded response block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block<'a> {
    pub header: BlockHeader,
    pub payload: &'a [u8],
}

impl<'a> Block<'a> {
    pub fn is_error(&self) -> bool {
        self.header.sort == Sort::Error
    }

    pub fn as_str(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.payload)
    }
}

/// Decode every block in a response buffer, stopping at end-of-data.
pub fn decode_blocks(buf: &[u8]) -> ProtocolResult<Vec<Block<'_>>> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let header = BlockHeader::read_from(buf, offset)?;
        offset += HEADER_LEN;
        if header.sort == Sort::Eod {
            break;
        }
        let bytes = payload(buf, offset, header.len)?;
        offset += bytes.len();
        blocks.push(Block {
            header,
            payload: bytes,
        });
    }
    Ok(blocks)
}

fn payload(buf: &[u8], offset: usize, len: u32) -> ProtocolResult<&[u8]> {
    let len = len as usize;
    buf.get(offset..offset.saturating_add(len))
        .ok_or(ProtocolError::Truncated {
            offset,
            needed: len,
            available: buf.len().saturating_sub(offset),
        })
}

/// The fixed 15-byte start of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPrefix {
    pub total_len: u32,
    pub output_size: u32,
    pub handle: u32,
    /// Raw command code; see [`RequestPrefix::command`]
    pub command_code: u8,
}

impl RequestPrefix {
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command_code)
    }

    pub fn encode(&self) -> [u8; PREFIX_LEN] {
        let mut out = [0u8; PREFIX_LEN];
        out[0..4].copy_from_slice(&self.total_len.to_le_bytes());
        out[4] = self.command_code;
        out[5..9].copy_from_slice(&self.output_size.to_le_bytes());
        out[10..14].copy_from_slice(&self.handle.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < PREFIX_LEN {
            return Err(ProtocolError::ShortPrefix(buf.len()));
        }
        let field = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(Self {
            total_len: field(0),
            output_size: field(5),
            handle: field(10),
            command_code: buf[4],
        })
    }
}

/// Builds request frames the way a host binding does
///
/// ```
/// use dbx_protocol::{Command, RequestBuilder, RequestPrefix, decode_arguments, PREFIX_LEN};
///
/// let frame = RequestBuilder::new(Command::Get, 3).arg("^g").arg("1").build().unwrap();
/// let prefix = RequestPrefix::decode(&frame).unwrap();
/// assert_eq!(prefix.handle, 3);
/// assert_eq!(prefix.command(), Some(Command::Get));
/// assert_eq!(decode_arguments(&frame, PREFIX_LEN).unwrap().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    command: Command,
    handle: u32,
    output_size: u32,
    body: Buffer,
    /// First argument that could not be framed
    error: Option<ProtocolError>,
}

impl RequestBuilder {
    pub fn new(command: Command, handle: u32) -> Self {
        Self {
            command,
            handle,
            output_size: DEFAULT_OUTPUT_SIZE,
            body: Buffer::new(256, 256),
            error: None,
        }
    }

    pub fn output_size(mut self, size: u32) -> Self {
        self.output_size = size;
        self
    }

    pub fn arg(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.push(Sort::Data, DataType::Str, bytes.as_ref());
        self
    }

    pub fn int_arg(mut self, value: i64) -> Self {
        self.push(Sort::Data, DataType::Int, value.to_string().as_bytes());
        self
    }

    pub fn double_arg(mut self, value: f64) -> Self {
        self.push(Sort::Data, DataType::Double, value.to_string().as_bytes());
        self
    }

    pub fn push(&mut self, sort: Sort, data_type: DataType, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = encode_block(&mut self.body, bytes, sort, data_type) {
            self.error = Some(e);
        }
    }

    /// The finished frame, or the error from the first argument too large
    /// to frame.
    pub fn build(self) -> ProtocolResult<Vec<u8>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let total = PREFIX_LEN + self.body.len() + HEADER_LEN;
        let prefix = RequestPrefix {
            total_len: block_len(total)?,
            output_size: self.output_size,
            handle: self.handle,
            command_code: self.command.code(),
        };
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&prefix.encode());
        frame.extend_from_slice(self.body.as_slice());
        frame.extend_from_slice(&BlockHeader::eod().encode());
        Ok(frame)
    }
}

/// Parse optional whitespace, an optional sign and leading digits; 0 when
/// no digits are present.
pub fn leading_int(bytes: &[u8]) -> i64 {
    let text = trim_start(bytes);
    let (negative, digits) = match text.first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let mut value: i64 = 0;
    for &c in digits.iter().take_while(|c| c.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add(i64::from(c - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}

/// Parse the longest numeric prefix as a float; 0.0 when there is none.
pub fn leading_double(bytes: &[u8]) -> f64 {
    let text = trim_start(bytes);
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < text.len() {
        let c = text[end];
        let accept = match c {
            b'0'..=b'9' => {
                seen_digit = true;
                true
            }
            b'+' | b'-' => end == 0 || matches!(text[end - 1], b'e' | b'E'),
            b'.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                true
            }
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                true
            }
            _ => false,
        };
        if !accept {
            break;
        }
        end += 1;
    }
    let mut candidate = &text[..end];
    while !candidate.is_empty() {
        if let Some(v) = std::str::from_utf8(candidate)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
        {
            return v;
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    0.0
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = BlockHeader::new(0x0102_0304, Sort::Data, DataType::DbxStr);
        assert_eq!(header.encode(), [0x04, 0x03, 0x02, 0x01, 21]);
        assert_eq!(BlockHeader::error(3).tag(), 221);
    }

    #[test]
    fn test_decode_unknown_sort_is_invalid() {
        let header = BlockHeader::decode([1, 0, 0, 0, 5 * 20 + 1]);
        assert_eq!(header.sort, Sort::Invalid);
        assert_eq!(header.data_type, DataType::DbxStr);
        assert_eq!(header.len, 1);
    }

    #[test]
    fn test_decode_status_forces_zero_length() {
        let header = BlockHeader::decode([9, 9, 0, 0, 10 * 20 + 4]);
        assert_eq!(header.sort, Sort::Status);
        assert_eq!(header.data_type, DataType::Int);
        assert_eq!(header.len, 0);
    }

    #[test]
    fn test_write_to_offset() {
        let mut buf = [0u8; 12];
        BlockHeader::data(7).write_to(&mut buf, 5);
        assert_eq!(&buf[5..10], &[7, 0, 0, 0, 21]);
    }

    #[test]
    fn test_read_from_short_buffer() {
        let err = BlockHeader::read_from(&[1, 2, 3], 0).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                offset: 0,
                needed: 5,
                available: 3
            }
        );
    }

    #[test]
    fn test_arguments_borrow_input() {
        let frame = RequestBuilder::new(Command::Set, 0)
            .arg("^g")
            .arg("1")
            .arg("hello")
            .build()
            .unwrap();
        let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[2].bytes, b"hello");
        let base = frame.as_ptr() as usize;
        let arg_ptr = args[2].bytes.as_ptr() as usize;
        assert!(arg_ptr > base && arg_ptr < base + frame.len());
    }

    #[test]
    fn test_argument_ceiling() {
        let mut builder = RequestBuilder::new(Command::Function, 0);
        for n in 0..70 {
            builder = builder.arg(n.to_string());
        }
        let frame = builder.build().unwrap();
        let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
        assert_eq!(args.len(), MAX_ARGS);
    }

    #[test]
    fn test_truncated_payload() {
        let mut frame = RequestBuilder::new(Command::Get, 0).arg("abcdef").build().unwrap();
        frame.truncate(PREFIX_LEN + HEADER_LEN + 2);
        assert!(matches!(
            decode_arguments(&frame, PREFIX_LEN),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_prefix_fields() {
        let frame = RequestBuilder::new(Command::TStart, 31)
            .output_size(1024)
            .build()
            .unwrap();
        let prefix = RequestPrefix::decode(&frame).unwrap();
        assert_eq!(prefix.total_len as usize, frame.len());
        assert_eq!(prefix.output_size, 1024);
        assert_eq!(prefix.handle, 31);
        assert_eq!(prefix.command(), Some(Command::TStart));
        assert_eq!(frame.len(), PREFIX_LEN + HEADER_LEN);
    }

    #[test]
    fn test_typed_arguments() {
        let frame = RequestBuilder::new(Command::Increment, 0)
            .arg("^c")
            .int_arg(-42)
            .double_arg(2.5)
            .build()
            .unwrap();
        let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
        assert_eq!(args[1].data_type, DataType::Int);
        assert_eq!(args[1].to_int(), -42);
        assert_eq!(args[2].data_type, DataType::Double);
        assert_eq!(args[2].to_double(), 2.5);
    }

    #[test]
    fn test_leading_numbers() {
        assert_eq!(leading_int(b"  17abc"), 17);
        assert_eq!(leading_int(b"-3"), -3);
        assert_eq!(leading_int(b"x1"), 0);
        assert_eq!(leading_double(b"1.5e3xyz"), 1500.0);
        assert_eq!(leading_double(b"7e"), 7.0);
        assert_eq!(leading_double(b"abc"), 0.0);
    }

    #[test]
    fn test_decode_blocks_stops_at_eod() {
        let mut out = Buffer::new(64, 64);
        encode_block(&mut out, b"a", Sort::Data, DataType::DbxStr).unwrap();
        encode_block(&mut out, b"bc", Sort::Data, DataType::DbxStr).unwrap();
        out.append(&BlockHeader::eod().encode());
        out.append(b"garbage");
        let blocks = decode_blocks(out.as_slice()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].payload, b"bc");
        assert!(!blocks[0].is_error());
    }

    #[test]
    fn test_status_length_kept_on_the_wire() {
        let raw = [2, 0, 0, 0, 201];
        assert_eq!(BlockHeader::decode(raw).sort, Sort::Status);
        assert_eq!(BlockHeader::decode(raw).len, 0);
        assert_eq!(BlockHeader::wire_len(raw), 2);
    }

    #[test]
    fn test_block_len_limit() {
        assert_eq!(block_len(5).unwrap(), 5);
        assert_eq!(block_len(u32::MAX as usize).unwrap(), u32::MAX);
        if let Some(too_big) = (u32::MAX as usize).checked_add(1) {
            assert_eq!(
                block_len(too_big),
                Err(ProtocolError::MessageTooLarge(too_big))
            );
        }
    }
}
