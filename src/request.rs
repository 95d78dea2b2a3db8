//! Request context and reply encoding.
//!
//! A request is the 15-byte prefix followed by argument blocks; the reply
//! is written into a [`Buffer`] as a sequence of blocks, with failures
//! carried by a single error block.

use dbx_protocol::{
    decode_arguments, encode_block, Argument, Buffer, Command, DataType, ProtocolError,
    RequestPrefix, Sort, DEFAULT_OUTPUT_SIZE, PREFIX_LEN,
};

use crate::error::{DbxError, DbxResult};

/// Output buffers grow in steps of this many bytes
pub const OUTPUT_INCREMENT: usize = 32768;

/// A decoded request borrowing its arguments from the input bytes
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub prefix: RequestPrefix,
    pub command: Command,
    pub args: Vec<Argument<'a>>,
    pub raw: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn parse(input: &'a [u8]) -> DbxResult<Self> {
        let prefix = RequestPrefix::decode(input)?;
        let command = prefix
            .command()
            .ok_or(ProtocolError::UnknownCommand(prefix.command_code))?;
        let args = decode_arguments(input, PREFIX_LEN)?;
        let end = (prefix.total_len as usize).clamp(PREFIX_LEN, input.len());
        Ok(Self {
            prefix,
            command,
            args,
            raw: &input[..end],
        })
    }

    pub fn handle(&self) -> usize {
        self.prefix.handle as usize
    }

    /// Output buffer sized the way the caller asked for.
    pub fn output(&self) -> Buffer {
        let size = if self.prefix.output_size == 0 {
            DEFAULT_OUTPUT_SIZE as usize
        } else {
            self.prefix.output_size as usize
        };
        Buffer::new(size, OUTPUT_INCREMENT)
    }

    pub fn arg(&self, n: usize) -> Option<&Argument<'a>> {
        self.args.get(n)
    }

    /// First argument as a global name, which must not be empty.
    pub fn global(&self) -> DbxResult<String> {
        match self.args.first() {
            Some(arg) if !arg.is_empty() => Ok(arg.as_str().into_owned()),
            _ => Err(DbxError::backend(
                crate::driver::status::isc::BAD_GLOBAL,
                "Invalid global name",
            )),
        }
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A single string value
    Value(Vec<u8>),
    /// An object reference produced by a class operation
    Oref(i64),
    /// Subscripts of a node; empty at the end of a global
    Keys(Vec<Vec<u8>>),
    /// Blocks already encoded by a remote peer
    Raw(Vec<u8>),
}

impl Reply {
    /// The conventional "0" written by operations without a result.
    pub fn ok() -> Self {
        Reply::Value(b"0".to_vec())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Reply::Value(value.into().into_bytes())
    }

    /// Append the reply's blocks to `out`.
    pub fn encode(&self, out: &mut Buffer) -> DbxResult<()> {
        match self {
            Reply::Value(bytes) => encode_block(out, bytes, Sort::Data, DataType::DbxStr)?,
            Reply::Oref(oref) => {
                encode_block(out, oref.to_string().as_bytes(), Sort::Data, DataType::Oref)?
            }
            Reply::Keys(keys) if keys.is_empty() => {
                encode_block(out, b"", Sort::Data, DataType::DbxStr)?
            }
            Reply::Keys(keys) => {
                for key in keys {
                    encode_block(out, key, Sort::Data, DataType::DbxStr)?;
                }
            }
            Reply::Raw(bytes) => out.append(bytes),
        }
        Ok(())
    }

    /// Encode the reply, or an error block in its place when it cannot be
    /// framed.
    pub fn encode_or_error(&self, out: &mut Buffer) -> DbxResult<()> {
        let result = self.encode(out);
        if let Err(e) = &result {
            encode_error(out, e);
        }
        result
    }
}

/// Write `err` as the single error block of a response.
pub fn encode_error(out: &mut Buffer, err: &DbxError) {
    out.clear();
    if encode_block(out, err.wire_message().as_bytes(), Sort::Error, DataType::DbxStr).is_err() {
        out.clear();
    }
}

/// Status and encoded output of one dispatched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub output: Vec<u8>,
}

impl Response {
    pub fn new(status: i32, output: Buffer) -> Self {
        Self {
            status,
            output: output.into_vec(),
        }
    }

    pub fn is_error(&self) -> bool {
        dbx_protocol::decode_blocks(&self.output)
            .ok()
            .and_then(|blocks| blocks.first().map(|b| b.is_error()))
            .unwrap_or(false)
    }

    /// Payload of the first block as text.
    pub fn first_text(&self) -> String {
        dbx_protocol::decode_blocks(&self.output)
            .ok()
            .and_then(|blocks| blocks.first().map(|b| b.as_str().into_owned()))
            .unwrap_or_default()
    }
}
