//! dbx-protocol - Wire codecs for the dbx bridge.
//!
//! This crate holds the I/O-free parts of the bridge protocol so that both
//! the bridge itself and remote peers can share one implementation.
//!
//! # Main Components
//!
//! - **Blocks**: 5-byte length+tag headers, argument lists, request prefixes
//! - **Buffer**: growable byte buffer with fixed growth increments
//! - **Command**: operation codes carried in the request prefix
//! - **MGWSI**: the legacy gateway header, item framing and base-62 sizes
//!
//! # Example
//!
//! ```rust
//! use dbx_protocol::{decode_arguments, Command, RequestBuilder, PREFIX_LEN};
//!
//! let frame = RequestBuilder::new(Command::Set, 0)
//!     .arg("^Customer")
//!     .arg("1")
//!     .arg("Smith,John")
//!     .build()
//!     .unwrap();
//!
//! let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
//! assert_eq!(args[0].as_str(), "^Customer");
//! assert_eq!(args.len(), 3);
//! ```

pub mod block;
pub mod buffer;
pub mod command;
pub mod error;
pub mod mgwsi;

// Re-export main types for convenience
pub use block::{
    decode_arguments, decode_blocks, encode_block, leading_double, leading_int, Argument, Block,
    BlockHeader, DataType, OwnedArgument, RequestBuilder, RequestPrefix, Sort,
    DEFAULT_OUTPUT_SIZE, HEADER_LEN, MAX_ARGS, PREFIX_LEN,
};
pub use buffer::Buffer;
pub use command::Command;
pub use error::{ProtocolError, ProtocolResult};
