//! Client side of the primary `dbx1` protocol.
//!
//! After a one-line handshake naming the namespace, the server answers with
//! its version string. Each request is then sent exactly as the caller
//! encoded it and answered by one block: a 5-byte header followed by the
//! payload length it announces.

use dbx_protocol::{BlockHeader, Command, RequestBuilder, HEADER_LEN};
use tracing::{debug, info};

use super::socket::Socket;
use crate::config::ConnectionConfig;
use crate::driver::version::VersionInfo;
use crate::driver::DbType;
use crate::error::{DbxError, DbxResult};
use crate::request::Reply;

/// First bytes a primary protocol server expects
pub const HANDSHAKE_MAGIC: &str = "dbx1";

pub struct PrimaryClient {
    socket: Socket,
    version: Option<VersionInfo>,
}

pub fn handshake_line(namespace: &str) -> String {
    format!("{}~{}\n", HANDSHAKE_MAGIC, namespace)
}

impl PrimaryClient {
    pub fn connect(config: &ConnectionConfig) -> DbxResult<Self> {
        let mut socket = Socket::connect(
            config.host.as_deref().unwrap_or_default(),
            config.port.unwrap_or_default(),
            config.timeout,
        )?;

        socket.write(handshake_line(&config.namespace).as_bytes())?;
        let (_, payload) = read_block(&mut socket)?;
        let text = String::from_utf8_lossy(&payload).into_owned();
        debug!("Server version: {}", text);

        let version = match config.db_type {
            DbType::YottaDb | DbType::Gtm => VersionInfo::parse_ydb(&text, config.db_type.product()),
            DbType::Cache | DbType::Iris => VersionInfo::parse_isc(&text),
        };
        info!("Connected to {} ({})", socket.peer(), config.db_type);
        Ok(Self { socket, version })
    }

    pub fn version(&self) -> Option<VersionInfo> {
        self.version.clone()
    }

    /// Forward an encoded request and return the server's block untouched.
    pub fn command(&mut self, request: &[u8]) -> DbxResult<Reply> {
        self.socket.write(request)?;
        let (header, payload) = read_block(&mut self.socket)?;
        let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
        raw.extend_from_slice(&header);
        raw.extend_from_slice(&payload);
        Ok(Reply::Raw(raw))
    }

    /// Tell the server the connection is ending, then disconnect. Failures
    /// in the exchange do not matter at this point.
    pub fn close(&mut self, handle: u32) {
        let result = RequestBuilder::new(Command::Close, handle)
            .build()
            .map_err(DbxError::from)
            .and_then(|frame| self.command(&frame));
        if let Err(e) = result {
            debug!("Ignoring close failure: {}", e);
        }
        self.socket.close();
    }
}

/// Read one reply block. The whole announced payload is consumed whatever
/// the block's sort, so the stream stays aligned on the next header.
fn read_block(socket: &mut Socket) -> DbxResult<([u8; HEADER_LEN], Vec<u8>)> {
    let head = socket.read_exact(HEADER_LEN)?;
    let header = [head[0], head[1], head[2], head[3], head[4]];
    let len = BlockHeader::wire_len(header) as usize;
    let payload = if len > 0 {
        socket.read_exact(len)?
    } else {
        Vec::new()
    };
    Ok((header, payload))
}
