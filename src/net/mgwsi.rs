//! Client side of the legacy MGWSI gateway protocol.

use dbx_protocol::mgwsi::{
    parse_reply, reply_len, GatewayHeader, GatewayReply, GatewayRequest, ItemType, BUFSIZE,
    PRODUCT,
};
use dbx_protocol::{Argument, Command};
use tracing::{debug, info};

use super::socket::Socket;
use crate::config::ConnectionConfig;
use crate::error::{DbxError, DbxResult};
use crate::request::Reply;

/// Longest UCI accepted by a local namespace change
const MAX_UCI_LEN: usize = 120;

pub struct GatewayClient {
    socket: Socket,
    header: GatewayHeader,
}

impl GatewayClient {
    pub fn connect(config: &ConnectionConfig) -> DbxResult<Self> {
        let socket = Socket::connect(config.host_or_default(), config.gateway_port(), config.timeout)?;
        let header = GatewayHeader {
            product: PRODUCT.to_string(),
            server: config.gateway_server().to_string(),
            uci: config.gateway_uci().to_string(),
            timeout: config.timeout.min(u64::from(u32::MAX)) as u32,
            no_retry: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage_mode: 0,
        };
        info!("Connected to gateway {} (server {})", socket.peer(), header.server);
        Ok(Self { socket, header })
    }

    pub fn uci(&self) -> &str {
        &self.header.uci
    }

    /// Run `command` with `args` as data items.
    ///
    /// Namespace requests never reach the gateway: the UCI is part of every
    /// request header, so it is read and changed locally.
    pub fn command(&mut self, command: Command, args: &[Argument<'_>]) -> DbxResult<Reply> {
        let code = command.gateway_code();
        match code {
            "gns" => return Ok(Reply::text(self.header.uci.clone())),
            "sns" => {
                if let Some(uci) = args.first().filter(|a| !a.is_empty() && a.len() < MAX_UCI_LEN) {
                    self.header.uci = uci.as_str().into_owned();
                }
                return Ok(Reply::text(self.header.uci.clone()));
            }
            "*" => return Err(DbxError::NotAvailable("Not Implemented".to_string())),
            _ => {}
        }

        let mut request = GatewayRequest::new(&self.header, code);
        for arg in args {
            request.add(arg.bytes, false, ItemType::Data)?;
        }
        let frame = request.finish()?;
        debug!("Gateway command {} ({} bytes)", code, frame.len());
        self.socket.write(&frame)?;

        let reply = self.receive()?;
        match parse_reply(&reply) {
            GatewayReply::Data(payload) => Ok(Reply::Value(payload)),
            GatewayReply::Error(message) => Err(DbxError::backend(
                crate::driver::status::isc::FAILURE,
                message,
            )),
        }
    }

    fn receive(&mut self) -> DbxResult<Vec<u8>> {
        let mut received = Vec::with_capacity(BUFSIZE);
        loop {
            if let Some(total) = reply_len(&received) {
                if received.len() >= total {
                    received.truncate(total);
                    return Ok(received);
                }
                let rest = self.socket.read_exact(total - received.len())?;
                received.extend_from_slice(&rest);
                continue;
            }
            let chunk = self.socket.read_some(BUFSIZE)?;
            received.extend_from_slice(&chunk);
        }
    }

    /// The gateway needs no goodbye; closing only disconnects.
    pub fn close(&mut self) {
        self.socket.close();
    }
}
