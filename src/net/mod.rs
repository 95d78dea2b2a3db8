//! Network transports.
//!
//! - [`primary`]: the `dbx1` block protocol spoken by the bridge's own
//!   server routine
//! - [`mgwsi`]: the legacy gateway protocol
//!
//! Both run over [`socket::Socket`], a blocking client with per-connection
//! read and write timeouts.

pub mod mgwsi;
pub mod primary;
pub mod socket;

pub use mgwsi::GatewayClient;
pub use primary::PrimaryClient;
pub use socket::Socket;
