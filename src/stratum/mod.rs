pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{Connection, Protocol};
pub use server::ProxyServer;
