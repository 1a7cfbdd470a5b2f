//! ProxyDHCP server module.
//!
//! Answers PXE boot requests with boot-server information, leaving IP
//! address assignment to the site's real DHCP server.

mod server;

pub use server::ProxyDhcpServer;
