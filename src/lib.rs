//! Pixieboot - PXE network boot server
//!
//! Boots diskless machines over the network without touching the
//! site's DHCP server: a ProxyDHCP responder steers stock PXE ROMs
//! through a boot menu, TFTP ships the second-stage loader, and HTTP
//! carries the pxelinux configuration and kernel/initrd bytes. Which
//! machines boot, and what they boot, is decided by a pluggable Booter
//! policy.

pub mod booter;
pub mod dhcp;
pub mod error;
pub mod http;
pub mod netif;
pub mod proxydhcp;
pub mod pxemenu;
pub mod tftp;

pub use booter::{BootSpec, Booter, FileStream, RemoteBooter, StaticBooter, UrlSigner};
pub use http::{AppState, HttpServer};
pub use proxydhcp::ProxyDhcpServer;
pub use pxemenu::PxeMenuServer;
pub use tftp::TftpServer;
