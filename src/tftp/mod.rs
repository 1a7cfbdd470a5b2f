//! TFTP server module.
//!
//! Read-only TFTP for shipping the second-stage loader to PXE ROMs.

mod server;

pub use server::TftpServer;
