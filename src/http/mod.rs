//! HTTP boot service module.
//!
//! Everything after the second-stage loader happens over HTTP: the
//! syslinux runtime module, the per-machine pxelinux configuration, and
//! the kernel/initrd bytes themselves.

mod server;

pub use server::{router, AppState, HttpServer};
