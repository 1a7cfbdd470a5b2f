//! PXE boot-server module.
//!
//! Handles the directed request a PXE client sends after choosing an
//! entry from the boot menu we offered on the DHCP port.

mod server;

pub use server::PxeMenuServer;
