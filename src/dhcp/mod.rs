//! DHCP/PXE wire codec.
//!
//! Parses BOOTP/DHCP frames into the handful of fields the boot
//! services care about, and builds BOOTP replies with DHCP options and
//! PXE vendor sub-options.

mod packet;
mod parser;
mod reply;

pub use packet::{mac_colon, mac_hyphen, MenuRequest, PxeDiscover, MAGIC_COOKIE};
pub use parser::{next_option, parse_discover, parse_menu_request};
pub use reply::ReplyBuilder;

/// DHCP option codes used on the wire.
pub mod options {
    pub const PAD: u8 = 0;
    pub const VENDOR_SPECIFIC: u8 = 43;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const VENDOR_CLASS_ID: u8 = 60;
    pub const CLIENT_ARCH: u8 = 93;
    pub const CLIENT_UUID: u8 = 97;
    pub const PXELINUX_PATH_PREFIX: u8 = 210;
    pub const PXELINUX_REBOOT_TIME: u8 = 211;
    pub const END: u8 = 255;
}

/// PXE sub-option codes carried inside option 43.
pub mod pxe_options {
    pub const DISCOVERY_CONTROL: u8 = 6;
    pub const BOOT_SERVERS: u8 = 8;
    pub const BOOT_MENU: u8 = 9;
    pub const MENU_PROMPT: u8 = 10;
    pub const BOOT_ITEM: u8 = 71;
    pub const END: u8 = 255;
}
