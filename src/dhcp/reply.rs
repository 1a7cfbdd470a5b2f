//! Emission side of the wire codec: BOOTP replies with DHCP options.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use super::options;
use super::packet::MAGIC_COOKIE;
use crate::error::BuildError;

/// Offset of the boot filename field in the BOOTP header.
const FILE_OFFSET: usize = 108;
/// The `file` field is 128 bytes, null terminated.
const FILE_LEN: usize = 128;

/// Minimum datagram size some BOOTP relays and ROMs insist on.
const MIN_REPLY_SIZE: usize = 300;

/// Builds a BOOTP reply in wire order: fixed header, magic cookie, then
/// appended options, closed off by the end option.
#[derive(Debug)]
pub struct ReplyBuilder {
    buf: Vec<u8>,
}

impl ReplyBuilder {
    /// Start a reply to the client identified by `tid`/`mac`.
    ///
    /// The header is set up for an Ethernet BOOTREPLY with the
    /// broadcast flag raised, which is what PXE option ROMs expect
    /// before they have an address.
    pub fn new(tid: [u8; 4], mac: MacAddr6) -> Self {
        let mut buf = vec![0u8; 236];
        buf[0] = 2; // BOOTREPLY
        buf[1] = 1; // Ethernet
        buf[2] = 6; // hardware address length
        buf[4..8].copy_from_slice(&tid);
        buf[10] = 0x80; // please speak broadcast
        buf[28..34].copy_from_slice(mac.as_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE);
        Self { buf }
    }

    /// Set the next-server address (`siaddr`).
    pub fn siaddr(mut self, ip: Ipv4Addr) -> Self {
        self.buf[20..24].copy_from_slice(&ip.octets());
        self
    }

    /// Echo the relay agent address (`giaddr`) from the request.
    pub fn giaddr(mut self, ip: Ipv4Addr) -> Self {
        self.buf[24..28].copy_from_slice(&ip.octets());
        self
    }

    /// Set the boot filename header field.
    pub fn bootfile(mut self, name: &str) -> Result<Self, BuildError> {
        let bytes = name.as_bytes();
        if bytes.len() >= FILE_LEN {
            return Err(BuildError::BootfileTooLong { len: bytes.len() });
        }
        self.buf[FILE_OFFSET..FILE_OFFSET + bytes.len()].copy_from_slice(bytes);
        Ok(self)
    }

    /// Append one DHCP option.
    pub fn option(mut self, tag: u8, value: &[u8]) -> Result<Self, BuildError> {
        if value.len() > u8::MAX as usize {
            return Err(BuildError::OptionTooLong {
                tag,
                len: value.len(),
            });
        }
        self.buf.push(tag);
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    /// Close the option stream and pad out to the minimum reply size.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(options::END);
        if self.buf.len() < MIN_REPLY_SIZE {
            self.buf.resize(MIN_REPLY_SIZE, 0);
        }
        self.buf
    }
}
