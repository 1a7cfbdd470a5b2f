//! PXE menu responder implementation.
//!
//! After the client picks the menu entry from our OFFER, its firmware
//! sends a directed request to UDP/4011. The DHCPACK we answer with
//! names the TFTP server, mirrors the chosen boot item (mandatory, or
//! the firmware errors out), and plants the pxelinux path prefix that
//! moves everything after the second-stage loader onto HTTP.

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::dhcp::{
    mac_hyphen, options, parse_menu_request, MenuRequest, ReplyBuilder,
};
use crate::error::BuildError;
use crate::netif;

/// Seconds pxelinux waits before rebooting after a failed boot.
const REBOOT_TIME_SECS: u32 = 5;

/// PXE boot-server responder on the directed-request port.
pub struct PxeMenuServer {
    interface: Option<String>,
    port: u16,
    http_port: u16,
}

impl PxeMenuServer {
    pub fn new(interface: Option<String>, port: u16, http_port: u16) -> Self {
        Self {
            interface,
            port,
            http_port,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let socket = netif::DhcpSocket::bind(self.port, self.interface.as_deref())
            .with_context(|| format!("failed to set up PXE socket on port {}", self.port))?;

        info!("PXE listening on port {}", self.port);

        let mut buf = [0u8; 1024];
        loop {
            let (len, src, ifindex) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!("PXE receive error: {}", e);
                    continue;
                }
            };

            let req = match parse_menu_request(&buf[..len]) {
                Ok(req) => req,
                Err(e) => {
                    debug!("ignoring datagram from {}: {}", src, e);
                    continue;
                }
            };

            let mac = mac_hyphen(req.mac);
            debug!("boot item request from {} (leased {})", mac, req.ciaddr);

            let Some(server_ip) = netif::reply_ipv4(self.interface.as_deref(), ifindex) else {
                warn!("no usable IPv4 address to direct {}", mac);
                continue;
            };

            let ack = match build_ack(&req, server_ip, self.http_port) {
                Ok(ack) => ack,
                Err(e) => {
                    error!("could not build ACK for {}: {}", mac, e);
                    continue;
                }
            };

            // The client is addressable now; answer where the request
            // came from, back out the interface it used.
            if let Err(e) = socket.send_to(&ack, src, ifindex).await {
                error!("failed to send ACK to {}: {}", mac, e);
                continue;
            }
            info!("directing {} to boot from {}", mac, server_ip);
        }
    }
}

/// Build the DHCPACK that names the TFTP server and steers pxelinux to
/// our HTTP service.
fn build_ack(
    req: &MenuRequest,
    server_ip: std::net::Ipv4Addr,
    http_port: u16,
) -> Result<Vec<u8>, BuildError> {
    let mut guid = [0u8; 17];
    guid[1..].copy_from_slice(&req.guid);

    // Echo of the selected boot item, wrapped back into option 43.
    let mut boot_item = Vec::with_capacity(req.boot_item.len() + 3);
    boot_item.push(crate::dhcp::pxe_options::BOOT_ITEM);
    boot_item.push(req.boot_item.len() as u8);
    boot_item.extend_from_slice(&req.boot_item);
    boot_item.push(crate::dhcp::pxe_options::END);

    let http_prefix = format!("http://{}:{}/", server_ip, http_port);

    // The TFTP server ignores filenames, any short name will do.
    ReplyBuilder::new(req.tid, req.mac)
        .siaddr(server_ip)
        .giaddr(req.giaddr)
        .bootfile("boot")?
        .option(options::MESSAGE_TYPE, &[5])? // DHCPACK
        .option(options::SERVER_ID, &server_ip.octets())?
        .option(options::VENDOR_CLASS_ID, b"PXEClient")?
        .option(options::CLIENT_UUID, &guid)?
        .option(options::VENDOR_SPECIFIC, &boot_item)?
        .option(options::PXELINUX_PATH_PREFIX, http_prefix.as_bytes())?
        .option(
            options::PXELINUX_REBOOT_TIME,
            &REBOOT_TIME_SECS.to_be_bytes(),
        )
        .map(ReplyBuilder::finish)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::next_option;
    use macaddr::MacAddr6;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn request() -> MenuRequest {
        MenuRequest {
            tid: [5, 6, 7, 8],
            mac: MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff),
            guid: [3u8; 16],
            boot_item: vec![0x80, 0x00, 0x00, 0x00],
            ciaddr: Ipv4Addr::new(192, 168, 1, 77),
            giaddr: Ipv4Addr::UNSPECIFIED,
        }
    }

    fn collect_options(reply: &[u8]) -> HashMap<u8, Vec<u8>> {
        let mut found = HashMap::new();
        let mut rest = &reply[240..];
        while let Some((tag, val, next)) = next_option(rest) {
            found.insert(tag, val.to_vec());
            rest = next;
        }
        found
    }

    #[test]
    fn ack_header() {
        let ack = build_ack(&request(), Ipv4Addr::new(192, 168, 16, 10), 70).unwrap();
        assert_eq!(ack[0], 2);
        assert_eq!(&ack[4..8], &[5, 6, 7, 8]);
        assert_eq!(&ack[20..24], &[192, 168, 16, 10]);
        assert_eq!(&ack[108..112], b"boot");
    }

    #[test]
    fn ack_is_an_ack() {
        let ack = build_ack(&request(), Ipv4Addr::new(10, 0, 0, 1), 70).unwrap();
        let opts = collect_options(&ack);
        assert_eq!(opts[&53], vec![5]);
    }

    #[test]
    fn ack_echoes_boot_item() {
        let ack = build_ack(&request(), Ipv4Addr::new(10, 0, 0, 1), 70).unwrap();
        let opts = collect_options(&ack);
        assert_eq!(opts[&43], vec![71, 4, 0x80, 0x00, 0x00, 0x00, 255]);
    }

    #[test]
    fn ack_pxelinux_options() {
        let ack = build_ack(&request(), Ipv4Addr::new(192, 168, 16, 10), 70).unwrap();
        let opts = collect_options(&ack);
        assert_eq!(opts[&210], b"http://192.168.16.10:70/".to_vec());
        assert_eq!(opts[&211], vec![0, 0, 0, 5]);
    }

    #[test]
    fn ack_configured_http_port() {
        let ack = build_ack(&request(), Ipv4Addr::new(10, 0, 0, 1), 8080).unwrap();
        let opts = collect_options(&ack);
        assert_eq!(opts[&210], b"http://10.0.0.1:8080/".to_vec());
    }

    #[test]
    fn ack_echoes_guid() {
        let ack = build_ack(&request(), Ipv4Addr::new(10, 0, 0, 1), 70).unwrap();
        let opts = collect_options(&ack);
        let mut guid = vec![0u8];
        guid.extend_from_slice(&[3u8; 16]);
        assert_eq!(opts[&97], guid);
    }
}
