//! ProxyDHCP server implementation.
//!
//! Listens on the DHCP server port for PXE DISCOVERs and answers with a
//! DHCPOFFER that carries no address lease, only a single-entry PXE
//! boot menu pointing at this host. Going through the menu (rather than
//! a plain bootfile) makes stock PXE ROMs come back with a directed
//! request on the boot-server port, which sidesteps the BOOTP filename
//! length limit and targets our TFTP server precisely.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::booter::Booter;
use crate::dhcp::{
    mac_hyphen, options, parse_discover, pxe_options, PxeDiscover, ReplyBuilder,
};
use crate::error::BuildError;
use crate::netif;

const DHCP_CLIENT_PORT: u16 = 68;

/// Label shown in the single-entry PXE boot menu.
const MENU_LABEL: &[u8] = b"Pixiecore";

/// ProxyDHCP server for PXE boot.
pub struct ProxyDhcpServer {
    booter: Arc<Booter>,
    interface: Option<String>,
    port: u16,
}

impl ProxyDhcpServer {
    pub fn new(booter: Arc<Booter>, interface: Option<String>, port: u16) -> Self {
        Self {
            booter,
            interface,
            port,
        }
    }

    /// Receive loop. One task is enough: building an offer is cheap,
    /// and PXE clients retry on their own schedule.
    pub async fn run(&self) -> Result<()> {
        let socket = netif::DhcpSocket::bind(self.port, self.interface.as_deref())
            .with_context(|| format!("failed to set up ProxyDHCP socket on port {}", self.port))?;

        info!("ProxyDHCP listening on port {}", self.port);

        let mut buf = [0u8; 1024];
        loop {
            let (len, src, ifindex) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!("ProxyDHCP receive error: {}", e);
                    continue;
                }
            };

            let req = match parse_discover(&buf[..len]) {
                Ok(req) => req,
                Err(e) => {
                    debug!("ignoring datagram from {}: {}", src, e);
                    continue;
                }
            };

            let mac = mac_hyphen(req.mac);
            if !self.booter.should_boot(req.mac).await {
                debug!("policy refused to boot {}", mac);
                continue;
            }

            let Some(server_ip) = netif::reply_ipv4(self.interface.as_deref(), ifindex) else {
                warn!("no usable IPv4 address to offer {}", mac);
                continue;
            };

            let offer = match build_offer(&req, server_ip) {
                Ok(offer) => offer,
                Err(e) => {
                    error!("could not build offer for {}: {}", mac, e);
                    continue;
                }
            };

            // Broadcast back out the interface the DISCOVER arrived on.
            let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);
            if let Err(e) = socket.send_to(&offer, dest, ifindex).await {
                error!("failed to send offer to {}: {}", mac, e);
                continue;
            }
            info!("offering to boot {}", mac);
        }
    }
}

/// Encode the option-43 payload: a single-entry boot menu that names
/// this host as the boot server and disables further discovery.
fn pxe_menu(server_ip: Ipv4Addr) -> Vec<u8> {
    let mut p = Vec::with_capacity(48);

    // Discovery control 3: no broadcast or multicast discovery, use the
    // boot server list.
    p.extend_from_slice(&[pxe_options::DISCOVERY_CONTROL, 1, 3]);

    // One boot server of type 0x8000.
    p.extend_from_slice(&[pxe_options::BOOT_SERVERS, 7, 0x80, 0x00, 1]);
    p.extend_from_slice(&server_ip.octets());

    // One menu entry for that server type.
    p.extend_from_slice(&[
        pxe_options::BOOT_MENU,
        (MENU_LABEL.len() + 3) as u8,
        0x80,
        0x00,
        MENU_LABEL.len() as u8,
    ]);
    p.extend_from_slice(MENU_LABEL);

    // Menu prompt with zero timeout.
    p.extend_from_slice(&[pxe_options::MENU_PROMPT, (MENU_LABEL.len() + 1) as u8, 0]);
    p.extend_from_slice(MENU_LABEL);

    p.push(pxe_options::END);
    p
}

/// Build the DHCPOFFER steering the client into our PXE boot menu.
fn build_offer(req: &PxeDiscover, server_ip: Ipv4Addr) -> Result<Vec<u8>, BuildError> {
    let mut guid = [0u8; 17];
    guid[1..].copy_from_slice(&req.guid);

    Ok(ReplyBuilder::new(req.tid, req.mac)
        .siaddr(server_ip)
        .giaddr(req.giaddr)
        .option(options::MESSAGE_TYPE, &[2])? // DHCPOFFER
        .option(options::SERVER_ID, &server_ip.octets())?
        .option(options::VENDOR_CLASS_ID, b"PXEClient")?
        .option(options::CLIENT_UUID, &guid)?
        .option(options::VENDOR_SPECIFIC, &pxe_menu(server_ip))?
        .finish())
}
