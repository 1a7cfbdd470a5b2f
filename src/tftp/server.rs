//! TFTP server implementation.
//!
//! Implements RFC 1350 reads with the RFC 2348 `blksize` option. Every
//! read request is answered with the same byte blob (the second-stage
//! loader); PXE ROMs pick the filename out of their DHCP offer, so the
//! name carries no meaning here and is only logged.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// TFTP opcodes
const OPCODE_RRQ: u16 = 1; // Read request
const OPCODE_WRQ: u16 = 2; // Write request (not supported)
const OPCODE_DATA: u16 = 3; // Data packet
const OPCODE_ACK: u16 = 4; // Acknowledgment
const OPCODE_ERROR: u16 = 5; // Error
const OPCODE_OACK: u16 = 6; // Option acknowledgment (RFC 2347)

/// TFTP error codes
const ERROR_NOT_DEFINED: u16 = 0;
const ERROR_ACCESS_VIOLATION: u16 = 2;

/// Default block size
const DEFAULT_BLOCK_SIZE: usize = 512;

/// Accepted `blksize` range (RFC 2348)
const MIN_BLOCK_SIZE: usize = 8;
const MAX_BLOCK_SIZE: usize = 65464;

/// Largest block that fits an Ethernet MTU with headroom. Anything the
/// client asks for above this is clamped down.
const CLAMP_BLOCK_SIZE: usize = 1450;

/// How long to wait for each ACK, and how many sends to attempt.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 5;

/// A parsed read request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadRequest {
    filename: String,
    /// Negotiated block size; `None` when the client sent no `blksize`
    /// option (no OACK is owed then).
    block_size: Option<usize>,
}

/// TFTP server serving one fixed blob for every request.
pub struct TftpServer {
    blob: Bytes,
    interface: Option<String>,
    port: u16,
}

impl TftpServer {
    /// Create a new TFTP server serving `blob` on `port`.
    pub fn new(blob: Bytes, interface: Option<String>, port: u16) -> Self {
        Self {
            blob,
            interface,
            port,
        }
    }

    /// Accept read requests forever, spawning a task per transfer.
    pub async fn run(&self) -> Result<()> {
        let socket = crate::netif::bind_udp(self.port, self.interface.as_deref(), false)
            .with_context(|| format!("failed to bind TFTP socket to port {}", self.port))?;

        info!("TFTP listening on port {}", self.port);

        let mut buf = [0u8; 2048];
        loop {
            let (len, client) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!("TFTP receive error: {}", e);
                    continue;
                }
            };
            if len < 2 {
                continue;
            }

            match u16::from_be_bytes([buf[0], buf[1]]) {
                OPCODE_RRQ => match parse_rrq(&buf[..len]) {
                    Ok(req) => {
                        info!("TFTP: {} requested {:?}", client, req.filename);
                        let blob = self.blob.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transfer(blob, req, client).await {
                                warn!("TFTP transfer to {} failed: {}", client, e);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("bad RRQ from {}: {}", client, e);
                        send_error(&socket, client, ERROR_NOT_DEFINED, &e.to_string()).await;
                    }
                },
                OPCODE_WRQ => {
                    warn!("write request from {} denied (read-only server)", client);
                    send_error(&socket, client, ERROR_ACCESS_VIOLATION, "writes not supported")
                        .await;
                }
                opcode => {
                    debug!("unexpected TFTP opcode {} from {}", opcode, client);
                }
            }
        }
    }
}

/// Parse an RRQ: opcode, filename, mode, then `key\0value\0` options.
fn parse_rrq(pkt: &[u8]) -> Result<ReadRequest> {
    // 2b opcode, 1b filename, null, 1b mode, null is the smallest
    // useful request
    if pkt.len() < 6 {
        bail!("packet too small to be an RRQ");
    }
    if u16::from_be_bytes([pkt[0], pkt[1]]) != OPCODE_RRQ {
        bail!("not a read request");
    }

    let (filename, rest) = null_str(&pkt[2..]).ok_or_else(|| anyhow!("no filename"))?;
    let (mode, mut rest) = null_str(rest).ok_or_else(|| anyhow!("no transfer mode"))?;
    if !mode.eq_ignore_ascii_case("octet") {
        bail!("unsupported transfer mode {:?}", mode);
    }

    let mut block_size = None;
    while !rest.is_empty() {
        let (opt, r) = null_str(rest).ok_or_else(|| anyhow!("unterminated option name"))?;
        let (val, r) =
            null_str(r).ok_or_else(|| anyhow!("unterminated value for option {:?}", opt))?;
        rest = r;

        if opt.eq_ignore_ascii_case("blksize") {
            let requested: usize = val
                .parse()
                .map_err(|_| anyhow!("non-integer {:?} for option {:?}", val, opt))?;
            if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&requested) {
                bail!("unsupported block size {}", requested);
            }
            block_size = Some(requested.min(CLAMP_BLOCK_SIZE));
        }
        // All other options (tsize and friends) are ignored.
    }

    Ok(ReadRequest {
        filename: filename.to_string(),
        block_size,
    })
}

/// Extract a null-terminated string from the front of `b`.
fn null_str(b: &[u8]) -> Option<(&str, &[u8])> {
    let off = b.iter().position(|&c| c == 0)?;
    let s = std::str::from_utf8(&b[..off]).ok()?;
    Some((s, &b[off + 1..]))
}

/// Run one transfer over its own ephemeral socket.
async fn transfer(blob: Bytes, req: ReadRequest, client: SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind transfer socket")?;
    socket
        .connect(client)
        .await
        .context("failed to connect transfer socket")?;

    let block_size = req.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);

    if let Some(accepted) = req.block_size {
        let mut oack = Vec::with_capacity(16);
        oack.extend_from_slice(&OPCODE_OACK.to_be_bytes());
        oack.extend_from_slice(b"blksize\0");
        oack.extend_from_slice(accepted.to_string().as_bytes());
        oack.push(0);

        if let Err(e) = send_expect_ack(&socket, &oack, 0).await {
            // Some ROMs probe with options just to size a buffer and
            // abort on OACK as part of a normal boot sequence.
            debug!("OACK exchange with {} ended early: {}", client, e);
            return Ok(());
        }
    }

    let mut seq: u16 = 1;
    let mut offset = 0usize;
    loop {
        let end = (offset + block_size).min(blob.len());
        let chunk = &blob[offset..end];

        let mut pkt = Vec::with_capacity(4 + chunk.len());
        pkt.extend_from_slice(&OPCODE_DATA.to_be_bytes());
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(chunk);
        send_expect_ack(&socket, &pkt, seq).await?;

        offset = end;
        // A short (possibly empty) final block ends the transfer; an
        // exact-multiple blob still gets its zero-length terminator.
        if chunk.len() < block_size {
            info!(
                "TFTP: sent {:?} to {} ({} bytes)",
                req.filename, client, offset
            );
            return Ok(());
        }
        seq = seq.wrapping_add(1);
    }
}

/// Send one packet and wait for the matching ACK, stop-and-wait style:
/// 1 s deadline per attempt, retransmitting up to [`MAX_ATTEMPTS`]
/// times in total.
async fn send_expect_ack(socket: &UdpSocket, pkt: &[u8], seq: u16) -> Result<()> {
    for _ in 0..MAX_ATTEMPTS {
        socket.send(pkt).await.context("send failed")?;
        match timeout(ACK_TIMEOUT, recv_ack(socket, seq)).await {
            Ok(result) => return result,
            Err(_) => {
                debug!("timeout waiting for ACK #{}, retransmitting", seq);
            }
        }
    }
    bail!("no ACK for block {} after {} attempts", seq, MAX_ATTEMPTS)
}

/// Wait for the ACK matching `seq`. Mismatched ACKs and runt packets
/// are ignored; a client ERROR aborts the transfer.
async fn recv_ack(socket: &UdpSocket, seq: u16) -> Result<()> {
    let mut buf = [0u8; 256];
    loop {
        let n = socket.recv(&mut buf).await.context("receive failed")?;
        if n < 4 {
            continue;
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let block = u16::from_be_bytes([buf[2], buf[3]]);
        match opcode {
            OPCODE_ACK if block == seq => return Ok(()),
            OPCODE_ERROR => {
                let msg = null_str(&buf[4..n]).map(|(s, _)| s.to_string()).unwrap_or_default();
                bail!("client aborted transfer ({:?})", msg)
            }
            _ => continue,
        }
    }
}

/// Fire off an ERROR packet; failures to deliver it are ignored.
async fn send_error(socket: &UdpSocket, addr: SocketAddr, code: u16, message: &str) {
    let mut pkt = Vec::with_capacity(5 + message.len());
    pkt.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    pkt.extend_from_slice(&code.to_be_bytes());
    pkt.extend_from_slice(message.as_bytes());
    pkt.push(0);
    let _ = socket.send_to(&pkt, addr).await;
}
