//! Boot policy: whether a machine should netboot, and with what.
//!
//! The protocol engine holds exactly one [`Booter`], chosen at startup.
//! Policy questions from the DHCP responders and byte streams for the
//! HTTP service all flow through it.

mod remote;
mod sign;

pub use remote::RemoteBooter;
pub use sign::{SignError, UrlSigner};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::body::Body;
use macaddr::MacAddr6;
use tokio_util::io::ReaderStream;

/// What one machine should boot, decided at most once per boot attempt.
///
/// `kernel` and `initrd` entries are fully formed URLs containing
/// signed references; `cmdline` is already materialized. An empty
/// `message` means the loader shows the built-in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSpec {
    pub kernel: String,
    pub initrd: Vec<String>,
    pub cmdline: String,
    pub message: String,
}

/// A byte stream produced by a booter, either a local file or an
/// in-flight HTTP response.
pub enum FileStream {
    Local(tokio::fs::File),
    Remote(reqwest::Response),
}

impl FileStream {
    /// Turn the stream into an HTTP response body without buffering.
    pub fn into_body(self) -> Body {
        match self {
            FileStream::Local(file) => Body::from_stream(ReaderStream::new(file)),
            FileStream::Remote(resp) => Body::from_stream(resp.bytes_stream()),
        }
    }
}

/// The two boot policies: fixed local files, or a remote HTTP API.
pub enum Booter {
    Static(StaticBooter),
    Remote(RemoteBooter),
}

impl Booter {
    /// Boot every machine with the given local kernel and initrds.
    pub fn static_files(
        kernel: PathBuf,
        initrds: Vec<PathBuf>,
        cmdline: String,
        signer: Arc<UrlSigner>,
    ) -> Self {
        Booter::Static(StaticBooter {
            kernel,
            initrds,
            cmdline,
            signer,
        })
    }

    /// Delegate boot decisions to the HTTP API rooted at `server`.
    pub fn remote(
        server: &str,
        timeout: Duration,
        allow_file_urls: bool,
        signer: Arc<UrlSigner>,
    ) -> Result<Self> {
        Ok(Booter::Remote(RemoteBooter::new(
            server,
            timeout,
            allow_file_urls,
            signer,
        )?))
    }

    /// Should we offer to boot this machine? Refusal is a policy
    /// answer, not an error; the caller falls through to local boot.
    pub async fn should_boot(&self, mac: MacAddr6) -> bool {
        match self {
            Booter::Static(b) => b.should_boot(mac),
            Booter::Remote(b) => b.should_boot(mac).await,
        }
    }

    /// Decide what the machine boots. Failing here aborts the PXE
    /// sequence; the client retries from scratch.
    pub async fn boot_spec(&self, mac: MacAddr6, file_url_prefix: &str) -> Result<BootSpec> {
        match self {
            Booter::Static(b) => b.boot_spec(file_url_prefix),
            Booter::Remote(b) => b.boot_spec(mac, file_url_prefix).await,
        }
    }

    /// Open the blob behind an (already verified) reference. Returns
    /// the stream and a pretty name for logging.
    pub async fn read(&self, id: &str) -> Result<(FileStream, String)> {
        match self {
            Booter::Static(b) => b.read(id).await,
            Booter::Remote(b) => b.read(id).await,
        }
    }

    /// Accept an upload addressed to a reference. Not every policy
    /// supports writes.
    pub async fn write(&self, id: &str, body: reqwest::Body) -> Result<FileStream> {
        match self {
            Booter::Static(b) => b.write(id),
            Booter::Remote(b) => b.write(id, body).await,
        }
    }
}

/// Boots all machines with one fixed set of local files.
pub struct StaticBooter {
    kernel: PathBuf,
    initrds: Vec<PathBuf>,
    cmdline: String,
    signer: Arc<UrlSigner>,
}

impl StaticBooter {
    fn should_boot(&self, _mac: MacAddr6) -> bool {
        true
    }

    fn boot_spec(&self, prefix: &str) -> Result<BootSpec> {
        let kernel = format!("{}{}", prefix, self.signer.encode("kernel")?);
        let initrd = (0..self.initrds.len())
            .map(|i| Ok(format!("{}{}", prefix, self.signer.encode(&i.to_string())?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(BootSpec {
            kernel,
            initrd,
            cmdline: self.cmdline.clone(),
            message: String::new(),
        })
    }

    async fn read(&self, id: &str) -> Result<(FileStream, String)> {
        if id == "kernel" {
            let file = tokio::fs::File::open(&self.kernel)
                .await
                .with_context(|| format!("failed to open kernel {}", self.kernel.display()))?;
            return Ok((FileStream::Local(file), "kernel".to_string()));
        }
        if let Ok(i) = id.parse::<usize>() {
            if let Some(path) = self.initrds.get(i) {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open initrd {}", path.display()))?;
                return Ok((FileStream::Local(file), format!("initrd.{}", i)));
            }
        }
        bail!("no file with ID {:?}", id)
    }

    fn write(&self, id: &str) -> Result<FileStream> {
        bail!("static boot policy does not accept uploads (ID {:?})", id)
    }
}
