use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pixieboot::http::{AppState, HttpServer};
use pixieboot::{Booter, ProxyDhcpServer, PxeMenuServer, TftpServer, UrlSigner};

#[derive(Parser)]
#[command(name = "pixieboot")]
#[command(about = "PXE network boot server", version)]
struct Cli {
    /// Network interface to answer on (e.g. enp1s0)
    #[arg(short, long)]
    interface: Option<String>,

    /// HTTP port
    #[arg(short, long, default_value_t = 70)]
    port: u16,

    /// ProxyDHCP port
    #[arg(long, default_value_t = 67)]
    dhcp_port: u16,

    /// PXE boot-server port
    #[arg(long, default_value_t = 4011)]
    pxe_port: u16,

    /// TFTP port
    #[arg(long, default_value_t = 69)]
    tftp_port: u16,

    /// Second-stage loader blob served over TFTP (lpxelinux.0)
    #[arg(long, value_name = "FILE")]
    pxelinux: PathBuf,

    /// syslinux runtime module served at /ldlinux.c32
    #[arg(long, value_name = "FILE")]
    ldlinux: PathBuf,

    /// Boot this kernel on every machine (static mode)
    #[arg(long, value_name = "FILE", conflicts_with = "api")]
    kernel: Option<PathBuf>,

    /// Initrd to load, in order; repeatable (static mode)
    #[arg(long, value_name = "FILE")]
    initrd: Vec<PathBuf>,

    /// Kernel command line (static mode)
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Delegate boot decisions to this API server (remote mode)
    #[arg(long, value_name = "URL")]
    api: Option<String>,

    /// Timeout for boot API policy calls, in seconds
    #[arg(long, default_value_t = 5)]
    api_timeout: u64,

    /// Let the boot API reference file: URLs on this host
    #[arg(long)]
    allow_file_urls: bool,

    /// Log protocol chatter
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let pxelinux = read_blob(&cli.pxelinux).context("loading second-stage loader")?;
    let ldlinux = read_blob(&cli.ldlinux).context("loading syslinux module")?;

    let signer = Arc::new(UrlSigner::new());
    let booter = Arc::new(match (&cli.kernel, &cli.api) {
        (Some(kernel), None) => Booter::static_files(
            kernel.clone(),
            cli.initrd.clone(),
            cli.cmdline.clone(),
            signer.clone(),
        ),
        (None, Some(api)) => Booter::remote(
            api,
            Duration::from_secs(cli.api_timeout),
            cli.allow_file_urls,
            signer.clone(),
        )?,
        _ => bail!("exactly one of --kernel or --api must be given"),
    });

    if let Some(ip) = pixieboot::netif::interface_ipv4(cli.interface.as_deref()) {
        info!("server IP: {}", ip);
    }

    let proxydhcp = ProxyDhcpServer::new(booter.clone(), cli.interface.clone(), cli.dhcp_port);
    let pxemenu = PxeMenuServer::new(cli.interface.clone(), cli.pxe_port, cli.port);
    let tftp = TftpServer::new(pxelinux, cli.interface.clone(), cli.tftp_port);
    let http = HttpServer::new(Arc::new(AppState {
        booter,
        signer,
        ldlinux,
        http_port: cli.port,
    }));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    // The listeners run until process exit; whichever fails first takes
    // the daemon down with a useful error.
    tokio::select! {
        res = proxydhcp.run() => res.context("ProxyDHCP server failed"),
        res = pxemenu.run() => res.context("PXE server failed"),
        res = tftp.run() => res.context("TFTP server failed"),
        res = http.run() => res.context("HTTP server failed"),
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
    }
}

fn read_blob(path: &PathBuf) -> Result<Bytes> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(Bytes::from(bytes))
}
