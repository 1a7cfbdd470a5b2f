//! HTTP boot service implementation.
//!
//! Serves `/ldlinux.c32`, generates `/pxelinux.cfg/01-<mac>` on the
//! fly, and streams blobs through `/f/<signedref>`. Boot policy flows
//! through the shared Booter; signed references are opened here, before
//! the Booter ever sees them.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Host, Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use macaddr::MacAddr6;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::booter::{BootSpec, Booter, UrlSigner};
use crate::dhcp::mac_hyphen;
use crate::error::AppError;

/// pxelinux configuration that tells the PXE/UNDI stack to boot from
/// local disk.
const BOOT_FROM_DISK: &str = "DEFAULT local\nLABEL local\nLOCALBOOT 0\n";

/// A silly limerick displayed while pxelinux loads big OS images.
/// Possibly the most important piece of this program.
const LIMERICK: &str = "There once was a protocol called PXE,
Whose specification was overly tricksy.
A committee refined it,
Into a big Turing tarpit,
And now you're using it to boot your PC.";

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub booter: Arc<Booter>,
    pub signer: Arc<UrlSigner>,
    pub ldlinux: Bytes,
    pub http_port: u16,
}

/// The HTTP boot service.
pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn run(&self) -> Result<()> {
        let port = self.state.http_port;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP server to {}", addr))?;

        info!("HTTP listening on {}", addr);

        let app = router(self.state.clone()).layer(middleware::from_fn(request_logging));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")
    }
}

/// HTTP request logging middleware.
async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    debug!("{} {} {} - {}", addr.ip(), method, uri, response.status().as_u16());
    response
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ldlinux.c32", get(ldlinux))
        .route("/pxelinux.cfg/:config", get(pxelinux_cfg))
        .route("/f/:token", get(file_get).post(file_post))
        .fallback(not_found)
        .with_state(state)
}

/// GET /ldlinux.c32
///
/// pxelinux fetches its runtime module before it reads any config, so
/// this is the earliest point where a policy reversal can be honored:
/// if the loader told us who it is (BOOTIF cookie) and the Booter has
/// changed its mind, hand back the local-boot config instead.
async fn ldlinux(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(mac) = bootif_mac(&headers) {
        if !state.booter.should_boot(mac).await {
            debug!(
                "telling pxelinux on {} to boot from disk",
                mac_hyphen(mac)
            );
            return local_boot_stub();
        }
    }

    info!("sending ldlinux.c32 ({} bytes)", state.ldlinux.len());
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        state.ldlinux.clone(),
    )
        .into_response()
}

/// GET /pxelinux.cfg/01-<mac>
async fn pxelinux_cfg(
    State(state): State<Arc<AppState>>,
    Host(host): Host,
    Path(config): Path<String>,
) -> Result<Response, AppError> {
    let mac = config_mac(&config).ok_or_else(|| AppError::MissingMac(config.clone()))?;

    if !state.booter.should_boot(mac).await {
        debug!(
            "telling pxelinux on {} to boot from disk",
            mac_hyphen(mac)
        );
        return Ok(local_boot_stub());
    }

    let host = normalize_host(&host, state.http_port);
    let prefix = format!("http://{}/f/", host);
    let spec = state.booter.boot_spec(mac, &prefix).await?;

    info!("sending pxelinux config to {}", mac_hyphen(mac));
    Ok(([(header::CONTENT_TYPE, "text/plain")], render_config(&spec)).into_response())
}

/// GET /f/<signedref>
async fn file_get(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let id = state.signer.decode(&token)?;
    let (stream, pretty) = state.booter.read(&id).await?;

    info!("sending {}", pretty);
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        stream.into_body(),
    )
        .into_response())
}

/// POST /f/<signedref>
async fn file_post(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: Body,
) -> Result<Response, AppError> {
    let id = state.signer.decode(&token)?;

    let body = reqwest::Body::wrap_stream(body.into_data_stream());
    let ack = state.booter.write(&id, body).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        ack.into_body(),
    )
        .into_response())
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found\n").into_response()
}

fn local_boot_stub() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], BOOT_FROM_DISK).into_response()
}

/// Render the pxelinux configuration for one boot spec.
fn render_config(spec: &BootSpec) -> String {
    let message = if spec.message.is_empty() {
        LIMERICK
    } else {
        spec.message.as_str()
    };

    let mut cfg = String::new();
    for line in message.lines() {
        cfg.push_str("SAY ");
        cfg.push_str(line);
        cfg.push('\n');
    }
    cfg.push_str("DEFAULT linux\nLABEL linux\nKERNEL ");
    cfg.push_str(&spec.kernel);
    cfg.push('\n');

    let mut args = String::new();
    if !spec.initrd.is_empty() {
        args.push_str("initrd=");
        args.push_str(&spec.initrd.join(","));
        if !spec.cmdline.is_empty() {
            args.push(' ');
        }
    }
    args.push_str(&spec.cmdline);

    if !args.is_empty() {
        cfg.push_str("APPEND ");
        cfg.push_str(&args);
        cfg.push('\n');
    }
    cfg
}

/// Make sure a Host header value carries a port, so URLs built from it
/// point back at this server even when the client connected by bare IP.
fn normalize_host(host: &str, port: u16) -> String {
    if let Some((_, p)) = host.rsplit_once(':') {
        if p.parse::<u16>().is_ok() {
            return host.to_string();
        }
    }
    format!("{}:{}", host, port)
}

/// Extract the client MAC from the `_Syslinux_BOOTIF` cookie pxelinux
/// sends once it is running.
fn bootif_mac(headers: &HeaderMap) -> Option<MacAddr6> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name == "_Syslinux_BOOTIF" {
                return hw_mac(value);
            }
        }
    }
    None
}

/// Extract the MAC from a pxelinux config path component.
fn config_mac(config: &str) -> Option<MacAddr6> {
    hw_mac(config)
}

/// Parse pxelinux's `01-aa-bb-cc-dd-ee-ff` form: hardware type octet,
/// then the hyphenated address.
fn hw_mac(s: &str) -> Option<MacAddr6> {
    s.strip_prefix("01-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::Json;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    fn spec(initrd: &[&str], cmdline: &str, message: &str) -> BootSpec {
        BootSpec {
            kernel: "http://us:70/f/KERN".to_string(),
            initrd: initrd.iter().map(|s| s.to_string()).collect(),
            cmdline: cmdline.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn config_with_initrds_and_cmdline() {
        let cfg = render_config(&spec(&["http://us:70/f/A", "http://us:70/f/B"], "quiet", "hi"));
        assert_eq!(
            cfg,
            "SAY hi\nDEFAULT linux\nLABEL linux\nKERNEL http://us:70/f/KERN\n\
             APPEND initrd=http://us:70/f/A,http://us:70/f/B quiet\n"
        );
    }

    #[test]
    fn config_no_append_when_empty() {
        let cfg = render_config(&spec(&[], "", "hi"));
        assert!(!cfg.contains("APPEND"));
    }

    #[test]
    fn config_initrd_without_cmdline() {
        let cfg = render_config(&spec(&["http://us:70/f/A"], "", "hi"));
        assert!(cfg.ends_with("APPEND initrd=http://us:70/f/A\n"));
    }

    #[test]
    fn config_cmdline_without_initrd() {
        let cfg = render_config(&spec(&[], "quiet splash", "hi"));
        assert!(cfg.ends_with("APPEND quiet splash\n"));
        assert!(!cfg.contains("initrd="));
    }

    #[test]
    fn config_multiline_message() {
        let cfg = render_config(&spec(&[], "", "one\ntwo"));
        assert!(cfg.starts_with("SAY one\nSAY two\n"));
    }

    #[test]
    fn config_empty_message_gets_limerick() {
        let cfg = render_config(&spec(&[], "", ""));
        assert!(cfg.contains("SAY There once was a protocol called PXE,\n"));
        assert!(cfg.contains("SAY And now you're using it to boot your PC.\n"));
    }

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("10.0.0.1", 70), "10.0.0.1:70");
        assert_eq!(normalize_host("10.0.0.1:8080", 70), "10.0.0.1:8080");
        assert_eq!(normalize_host("pxe.local", 70), "pxe.local:70");
    }

    #[test]
    fn bootif_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; _Syslinux_BOOTIF=01-aa-bb-cc-dd-ee-ff".parse().unwrap(),
        );
        assert_eq!(
            bootif_mac(&headers),
            Some(MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff))
        );
    }

    #[test]
    fn bootif_cookie_missing() {
        assert_eq!(bootif_mac(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "other=1".parse().unwrap());
        assert_eq!(bootif_mac(&headers), None);
    }

    #[test]
    fn config_mac_parsing() {
        assert_eq!(
            config_mac("01-aa-bb-cc-dd-ee-ff"),
            Some(MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff))
        );
        assert_eq!(config_mac("aa-bb-cc-dd-ee-ff"), None); // no hardware type
        assert_eq!(config_mac("01-zz-bb-cc-dd-ee-ff"), None);
        assert_eq!(config_mac("default"), None);
    }

    fn static_state(kernel: PathBuf, initrds: Vec<PathBuf>, cmdline: &str) -> Arc<AppState> {
        let signer = Arc::new(UrlSigner::new());
        let booter = Arc::new(Booter::static_files(
            kernel,
            initrds,
            cmdline.to_string(),
            signer.clone(),
        ));
        Arc::new(AppState {
            booter,
            signer,
            ldlinux: Bytes::from_static(b"ldlinux blob"),
            http_port: 70,
        })
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("host", "10.0.0.9")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn ldlinux_served() {
        let state = static_state(PathBuf::from("/k"), vec![], "");
        let response = router(state)
            .oneshot(get_request("/ldlinux.c32"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ldlinux blob");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let state = static_state(PathBuf::from("/k"), vec![], "");
        let response = router(state).oneshot(get_request("/other")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_requires_mac() {
        let state = static_state(PathBuf::from("/k"), vec![], "");
        let response = router(state)
            .oneshot(get_request("/pxelinux.cfg/default"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn config_references_decodable_urls() {
        let state = static_state(PathBuf::from("/k.img"), vec![PathBuf::from("/i.img")], "quiet");
        let signer = state.signer.clone();
        let response = router(state)
            .oneshot(get_request("/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cfg = body_string(response).await;

        let kernel_url = cfg
            .lines()
            .find_map(|l| l.strip_prefix("KERNEL "))
            .unwrap();
        let token = kernel_url.strip_prefix("http://10.0.0.9:70/f/").unwrap();
        assert_eq!(signer.decode(token).unwrap(), "kernel");

        let append = cfg.lines().find_map(|l| l.strip_prefix("APPEND ")).unwrap();
        assert!(append.starts_with("initrd=http://10.0.0.9:70/f/"));
        assert!(append.ends_with(" quiet"));
    }

    #[tokio::test]
    async fn host_port_preserved_in_references() {
        let state = static_state(PathBuf::from("/k.img"), vec![], "");
        let request = Request::builder()
            .uri("/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff")
            .header("host", "192.168.1.5:8080")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let cfg = body_string(response).await;
        assert!(cfg.contains("KERNEL http://192.168.1.5:8080/f/"));
    }

    #[tokio::test]
    async fn file_get_streams_blob() {
        let mut kernel = tempfile::NamedTempFile::new().unwrap();
        kernel.write_all(b"kernel image bytes").unwrap();
        let state = static_state(kernel.path().to_path_buf(), vec![], "");

        let token = state.signer.encode("kernel").unwrap();
        let response = router(state)
            .oneshot(get_request(&format!("/f/{}", token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "kernel image bytes");
    }

    #[tokio::test]
    async fn tampered_token_is_opaque_500() {
        let state = static_state(PathBuf::from("/k.img"), vec![], "");
        let token = state.signer.encode("kernel").unwrap();

        let mut chars: Vec<char> = token.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        let mutated: String = chars.iter().collect();

        let response = router(state)
            .oneshot(get_request(&format!("/f/{}", mutated)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "couldn't get byte stream\n");
    }

    #[tokio::test]
    async fn post_to_static_booter_is_500() {
        let state = static_state(PathBuf::from("/k.img"), vec![], "");
        let token = state.signer.encode("kernel").unwrap();
        let request = Request::builder()
            .method("POST")
            .uri(format!("/f/{}", token))
            .header("host", "10.0.0.9")
            .body(Body::from("payload"))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Stand up a fake remote boot API and return a state wired to it.
    async fn remote_state(api: Router) -> Arc<AppState> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, api).await.unwrap();
        });

        let signer = Arc::new(UrlSigner::new());
        let booter = Arc::new(
            Booter::remote(
                &format!("http://{}", addr),
                Duration::from_secs(5),
                false,
                signer.clone(),
            )
            .unwrap(),
        );
        Arc::new(AppState {
            booter,
            signer,
            ldlinux: Bytes::from_static(b"ldlinux blob"),
            http_port: 70,
        })
    }

    #[tokio::test]
    async fn api_refusal_serves_local_boot_stub() {
        let api = Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        let state = remote_state(api).await;

        let response = router(state)
            .oneshot(get_request("/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, BOOT_FROM_DISK);
    }

    #[tokio::test]
    async fn api_refusal_turns_ldlinux_into_stub() {
        let api = Router::new().fallback(|| async { StatusCode::NOT_FOUND });
        let state = remote_state(api).await;

        let request = Request::builder()
            .uri("/ldlinux.c32")
            .header("host", "10.0.0.9")
            .header("cookie", "_Syslinux_BOOTIF=01-aa-bb-cc-dd-ee-ff")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(body_string(response).await, BOOT_FROM_DISK);
    }

    #[tokio::test]
    async fn remote_cmdline_object_rendered_sorted() {
        let api = Router::new().route(
            "/v1/boot/:mac",
            get(|| async {
                Json(serde_json::json!({
                    "kernel": "http://a/k",
                    "initrd": [],
                    "cmdline": {
                        "debug": true,
                        "console": "ttyS0",
                        "cloud-config": {"url": "http://a/cc"},
                    },
                }))
            }),
        );
        let state = remote_state(api).await;
        let signer = state.signer.clone();

        let response = router(state)
            .oneshot(get_request("/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cfg = body_string(response).await;

        let append = cfg.lines().find_map(|l| l.strip_prefix("APPEND ")).unwrap();
        let args: Vec<&str> = append.split(' ').collect();
        assert_eq!(args.len(), 3);
        assert!(args[0].starts_with("cloud-config=http://10.0.0.9:70/f/"));
        assert_eq!(args[1], "console=ttyS0");
        assert_eq!(args[2], "debug");

        let kernel_url = cfg
            .lines()
            .find_map(|l| l.strip_prefix("KERNEL "))
            .unwrap();
        let token = kernel_url.strip_prefix("http://10.0.0.9:70/f/").unwrap();
        assert_eq!(signer.decode(token).unwrap(), "http://a/k");
    }
}
