//! Boot policy delegated to a remote HTTP API.
//!
//! `GET <server>/v1/boot/<mac>` answers both policy questions: a 2xx
//! means "boot this machine" and carries a JSON boot spec; anything
//! else means "leave it alone". Blob URLs from that answer are sealed
//! into signed references before they are shown to clients, and opened
//! again when the client fetches them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use macaddr::MacAddr6;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::sign::UrlSigner;
use super::{BootSpec, FileStream};
use crate::dhcp::mac_colon;

/// Boot spec as the API server returns it.
#[derive(Debug, Deserialize)]
struct ApiSpec {
    kernel: String,
    #[serde(default)]
    initrd: Vec<String>,
    #[serde(default)]
    cmdline: Value,
    #[serde(default)]
    message: String,
}

pub struct RemoteBooter {
    /// Client for policy calls, bounded by the configured timeout.
    policy: reqwest::Client,
    /// Client for blob streaming. Kernel and initrd downloads can take
    /// arbitrarily long, so this one must not carry the policy timeout.
    files: reqwest::Client,
    base: Url,
    signer: Arc<UrlSigner>,
    allow_file_urls: bool,
}

impl RemoteBooter {
    pub fn new(
        server: &str,
        timeout: Duration,
        allow_file_urls: bool,
        signer: Arc<UrlSigner>,
    ) -> Result<Self> {
        let mut server = server.to_string();
        if !server.ends_with('/') {
            server.push('/');
        }
        let base = Url::parse(&server)
            .and_then(|u| u.join("v1/"))
            .with_context(|| format!("invalid API server URL {:?}", server))?;

        let policy = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build API client")?;

        let files = reqwest::Client::builder()
            .build()
            .context("failed to build file client")?;

        Ok(Self {
            policy,
            files,
            base,
            signer,
            allow_file_urls,
        })
    }

    async fn boot_response(&self, mac: MacAddr6) -> reqwest::Result<reqwest::Response> {
        let url = format!("{}boot/{}", self.base, mac_colon(mac));
        self.policy.get(url).send().await
    }

    pub async fn should_boot(&self, mac: MacAddr6) -> bool {
        match self.boot_response(mac).await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("boot API unreachable for {}: {}", mac_colon(mac), e);
                false
            }
        }
    }

    pub async fn boot_spec(&self, mac: MacAddr6, file_url_prefix: &str) -> Result<BootSpec> {
        let resp = self
            .boot_response(mac)
            .await
            .context("boot API request failed")?;
        if !resp.status().is_success() {
            bail!(
                "boot API refused {}: {}",
                mac_colon(mac),
                resp.status()
            );
        }

        let api: ApiSpec = resp
            .json()
            .await
            .context("malformed boot API response")?;
        if api.kernel.is_empty() {
            bail!("boot API returned an empty kernel reference");
        }

        let kernel = self.sign_resolved(&api.kernel, file_url_prefix)?;
        let initrd = api
            .initrd
            .iter()
            .map(|u| self.sign_resolved(u, file_url_prefix))
            .collect::<Result<Vec<_>>>()?;

        let cmdline = match &api.cmdline {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Object(map) => self.construct_cmdline(map, file_url_prefix)?,
            other => bail!("boot API returned unsupported cmdline type: {}", other),
        };

        Ok(BootSpec {
            kernel,
            initrd,
            cmdline,
            message: api.message,
        })
    }

    /// Resolve a possibly-relative URL against the API base, then seal
    /// it into a signed reference under `prefix`.
    fn sign_resolved(&self, raw: &str, prefix: &str) -> Result<String> {
        let url = self
            .base
            .join(raw)
            .with_context(|| format!("invalid URL {:?} from boot API", raw))?;
        Ok(format!("{}{}", prefix, self.signer.encode(url.as_str())?))
    }

    /// Materialize an object-form cmdline: keys in sorted order, `true`
    /// values as bare flags, strings as `key=value`, and `{url: ...}`
    /// objects as `key=<signed url>`.
    fn construct_cmdline(
        &self,
        map: &serde_json::Map<String, Value>,
        prefix: &str,
    ) -> Result<String> {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();

        let mut args = Vec::with_capacity(keys.len());
        for key in keys {
            match &map[key.as_str()] {
                Value::Bool(_) => args.push(key.to_string()),
                Value::String(s) => args.push(format!("{}={}", key, s)),
                Value::Object(obj) => {
                    let url = obj
                        .get("url")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            anyhow!("cmdline key {:?} has object value with no url attribute", key)
                        })?;
                    args.push(format!("{}={}", key, self.sign_resolved(url, prefix)?));
                }
                other => bail!("unsupported value {} for cmdline key {:?}", other, key),
            }
        }
        Ok(args.join(" "))
    }

    pub async fn read(&self, id: &str) -> Result<(FileStream, String)> {
        let url = Url::parse(id).with_context(|| format!("reference {:?} is not a URL", id))?;

        if url.scheme() == "file" {
            if !self.allow_file_urls {
                bail!("file: URLs from the boot API are disabled");
            }
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("unusable file: URL {:?}", id))?;
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            return Ok((FileStream::Local(file), id.to_string()));
        }

        let resp = self
            .files
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetching {:?} failed", id))?
            .error_for_status()
            .with_context(|| format!("fetching {:?} failed", id))?;
        Ok((FileStream::Remote(resp), id.to_string()))
    }

    pub async fn write(&self, id: &str, body: reqwest::Body) -> Result<FileStream> {
        let url = Url::parse(id).with_context(|| format!("reference {:?} is not a URL", id))?;
        if url.scheme() == "file" {
            bail!("refusing to write to file: URL {:?}", id);
        }
        let resp = self
            .files
            .post(url)
            .body(body)
            .send()
            .await
            .with_context(|| format!("posting to {:?} failed", id))?
            .error_for_status()
            .with_context(|| format!("posting to {:?} failed", id))?;
        Ok(FileStream::Remote(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booter() -> (RemoteBooter, Arc<UrlSigner>) {
        let signer = Arc::new(UrlSigner::new());
        let booter = RemoteBooter::new(
            "http://api.example.com:4242",
            Duration::from_secs(5),
            false,
            signer.clone(),
        )
        .unwrap();
        (booter, signer)
    }

    #[test]
    fn base_gets_v1_suffix() {
        let (booter, _) = booter();
        assert_eq!(booter.base.as_str(), "http://api.example.com:4242/v1/");
    }

    #[test]
    fn trailing_slash_not_duplicated() {
        let signer = Arc::new(UrlSigner::new());
        let b = RemoteBooter::new("http://a/", Duration::from_secs(1), false, signer).unwrap();
        assert_eq!(b.base.as_str(), "http://a/v1/");
    }

    #[test]
    fn sign_resolved_absolute() {
        let (booter, signer) = booter();
        let signed = booter
            .sign_resolved("http://files.example.com/kernel", "http://us:70/f/")
            .unwrap();
        let token = signed.strip_prefix("http://us:70/f/").unwrap();
        assert_eq!(signer.decode(token).unwrap(), "http://files.example.com/kernel");
    }

    #[test]
    fn sign_resolved_relative() {
        let (booter, signer) = booter();
        let signed = booter.sign_resolved("kernel", "http://us:70/f/").unwrap();
        let token = signed.strip_prefix("http://us:70/f/").unwrap();
        assert_eq!(
            signer.decode(token).unwrap(),
            "http://api.example.com:4242/v1/kernel"
        );
    }

    #[test]
    fn cmdline_object_sorted_and_typed() {
        let (booter, signer) = booter();
        let map = serde_json::json!({
            "debug": true,
            "console": "ttyS0",
            "cloud-config": {"url": "http://a/cc"},
        });
        let Value::Object(map) = map else { unreachable!() };

        let cmdline = booter.construct_cmdline(&map, "http://us:70/f/").unwrap();

        let args: Vec<&str> = cmdline.split(' ').collect();
        assert_eq!(args.len(), 3);
        assert!(args[0].starts_with("cloud-config=http://us:70/f/"));
        assert_eq!(args[1], "console=ttyS0");
        assert_eq!(args[2], "debug");

        let token = args[0]
            .strip_prefix("cloud-config=http://us:70/f/")
            .unwrap();
        assert_eq!(signer.decode(token).unwrap(), "http://a/cc");
    }

    #[test]
    fn cmdline_object_without_url_attribute() {
        let (booter, _) = booter();
        let Value::Object(map) = serde_json::json!({"cc": {"uri": "nope"}}) else {
            unreachable!()
        };
        assert!(booter.construct_cmdline(&map, "p/").is_err());
    }

    #[test]
    fn cmdline_rejects_unknown_value_types() {
        let (booter, _) = booter();
        let Value::Object(map) = serde_json::json!({"x": 42}) else {
            unreachable!()
        };
        assert!(booter.construct_cmdline(&map, "p/").is_err());
    }

    #[tokio::test]
    async fn file_urls_refused_by_default() {
        let (booter, _) = booter();
        assert!(booter.read("file:///etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn file_urls_served_when_enabled() {
        use std::io::Write;
        let mut blob = tempfile::NamedTempFile::new().unwrap();
        blob.write_all(b"payload").unwrap();

        let signer = Arc::new(UrlSigner::new());
        let booter = RemoteBooter::new(
            "http://a",
            Duration::from_secs(1),
            true,
            signer,
        )
        .unwrap();

        let url = format!("file://{}", blob.path().display());
        let (stream, _) = booter.read(&url).await.unwrap();
        match stream {
            FileStream::Local(mut f) => {
                use tokio::io::AsyncReadExt;
                let mut contents = Vec::new();
                f.read_to_end(&mut contents).await.unwrap();
                assert_eq!(contents, b"payload");
            }
            FileStream::Remote(_) => panic!("expected local file"),
        }
    }

    #[tokio::test]
    async fn non_url_reference_rejected() {
        let (booter, _) = booter();
        assert!(booter.read("kernel").await.is_err());
    }
}
