//! Smart-HTTP ref discovery (`GET <repo>/info/refs?service=git-upload-pack`).
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::{Credential, RefLister, RemoteRef, Stage, TransportError};

const ADVERTISEMENT_TYPE: &str = "application/x-git-upload-pack-advertisement";

#[derive(Clone)]
pub struct HttpRefLister { client: Client }

impl HttpRefLister {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("git/2.45 keel-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RefLister for HttpRefLister {
    async fn list_refs(&self, url: &str, credential: Credential<'_>) -> Result<Vec<RemoteRef>, TransportError> {
        let endpoint = format!("{}/info/refs?service=git-upload-pack", url.trim_end_matches('/'));
        let mut req = self.client.get(&endpoint).header("Git-Protocol", "version=1");
        match credential {
            Credential::Token { username, token } => req = req.basic_auth(username, Some(token)),
            Credential::SshKey(_) => return Err(TransportError::new(Stage::Connect, "ssh key offered to an http transport")),
            Credential::Anonymous => {}
        }
        let resp = req.send().await.map_err(|e| TransportError::new(Stage::Connect, e.to_string()))?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(TransportError::new(Stage::Authenticate, format!("{} from {url}", resp.status())))
            }
            StatusCode::NOT_FOUND => return Err(TransportError::new(Stage::NotFound, format!("repository {url} not found"))),
            s => return Err(TransportError::new(Stage::Connect, format!("unexpected status {s} from {url}"))),
        }
        let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
        if !content_type.starts_with(ADVERTISEMENT_TYPE) {
            return Err(TransportError::new(Stage::Connect, format!("{url} did not answer with a ref advertisement ({content_type})")));
        }
        let body = resp.bytes().await.map_err(|e| TransportError::new(Stage::Connect, e.to_string()))?;
        parse_advertisement(&body).map_err(|m| TransportError::new(Stage::Connect, m))
    }
}

/// Decodes a pkt-line ref advertisement. The service header, flush packets
/// and the capability list after the first NUL are skipped.
pub fn parse_advertisement(body: &[u8]) -> Result<Vec<RemoteRef>, String> {
    let mut refs = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < 4 { return Err("truncated pkt-line header".into()); }
        let len_hex = std::str::from_utf8(&rest[..4]).map_err(|_| "non-ascii pkt-line header".to_string())?;
        let len = usize::from_str_radix(len_hex, 16).map_err(|_| format!("bad pkt-line length {len_hex:?}"))?;
        // flush, delim and response-end packets carry no payload
        if len <= 2 {
            rest = &rest[4..];
            continue;
        }
        if len < 4 || len > rest.len() { return Err(format!("pkt-line length {len} out of range")); }
        let payload = &rest[4..len];
        rest = &rest[len..];

        let line = String::from_utf8_lossy(payload);
        let line = line.trim_end_matches('\n');
        if line.starts_with('#') || line.starts_with("version ") { continue; }
        let line = line.split('\0').next().unwrap_or_default();
        let Some((oid, name)) = line.split_once(' ') else { continue };
        if name == "capabilities^{}" { continue; }
        refs.push(RemoteRef::new(name, oid));
    }
    Ok(refs)
}
