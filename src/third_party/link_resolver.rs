//! 远端路径 → 元数据 → 直链 的解析接口及两种实现。
//!
//! - `DirectLinkResolver`：远端路径本身就是 HTTP(S) 地址，用 HEAD 取大小与版本标识；
//! - `MetaApiResolver`：先查询元数据接口拿到 dlink，再对 dlink 做一次不跟随跳转的请求，
//!   取得真实下载地址与请求标识。

use std::sync::Arc;

use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, LAST_MODIFIED, LOCATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::network_parser::network::{FetchSettings, build_client};

const REQUEST_ID_HEADERS: [&str; 2] = ["x-bs-request-id", "x-request-id"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("metadata api returned errno {0}")]
    Api(i64),
    #[error("missing field `{0}` in response")]
    MissingField(&'static str),
    #[error("download link came back without a request token")]
    EmptyToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    pub path: String,
    pub dlink: String,
    pub size: Option<u64>,
    /// 服务端给出的版本/请求标识（可能为空）。
    pub revision: Option<String>,
}

/// 一次 worker 运行内有效的下载地址。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectLink {
    pub url: String,
    pub token: String,
}

pub trait LinkResolver: Send + Sync {
    fn resolve_metadata(&self, remote_path: &str) -> Result<RemoteMeta, ResolveError>;
    fn resolve_direct_link(&self, meta: &RemoteMeta) -> Result<DirectLink, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    Direct,
    MetaApi,
}

/// 按配置构建解析器。`meta_api` 需要非空的 `endpoint`。
pub fn build_resolver(
    kind: ResolverKind,
    endpoint: &str,
    settings: &FetchSettings,
) -> Result<Arc<dyn LinkResolver>, ResolveError> {
    Ok(match kind {
        ResolverKind::Direct => Arc::new(DirectLinkResolver::new(settings)?),
        ResolverKind::MetaApi => {
            if endpoint.trim().is_empty() {
                return Err(ResolveError::MissingField("meta_api_endpoint"));
            }
            Arc::new(MetaApiResolver::new(endpoint, settings)?)
        }
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS
        .iter()
        .find_map(|name| header_str(headers, name))
}

fn ensure_success(resp: Response) -> Result<Response, ResolveError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(ResolveError::Status {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

// ── 直链 ──────────────────────────────────────────────────────

pub struct DirectLinkResolver {
    client: Client,
}

impl DirectLinkResolver {
    pub fn new(settings: &FetchSettings) -> Result<Self, ResolveError> {
        Ok(Self {
            client: build_client(settings, true)?,
        })
    }
}

impl LinkResolver for DirectLinkResolver {
    fn resolve_metadata(&self, remote_path: &str) -> Result<RemoteMeta, ResolveError> {
        let resp = ensure_success(self.client.head(remote_path).send()?)?;
        let headers = resp.headers();
        let size = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
        let revision = request_id(headers)
            .or_else(|| header_str(headers, ETAG.as_str()))
            .or_else(|| header_str(headers, LAST_MODIFIED.as_str()));
        let dlink = resp.url().to_string();
        debug!(target: "resolver", "HEAD {} -> {} size={:?}", remote_path, dlink, size);

        Ok(RemoteMeta {
            path: remote_path.to_string(),
            dlink,
            size,
            revision,
        })
    }

    fn resolve_direct_link(&self, meta: &RemoteMeta) -> Result<DirectLink, ResolveError> {
        if meta.dlink.is_empty() {
            return Err(ResolveError::MissingField("dlink"));
        }
        Ok(DirectLink {
            url: meta.dlink.clone(),
            token: meta.revision.clone().unwrap_or_else(|| meta.dlink.clone()),
        })
    }
}

// ── 元数据接口 ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MetaResponse {
    errno: i64,
    #[serde(default)]
    info: Vec<MetaInfo>,
}

#[derive(Debug, Deserialize)]
struct MetaInfo {
    #[serde(default)]
    dlink: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

pub struct MetaApiResolver {
    endpoint: String,
    api: Client,
    // dlink 的跳转需要手动读取 Location
    no_redirect: Client,
}

impl MetaApiResolver {
    pub fn new(
        endpoint: impl Into<String>,
        settings: &FetchSettings,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            endpoint: endpoint.into(),
            api: build_client(settings, true)?,
            no_redirect: build_client(settings, false)?,
        })
    }
}

impl LinkResolver for MetaApiResolver {
    fn resolve_metadata(&self, remote_path: &str) -> Result<RemoteMeta, ResolveError> {
        let resp = self
            .api
            .get(&self.endpoint)
            .query(&[("path", remote_path)])
            .send()?;
        let meta: MetaResponse = ensure_success(resp)?.json()?;
        if meta.errno != 0 {
            return Err(ResolveError::Api(meta.errno));
        }
        let info = meta
            .info
            .into_iter()
            .next()
            .ok_or(ResolveError::MissingField("info"))?;
        let dlink = info
            .dlink
            .filter(|d| !d.trim().is_empty())
            .ok_or(ResolveError::MissingField("dlink"))?;

        Ok(RemoteMeta {
            path: remote_path.to_string(),
            dlink,
            size: info.size,
            revision: None,
        })
    }

    fn resolve_direct_link(&self, meta: &RemoteMeta) -> Result<DirectLink, ResolveError> {
        let resp = self.no_redirect.head(&meta.dlink).send()?;
        let status = resp.status();
        let headers = resp.headers();

        let url = if status.is_redirection() {
            header_str(headers, LOCATION.as_str()).ok_or(ResolveError::MissingField("location"))?
        } else if status.is_success() {
            meta.dlink.clone()
        } else {
            return Err(ResolveError::Status {
                status: status.as_u16(),
                url: meta.dlink.clone(),
            });
        };

        let token = request_id(headers).ok_or(ResolveError::EmptyToken)?;
        debug!(target: "resolver", "dlink {} -> {} (token {})", meta.dlink, url, token);
        Ok(DirectLink { url, token })
    }
}
