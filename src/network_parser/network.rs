//! 分块 Range 请求。
//!
//! 每个任务持有一个 [`HttpRangeFetcher`]，即一个独立的 keep-alive 连接池。

use std::io::{self, Read};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, CONNECTION, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use thiserror::Error;
use tracing::debug;

use crate::download::models::ByteRange;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reading body failed: {0}")]
    Body(#[from] io::Error),
    #[error("unexpected status {status} for {range}")]
    Status { status: u16, range: String },
    #[error("server ignored range {0}")]
    RangeNotHonoured(String),
    #[error("body length mismatch: expected {expected} bytes, got {actual}")]
    BodyLength { expected: u64, actual: u64 },
}

/// 对一个字节区间发起一次请求并返回原始字节。
///
/// 重试由调用方负责，实现只做单次尝试。
pub trait RangeFetcher: Send {
    fn fetch(&mut self, url: &str, range: ByteRange) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs_f64(3.05),
            user_agent: default_user_agent(),
        }
    }
}

pub fn default_user_agent() -> String {
    format!("chunk-downloader/{}", env!("CARGO_PKG_VERSION"))
}

/// 构建带 keep-alive 默认头的阻塞客户端。
pub(crate) fn build_client(
    settings: &FetchSettings,
    follow_redirects: bool,
) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    // 区间以原始字节计算，不能让服务端压缩
    default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(ua) = HeaderValue::from_str(&settings.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }

    let redirect = if follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    Client::builder()
        .default_headers(default_headers)
        .timeout(settings.request_timeout)
        .connect_timeout(settings.connect_timeout)
        .redirect(redirect)
        .build()
}

pub struct HttpRangeFetcher {
    client: Client,
}

impl HttpRangeFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(settings, true)?,
        })
    }
}

impl RangeFetcher for HttpRangeFetcher {
    fn fetch(&mut self, url: &str, range: ByteRange) -> Result<Vec<u8>, FetchError> {
        let header = range.header_value();
        let resp = self.client.get(url).header(RANGE, header.as_str()).send()?;
        let status = resp.status();
        debug!(target: "download", "GET {} {} -> {}", url, header, status.as_u16());

        match status {
            StatusCode::PARTIAL_CONTENT => {}
            // 整体返回只在区间恰好覆盖整个对象时可用，长度在下面校验
            StatusCode::OK if range.start == 0 => {}
            StatusCode::OK => return Err(FetchError::RangeNotHonoured(header)),
            other => {
                return Err(FetchError::Status {
                    status: other.as_u16(),
                    range: header,
                });
            }
        }

        let expected = range.len();
        let mut body = Vec::with_capacity(expected as usize);
        // 多读一个字节，用于识别超长响应
        resp.take(expected + 1).read_to_end(&mut body)?;
        let actual = body.len() as u64;

        if actual == expected {
            return Ok(body);
        }
        if status == StatusCode::OK && actual > expected {
            return Err(FetchError::RangeNotHonoured(header));
        }
        Err(FetchError::BodyLength { expected, actual })
    }
}
