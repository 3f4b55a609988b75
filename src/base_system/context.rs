//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及到 worker / 网络设置的投影。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use super::retry::RetryPolicy;
use crate::download::worker::WorkerSettings;
use crate::network_parser::network::{FetchSettings, default_user_agent};
use crate::third_party::link_resolver::ResolverKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 传输配置
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u32,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_min_connect_timeout")]
    pub min_connect_timeout: f64,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 路径配置
    #[serde(default)]
    pub save_path: String,

    // 事件配置
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    // 链接解析
    #[serde(default = "default_resolver")]
    pub resolver: ResolverKind,
    #[serde(default)]
    pub meta_api_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            flush_threshold: default_flush_threshold(),
            request_timeout: default_request_timeout(),
            min_connect_timeout: default_min_connect_timeout(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            user_agent: default_user_agent(),
            save_path: String::new(),
            event_buffer: default_event_buffer(),
            resolver: default_resolver(),
            meta_api_endpoint: String::new(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 12] = [
            FieldMeta {
                name: "chunk_size",
                description: "单次 Range 请求的分块大小（字节）",
            },
            FieldMeta {
                name: "max_retries",
                description: "单个分块的最大尝试次数",
            },
            FieldMeta {
                name: "flush_threshold",
                description: "每写入多少个分块强制落盘一次",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "min_connect_timeout",
                description: "最小连接超时时间（秒）",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "重试最小等待时间, 单位ms",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "重试最大等待时间, 单位ms",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "save_path",
                description: "保存路径，留空为当前目录",
            },
            FieldMeta {
                name: "event_buffer",
                description: "每个订阅者缓存的进度事件数，满时丢弃最旧的",
            },
            FieldMeta {
                name: "resolver",
                description: "链接解析方式: direct（远端路径即下载地址）/ meta_api（查询元数据接口）",
            },
            FieldMeta {
                name: "meta_api_endpoint",
                description: "meta_api 模式下的元数据接口地址",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries must be > 0".into()));
        }
        if self.flush_threshold == 0 {
            return Err(ConfigError::Validation("flush_threshold must be > 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Validation("event_buffer must be > 0".into()));
        }
        if !self.min_connect_timeout.is_finite() || self.min_connect_timeout <= 0.0 {
            return Err(ConfigError::Validation(
                "min_connect_timeout must be a positive number".into(),
            ));
        }
        if self.resolver == ResolverKind::MetaApi && self.meta_api_endpoint.trim().is_empty() {
            return Err(ConfigError::Validation(
                "resolver `meta_api` requires meta_api_endpoint".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            chunk_size: self.chunk_size.max(1),
            flush_threshold: self.flush_threshold.max(1),
            retry: RetryPolicy::from_millis(
                self.max_retries,
                self.min_wait_time,
                self.max_wait_time,
            ),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        let connect = if self.min_connect_timeout.is_finite() && self.min_connect_timeout > 0.0 {
            Duration::from_secs_f64(self.min_connect_timeout)
        } else {
            Duration::from_secs_f64(default_min_connect_timeout())
        };
        FetchSettings {
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
            connect_timeout: connect,
            user_agent: self.user_agent.clone(),
        }
    }
}

/// 把任意字符串转换成可用的文件名。
pub fn safe_fs_name(name: &str, replacement: char, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => replacement,
            c if (c as u32) < 32 => replacement,
            _ => ch,
        })
        .collect();

    let trimmed = cleaned.trim_end_matches([' ', '.']).trim_start();
    cleaned = trimmed.to_string();

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let stem = cleaned.split('.').next().unwrap_or("").to_uppercase();
    if RESERVED.contains(&stem.as_str()) {
        cleaned.insert(0, '_');
    }

    if cleaned.len() > max_len {
        let mut end = max_len;
        while end > 0 && !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    if cleaned.is_empty() {
        cleaned.push_str("download.bin");
    }
    cleaned
}

/// 从远端路径或 URL 中取最后一段作为默认文件名。
pub fn file_name_from_remote(remote: &str) -> String {
    let without_query = remote.split(['?', '#']).next().unwrap_or(remote);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    safe_fs_name(last, '_', 200)
}

fn default_chunk_size() -> u64 {
    crate::download::models::DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    crate::download::models::DEFAULT_MAX_RETRIES
}

fn default_flush_threshold() -> u32 {
    crate::download::models::DEFAULT_FLUSH_THRESHOLD
}

fn default_request_timeout() -> u64 {
    30
}

fn default_min_connect_timeout() -> f64 {
    3.05
}

fn default_min_wait_time() -> u64 {
    200
}

fn default_max_wait_time() -> u64 {
    3000
}

fn default_event_buffer() -> usize {
    256
}

fn default_resolver() -> ResolverKind {
    ResolverKind::Direct
}
