use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::service::CAPTURE_SERVICE;
use crate::session::BufferConfig;

/// 与 tcpdump 相同的默认快照长度
pub const DEFAULT_SNAPLEN: u32 = 262144;
pub const DEFAULT_SESSION_NAME: &str = "wncap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    pub output: PathBuf,
    pub snaplen: u32,
    /// 为兼容而接受，不参与过滤
    pub filter: String,
    pub session_name: String,
    pub service_name: String,
    pub buffers: BufferConfig,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::new(),
            snaplen: DEFAULT_SNAPLEN,
            filter: String::new(),
            session_name: DEFAULT_SESSION_NAME.to_string(),
            service_name: CAPTURE_SERVICE.to_string(),
            buffers: BufferConfig::default(),
        }
    }
}

impl CaptureOptions {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut options: CaptureOptions = serde_json::from_str(text)
            .map_err(|e| CaptureError::UsageError(format!("invalid configuration: {}", e)))?;
        if options.snaplen == 0 {
            options.snaplen = DEFAULT_SNAPLEN;
        }
        Ok(options)
    }
}

/// 命令行给出的快照长度；非正数使用默认值。
pub fn effective_snaplen(requested: i64) -> u32 {
    if requested <= 0 {
        DEFAULT_SNAPLEN
    } else {
        u32::try_from(requested).unwrap_or(u32::MAX)
    }
}
