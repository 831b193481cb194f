use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed trace event: {0}")]
    ProtocolError(String),

    #[error("{context} failed with error code {code}")]
    StartupError { context: String, code: u32 },

    #[error("Network configuration error: {0}")]
    ConfigError(String),

    #[error("Timed out waiting for the network configuration lock (held by {0})")]
    TimeoutError(String),

    #[error("Usage error: {0}")]
    UsageError(String),

    #[error("Interface {index} lookup failed with error code {code}")]
    InterfaceError { index: u32, code: u32 },

    #[error("Interface id {0} was never added to the capture file")]
    UnknownInterface(u32),

    #[error("Live capture is not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Capture session is {0:?}, operation not allowed")]
    SessionState(crate::session::SessionState),
}

impl CaptureError {
    pub fn startup(context: impl Into<String>, code: u32) -> Self {
        CaptureError::StartupError {
            context: context.into(),
            code,
        }
    }

    /// 该错误对应的进程退出码。
    ///
    /// 启动失败使用导致失败的系统错误码；用法错误为 2，其余为 1。
    pub fn exit_code(&self) -> i32 {
        match self {
            CaptureError::StartupError { code, .. } if *code != 0 => *code as i32,
            CaptureError::UsageError(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
