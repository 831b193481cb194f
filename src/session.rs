//! 实时跟踪会话的生命周期。
//!
//! [`CaptureSession`] 依次经过 `Idle -> Starting -> Active -> Stopping -> Closed`。
//! `Closed` 为终态，新的捕获需要新的会话。

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decoder::{EventSink, NDIS_PACKET_CAPTURE, TraceEvent};
use crate::error::{CaptureError, Result};

/// `TRACE_LEVEL_VERBOSE` 及以上
pub const LEVEL_ALL: u8 = 0xFF;
pub const KEYWORDS_ALL: u64 = u64::MAX;

/// `ERROR_ALREADY_EXISTS`
pub const ALREADY_EXISTS: u32 = 183;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Closed,
}

/// 跟踪缓冲区参数，0 表示使用系统默认值
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub buffer_size_kb: u32,
    pub minimum_buffers: u32,
    pub maximum_buffers: u32,
    pub flush_timer_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStartError {
    /// 同名会话仍然存在
    AlreadyExists,
    Failed(u32),
}

impl SessionStartError {
    pub fn code(self) -> u32 {
        match self {
            SessionStartError::AlreadyExists => ALREADY_EXISTS,
            SessionStartError::Failed(code) => code,
        }
    }
}

/// 实时跟踪会话的系统实现。
///
/// 一个后端对应一个会话。`cancel_consume` 可以在任意线程调用，包括 `consume`
/// 开始之前，此时 `consume` 必须立即返回。
pub trait TraceBackend: Send + Sync {
    fn start_session(
        &self,
        name: &str,
        buffers: &BufferConfig,
    ) -> std::result::Result<(), SessionStartError>;

    fn enable_provider(&self, provider: &Uuid, level: u8, match_any_keyword: u64) -> Result<()>;

    /// 刷新并结束指定会话
    fn stop_session(&self, name: &str) -> Result<()>;

    /// 按顺序投递事件，直到被取消、会话结束或 `on_event` 返回 break。
    fn consume(
        &self,
        name: &str,
        on_event: &mut dyn FnMut(&TraceEvent<'_>) -> ControlFlow<()>,
    ) -> Result<()>;

    fn cancel_consume(&self);
}

struct Lifecycle {
    state: SessionState,
    consuming: bool,
    // Starting 期间收到的停止请求，启动完成后执行
    stop_pending: bool,
}

struct Shared {
    backend: Arc<dyn TraceBackend>,
    name: String,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    fn stop(&self) {
        {
            let mut lifecycle = self.lock();
            match lifecycle.state {
                SessionState::Active => lifecycle.state = SessionState::Stopping,
                SessionState::Idle => {
                    lifecycle.state = SessionState::Closed;
                    return;
                }
                SessionState::Starting => {
                    lifecycle.stop_pending = true;
                    return;
                }
                _ => return,
            }
        }

        info!("Stopping trace session {}", self.name);
        self.backend.cancel_consume();
        if let Err(e) = self.backend.stop_session(&self.name) {
            error!("Failed to stop trace session {}: {}", self.name, e);
        }

        let mut lifecycle = self.lock();
        if !lifecycle.consuming {
            lifecycle.state = SessionState::Closed;
        }
    }
}

/// 从其他线程停止会话
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// 与 [`CaptureSession::stop`] 相同
    pub fn stop(&self) {
        self.shared.stop();
    }
}

pub struct CaptureSession {
    shared: Arc<Shared>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn TraceBackend>, name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                name: name.into(),
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    consuming: false,
                    stop_pending: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 打开实时会话并启用数据包捕获提供程序。
    ///
    /// 异常退出遗留的同名会话会先被停止，然后重试一次。启动期间收到的停止请求
    /// 在会话建立后立即执行，会话最终为 `Closed`。
    pub fn start(&self, buffers: &BufferConfig) -> Result<()> {
        {
            let mut lifecycle = self.shared.lock();
            if lifecycle.state != SessionState::Idle {
                return Err(CaptureError::SessionState(lifecycle.state));
            }
            lifecycle.state = SessionState::Starting;
        }

        match self.open(buffers) {
            Ok(()) => {
                let stop_pending = {
                    let mut lifecycle = self.shared.lock();
                    lifecycle.state = SessionState::Active;
                    lifecycle.stop_pending
                };
                info!("Trace session {} started", self.shared.name);
                if stop_pending {
                    self.shared.stop();
                }
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    fn open(&self, buffers: &BufferConfig) -> Result<()> {
        let backend = &self.shared.backend;
        let name = &self.shared.name;

        match backend.start_session(name, buffers) {
            Ok(()) => {}
            Err(SessionStartError::AlreadyExists) => {
                warn!("Trace session {} already exists, replacing it", name);
                if let Err(e) = backend.stop_session(name) {
                    warn!("Failed to stop stale trace session {}: {}", name, e);
                }
                backend
                    .start_session(name, buffers)
                    .map_err(|e| CaptureError::startup("StartTrace", e.code()))?;
            }
            Err(e) => return Err(CaptureError::startup("StartTrace", e.code())),
        }

        if let Err(e) = backend.enable_provider(&NDIS_PACKET_CAPTURE, LEVEL_ALL, KEYWORDS_ALL) {
            if let Err(stop_err) = backend.stop_session(name) {
                error!("Failed to stop trace session {}: {}", name, stop_err);
            }
            return Err(e);
        }

        Ok(())
    }

    /// 在调用线程上把每个事件交给 `sink`，直到会话关闭。
    ///
    /// `sink` 返回错误时结束消费、停止会话并返回该错误。
    pub fn process(&self, sink: &mut dyn EventSink) -> Result<()> {
        {
            let mut lifecycle = self.shared.lock();
            match lifecycle.state {
                SessionState::Active => lifecycle.consuming = true,
                SessionState::Stopping | SessionState::Closed => {
                    lifecycle.state = SessionState::Closed;
                    return Ok(());
                }
                state => return Err(CaptureError::SessionState(state)),
            }
        }

        let mut failure = None;
        let consumed = self
            .shared
            .backend
            .consume(&self.shared.name, &mut |event| match sink.on_event(event) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            });

        self.shared.lock().consuming = false;
        self.shared.stop();
        self.shared.set_state(SessionState::Closed);
        info!("Trace session {} closed", self.shared.name);

        match failure {
            Some(e) => Err(e),
            None => consumed,
        }
    }

    /// 请求刷新并结束会话，可重复调用
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shared.stop();
    }
}
