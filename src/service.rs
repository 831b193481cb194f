use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::error::{CaptureError, Result};

pub const CAPTURE_SERVICE: &str = "ndiscap";

/// `ERROR_SERVICE_NOT_ACTIVE`
const SERVICE_NOT_ACTIVE: u32 = 1062;

const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub wait_hint: Duration,
    /// 服务报告的 Win32 退出码，没有则为 0
    pub exit_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRequest {
    Started,
    /// 在我们查询和请求之间已被他人启动
    AlreadyRunning,
}

/// 启动驱动所需的服务控制管理器操作
pub trait ServiceManager {
    fn query(&self, name: &str) -> Result<ServiceStatus>;
    fn start(&self, name: &str) -> Result<StartRequest>;
}

fn poll_interval(wait_hint: Duration) -> Duration {
    wait_hint.clamp(MIN_POLL, MAX_POLL)
}

fn not_running(name: &str, what: &str, status: &ServiceStatus) -> CaptureError {
    let code = if status.exit_code != 0 {
        status.exit_code
    } else {
        SERVICE_NOT_ACTIVE
    };
    CaptureError::startup(format!("Service {} {}", name, what), code)
}

/// 确保 `name` 处于运行状态，必要时启动并等待
pub fn ensure_running(manager: &dyn ServiceManager, name: &str) -> Result<()> {
    let mut status = manager.query(name)?;
    if status.state == ServiceState::Running {
        debug!("Service {} already running", name);
        return Ok(());
    }

    let mut requested = false;
    loop {
        match status.state {
            ServiceState::Running => {
                info!("Service {} is running", name);
                return Ok(());
            }
            ServiceState::Stopped if requested => {
                return Err(not_running(name, "stopped while starting", &status));
            }
            ServiceState::Stopped => {
                info!("Starting service {}", name);
                if manager.start(name)? == StartRequest::AlreadyRunning {
                    debug!("Service {} was started concurrently", name);
                }
                requested = true;
            }
            ServiceState::Paused | ServiceState::PausePending => {
                return Err(not_running(name, "is paused", &status));
            }
            ServiceState::StartPending
            | ServiceState::StopPending
            | ServiceState::ContinuePending => {}
        }

        thread::sleep(poll_interval(status.wait_hint));
        status = manager.query(name)?;
    }
}
