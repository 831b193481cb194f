use std::time::Duration;

use windows::Win32::Foundation::ERROR_SERVICE_ALREADY_RUNNING;
use windows::Win32::System::Services::{
    CloseServiceHandle, OpenSCManagerW, OpenServiceW, QueryServiceStatus, SC_HANDLE,
    SC_MANAGER_CONNECT, SERVICE_CONTINUE_PENDING, SERVICE_PAUSE_PENDING, SERVICE_PAUSED,
    SERVICE_QUERY_STATUS, SERVICE_RUNNING, SERVICE_START, SERVICE_START_PENDING, SERVICE_STATUS,
    SERVICE_STOP_PENDING, SERVICE_STOPPED, SERVICES_ACTIVE_DATABASEW, StartServiceW,
};
use windows::core::{HSTRING, PCWSTR};

use super::win32_code;
use crate::error::{CaptureError, Result};
use crate::service::{ServiceManager, ServiceState, ServiceStatus, StartRequest};

/// 本机服务控制管理器
pub struct ServiceControl;

struct ServiceHandle(SC_HANDLE);

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let _ = unsafe { CloseServiceHandle(self.0) };
    }
}

fn startup_error(context: String) -> impl FnOnce(windows::core::Error) -> CaptureError {
    move |e| CaptureError::startup(context, win32_code(&e))
}

fn open(name: &str, access: u32) -> Result<(ServiceHandle, ServiceHandle)> {
    let manager = unsafe { OpenSCManagerW(PCWSTR::null(), SERVICES_ACTIVE_DATABASEW, SC_MANAGER_CONNECT) }
        .map(ServiceHandle)
        .map_err(startup_error("OpenSCManager".to_string()))?;
    let service = unsafe { OpenServiceW(manager.0, &HSTRING::from(name), access) }
        .map(ServiceHandle)
        .map_err(startup_error(format!("OpenService({})", name)))?;
    Ok((manager, service))
}

fn state_of(status: &SERVICE_STATUS) -> Result<ServiceState> {
    let state = match status.dwCurrentState {
        SERVICE_STOPPED => ServiceState::Stopped,
        SERVICE_START_PENDING => ServiceState::StartPending,
        SERVICE_STOP_PENDING => ServiceState::StopPending,
        SERVICE_RUNNING => ServiceState::Running,
        SERVICE_CONTINUE_PENDING => ServiceState::ContinuePending,
        SERVICE_PAUSE_PENDING => ServiceState::PausePending,
        SERVICE_PAUSED => ServiceState::Paused,
        other => {
            return Err(CaptureError::startup(
                format!("Unknown service state {}", other.0),
                0,
            ));
        }
    };
    Ok(state)
}

impl ServiceManager for ServiceControl {
    fn query(&self, name: &str) -> Result<ServiceStatus> {
        let (_manager, service) = open(name, SERVICE_QUERY_STATUS)?;
        let mut status = SERVICE_STATUS::default();
        unsafe { QueryServiceStatus(service.0, &mut status) }
            .map_err(startup_error(format!("QueryServiceStatus({})", name)))?;

        Ok(ServiceStatus {
            state: state_of(&status)?,
            wait_hint: Duration::from_millis(status.dwWaitHint as u64),
            exit_code: status.dwWin32ExitCode,
        })
    }

    fn start(&self, name: &str) -> Result<StartRequest> {
        let (_manager, service) = open(name, SERVICE_QUERY_STATUS | SERVICE_START)?;
        match unsafe { StartServiceW(service.0, None) } {
            Ok(()) => Ok(StartRequest::Started),
            Err(e) if win32_code(&e) == ERROR_SERVICE_ALREADY_RUNNING.0 => {
                Ok(StartRequest::AlreadyRunning)
            }
            Err(e) => Err(CaptureError::startup(
                format!("StartService({})", name),
                win32_code(&e),
            )),
        }
    }
}
