use std::sync::{Mutex, PoisonError};

use windows::Win32::Foundation::{BOOL, FALSE, TRUE};
use windows::Win32::System::Console::{CTRL_C_EVENT, SetConsoleCtrlHandler};

use super::win32_code;
use crate::cancel::{Dispatch, InterruptSource};
use crate::error::{CaptureError, Result};

static DISPATCH: Mutex<Option<Dispatch>> = Mutex::new(None);

unsafe extern "system" fn on_console_ctrl(ctrl_type: u32) -> BOOL {
    if ctrl_type != CTRL_C_EVENT {
        return FALSE;
    }
    let dispatch = DISPATCH
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match dispatch {
        Some(dispatch) if dispatch() => TRUE,
        _ => FALSE,
    }
}

/// 通过 `SetConsoleCtrlHandler` 接收 Ctrl-C
pub struct ConsoleInterrupt;

impl InterruptSource for ConsoleInterrupt {
    fn subscribe(&self, dispatch: Dispatch) -> Result<()> {
        *DISPATCH.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatch);
        unsafe { SetConsoleCtrlHandler(Some(on_console_ctrl), TRUE) }.map_err(|e| {
            DISPATCH
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            CaptureError::startup("SetConsoleCtrlHandler", win32_code(&e))
        })
    }

    fn unsubscribe(&self) {
        let _ = unsafe { SetConsoleCtrlHandler(Some(on_console_ctrl), FALSE) };
        DISPATCH
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
