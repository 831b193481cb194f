use std::ffi::c_void;
use std::mem::size_of;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use uuid::Uuid;
use windows::Win32::Foundation::{
    ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_SUCCESS, ERROR_WMI_INSTANCE_NOT_FOUND,
};
use windows::Win32::System::Diagnostics::Etw::{
    CONTROLTRACE_HANDLE, CloseTrace, ControlTraceW, EVENT_CONTROL_CODE_ENABLE_PROVIDER,
    EVENT_RECORD, EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_LOGFILEW, EVENT_TRACE_PROPERTIES,
    EVENT_TRACE_REAL_TIME_MODE, EnableTraceEx2, OpenTraceW, PROCESS_TRACE_MODE_EVENT_RECORD,
    PROCESS_TRACE_MODE_REAL_TIME, PROCESSTRACE_HANDLE, ProcessTrace, StartTraceW,
    WNODE_FLAG_TRACED_GUID,
};
use windows::core::{GUID, HSTRING, PWSTR};

use crate::decoder::TraceEvent;
use crate::error::{CaptureError, Result};
use crate::session::{BufferConfig, SessionStartError, TraceBackend};

const INVALID_PROCESSTRACE_HANDLE: u64 = u64::MAX;

/// 属性头之后为日志文件名和会话名预留的空间
const NAME_SPACE: usize = 1024;

/// `EVENT_TRACE_PROPERTIES` 及其后的名称缓冲区
struct TraceProperties {
    buf: Vec<u64>,
}

impl TraceProperties {
    fn new(buffers: &BufferConfig) -> Self {
        let total = size_of::<EVENT_TRACE_PROPERTIES>() + 2 * NAME_SPACE;
        let mut props = Self {
            buf: vec![0u64; total.div_ceil(8)],
        };

        let header = props.header();
        header.Wnode.BufferSize = total as u32;
        header.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        header.LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        header.LogFileNameOffset = size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        header.LoggerNameOffset = header.LogFileNameOffset + NAME_SPACE as u32;
        header.BufferSize = buffers.buffer_size_kb;
        header.MinimumBuffers = buffers.minimum_buffers;
        header.MaximumBuffers = buffers.maximum_buffers;
        header.FlushTimer = buffers.flush_timer_secs;
        props
    }

    fn header(&mut self) -> &mut EVENT_TRACE_PROPERTIES {
        unsafe { &mut *(self.buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES) }
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES
    }
}

/// 实时 ETW 会话及其消费者
pub struct EtwBackend {
    control: Mutex<Option<CONTROLTRACE_HANDLE>>,
    consumer: Mutex<Option<PROCESSTRACE_HANDLE>>,
    cancelled: AtomicBool,
}

struct ConsumeContext<'a> {
    on_event: &'a mut dyn FnMut(&TraceEvent<'_>) -> ControlFlow<()>,
    backend: &'a EtwBackend,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

unsafe extern "system" fn on_event_record(record: *mut EVENT_RECORD) {
    let record = unsafe { &*record };
    let context = unsafe { &mut *(record.UserContext as *mut ConsumeContext<'_>) };

    let payload = if record.UserData.is_null() || record.UserDataLength == 0 {
        &[][..]
    } else {
        unsafe {
            std::slice::from_raw_parts(
                record.UserData as *const u8,
                record.UserDataLength as usize,
            )
        }
    };

    let header = &record.EventHeader;
    let event = TraceEvent {
        provider_id: Uuid::from_u128(header.ProviderId.to_u128()),
        event_id: header.EventDescriptor.Id,
        version: header.EventDescriptor.Version,
        timestamp: header.TimeStamp,
        payload,
    };

    if (context.on_event)(&event).is_break() {
        context.backend.close_consumer();
    }
}

impl EtwBackend {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(None),
            consumer: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    fn close_consumer(&self) {
        if let Some(handle) = lock(&self.consumer).take() {
            let err = unsafe { CloseTrace(handle) };
            if err != ERROR_SUCCESS && err != ERROR_CANCELLED {
                warn!("CloseTrace failed with error code {}", err.0);
            }
        }
    }
}

impl Default for EtwBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBackend for EtwBackend {
    fn start_session(
        &self,
        name: &str,
        buffers: &BufferConfig,
    ) -> std::result::Result<(), SessionStartError> {
        let mut props = TraceProperties::new(buffers);
        let mut handle = CONTROLTRACE_HANDLE::default();
        let err = unsafe { StartTraceW(&mut handle, &HSTRING::from(name), props.as_mut_ptr()) };

        if err == ERROR_ALREADY_EXISTS {
            return Err(SessionStartError::AlreadyExists);
        }
        if err != ERROR_SUCCESS {
            return Err(SessionStartError::Failed(err.0));
        }

        debug!("StartTrace({}) returned handle {:#x}", name, handle.Value);
        *lock(&self.control) = Some(handle);
        self.cancelled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn enable_provider(&self, provider: &Uuid, level: u8, match_any_keyword: u64) -> Result<()> {
        let handle = (*lock(&self.control)).ok_or_else(|| {
            CaptureError::startup("EnableTraceEx2 without a running session", 0)
        })?;
        let guid = GUID::from_u128(provider.as_u128());
        let err = unsafe {
            EnableTraceEx2(
                handle,
                &guid,
                EVENT_CONTROL_CODE_ENABLE_PROVIDER,
                level,
                match_any_keyword,
                0,
                0,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            return Err(CaptureError::startup("EnableTraceEx2", err.0));
        }
        Ok(())
    }

    fn stop_session(&self, name: &str) -> Result<()> {
        let mut props = TraceProperties::new(&BufferConfig::default());
        let err = unsafe {
            ControlTraceW(
                CONTROLTRACE_HANDLE::default(),
                &HSTRING::from(name),
                props.as_mut_ptr(),
                EVENT_TRACE_CONTROL_STOP,
            )
        };
        lock(&self.control).take();

        if err != ERROR_SUCCESS && err != ERROR_WMI_INSTANCE_NOT_FOUND {
            return Err(CaptureError::startup(format!("ControlTrace({})", name), err.0));
        }
        Ok(())
    }

    fn consume(
        &self,
        name: &str,
        on_event: &mut dyn FnMut(&TraceEvent<'_>) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut context = ConsumeContext {
            on_event,
            backend: self,
        };
        let mut logger_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();

        let mut logfile = EVENT_TRACE_LOGFILEW {
            LoggerName: PWSTR(logger_name.as_mut_ptr()),
            Context: &mut context as *mut ConsumeContext<'_> as *mut c_void,
            ..Default::default()
        };
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(on_event_record);

        let handle = unsafe { OpenTraceW(&mut logfile) };
        if handle.Value == INVALID_PROCESSTRACE_HANDLE {
            let code = windows::core::Error::from_win32();
            return Err(CaptureError::startup(
                format!("OpenTrace({})", name),
                super::win32_code(&code),
            ));
        }

        *lock(&self.consumer) = Some(handle);
        if self.cancelled.load(Ordering::SeqCst) {
            self.close_consumer();
            return Ok(());
        }

        let err = unsafe { ProcessTrace(&[handle], None, None) };
        self.close_consumer();

        if err != ERROR_SUCCESS && err != ERROR_CANCELLED {
            return Err(CaptureError::startup("ProcessTrace", err.0));
        }
        Ok(())
    }

    fn cancel_consume(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.close_consumer();
    }
}
