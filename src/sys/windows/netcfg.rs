use std::time::Duration;

use log::{debug, warn};
use windows::Win32::Foundation::{BOOL, RPC_E_CHANGED_MODE, S_FALSE};
use windows::Win32::NetworkManagement::NetManagement::{
    INetCfg, INetCfgBindingPath, INetCfgComponent, INetCfgComponentBindings, INetCfgLock,
};
use windows::Win32::System::Com::{
    CLSCTX_INPROC_SERVER, COINIT_APARTMENTTHREADED, CoCreateInstance, CoInitializeEx,
    CoTaskMemFree, CoUninitialize,
};
use windows::core::{GUID, HSTRING, Interface, PWSTR};

use super::win32_code;
use crate::enablement::{
    BindingPath, ComponentId, NetworkConfiguration, NetworkConfigurationStore,
};
use crate::error::{CaptureError, Result};

const CLSID_CNETCFG: GUID = GUID::from_u128(0x5b035261_40f9_11d1_aaec_00805fc1270e);
const EBP_ABOVE: u32 = 1;

fn netcfg_error(what: &str) -> impl FnOnce(windows::core::Error) -> CaptureError + '_ {
    move |e| {
        CaptureError::ConfigError(format!(
            "{} failed with error code {:#x}",
            what,
            win32_code(&e)
        ))
    }
}

/// INetCfg 存储，绑定到创建线程的 COM 套间
pub struct NetCfgStore {
    uninitialize: bool,
}

impl NetCfgStore {
    pub fn new() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            debug!("COM already initialized with another threading model");
            return Ok(Self {
                uninitialize: false,
            });
        }
        hr.ok().map_err(netcfg_error("CoInitializeEx"))?;
        Ok(Self { uninitialize: true })
    }
}

impl Drop for NetCfgStore {
    fn drop(&mut self) {
        if self.uninitialize {
            unsafe { CoUninitialize() };
        }
    }
}

impl NetworkConfigurationStore for NetCfgStore {
    fn begin<'a>(
        &'a self,
        client: &str,
        lock_timeout: Duration,
    ) -> Result<Box<dyn NetworkConfiguration + 'a>> {
        let netcfg: INetCfg = unsafe { CoCreateInstance(&CLSID_CNETCFG, None, CLSCTX_INPROC_SERVER) }
            .map_err(netcfg_error("CoCreateInstance(CNetCfg)"))?;
        let lock: INetCfgLock = netcfg.cast().map_err(netcfg_error("INetCfgLock"))?;

        let mut holder = PWSTR::null();
        let timeout_ms = u32::try_from(lock_timeout.as_millis()).unwrap_or(u32::MAX);
        let hr = unsafe {
            lock.AcquireWriteLock(timeout_ms, &HSTRING::from(client), Some(&mut holder as *mut PWSTR))
        };
        if hr == S_FALSE {
            let held_by = if holder.is_null() {
                String::from("unknown")
            } else {
                let name = unsafe { holder.to_string() }.unwrap_or_default();
                unsafe { CoTaskMemFree(Some(holder.0 as *const _)) };
                name
            };
            return Err(CaptureError::TimeoutError(held_by));
        }
        hr.ok().map_err(netcfg_error("AcquireWriteLock"))?;

        if let Err(e) = unsafe { netcfg.Initialize(None) } {
            let _ = unsafe { lock.ReleaseWriteLock() };
            return Err(netcfg_error("INetCfg::Initialize")(e));
        }

        Ok(Box::new(Transaction {
            netcfg,
            lock,
            components: Vec::new(),
            paths: Vec::new(),
            applied: false,
        }))
    }
}

/// 已初始化并持有写锁的 INetCfg
struct Transaction {
    netcfg: INetCfg,
    lock: INetCfgLock,
    components: Vec<INetCfgComponent>,
    paths: Vec<INetCfgBindingPath>,
    applied: bool,
}

impl NetworkConfiguration for Transaction {
    fn find_component(&mut self, component: &str) -> Result<ComponentId> {
        let mut found: Option<INetCfgComponent> = None;
        unsafe {
            self.netcfg
                .FindComponent(&HSTRING::from(component), Some(&mut found as *mut _))
        }
        .map_err(netcfg_error("FindComponent"))?;

        let found = found.ok_or_else(|| {
            CaptureError::ConfigError(format!("Network component {} is not installed", component))
        })?;
        self.components.push(found);
        Ok(ComponentId(self.components.len() - 1))
    }

    fn binding_paths_above(&mut self, component: ComponentId) -> Result<Vec<BindingPath>> {
        let component = self
            .components
            .get(component.0)
            .ok_or_else(|| CaptureError::ConfigError("Unknown network component".into()))?;
        let bindings: INetCfgComponentBindings = component
            .cast()
            .map_err(netcfg_error("INetCfgComponentBindings"))?;
        let paths = unsafe { bindings.EnumBindingPaths(EBP_ABOVE) }
            .map_err(netcfg_error("EnumBindingPaths"))?;

        let mut ids = Vec::new();
        loop {
            let mut next = [None];
            let mut fetched = 0u32;
            let hr = unsafe { paths.Next(&mut next, Some(&mut fetched as *mut u32)) };
            hr.ok().map_err(netcfg_error("IEnumNetCfgBindingPath::Next"))?;
            if hr == S_FALSE || fetched == 0 {
                break;
            }
            if let [Some(path)] = next {
                self.paths.push(path);
                ids.push(BindingPath(self.paths.len() - 1));
            }
        }
        Ok(ids)
    }

    fn set_binding_enabled(&mut self, path: BindingPath, enabled: bool) -> Result<()> {
        let path = self
            .paths
            .get(path.0)
            .ok_or_else(|| CaptureError::ConfigError("Unknown binding path".into()))?;
        unsafe { path.Enable(BOOL::from(enabled)) }.map_err(netcfg_error("INetCfgBindingPath::Enable"))
    }

    fn apply(&mut self) -> Result<()> {
        unsafe { self.netcfg.Apply() }.map_err(netcfg_error("INetCfg::Apply"))?;
        self.applied = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.paths.clear();
        self.components.clear();
        unsafe {
            if !self.applied {
                if let Err(e) = self.netcfg.Cancel() {
                    warn!("INetCfg::Cancel failed: {}", e);
                }
            }
            if let Err(e) = self.netcfg.Uninitialize() {
                warn!("INetCfg::Uninitialize failed: {}", e);
            }
            if let Err(e) = self.lock.ReleaseWriteLock() {
                warn!("ReleaseWriteLock failed: {}", e);
            }
        }
    }
}
