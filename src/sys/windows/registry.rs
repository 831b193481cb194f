use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, WIN32_ERROR};
use windows::Win32::System::Registry::{
    HKEY, HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_SET_VALUE, REG_DWORD, REG_VALUE_TYPE,
    RegCloseKey, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
};
use windows::core::HSTRING;

use crate::enablement::CounterStore;
use crate::error::{CaptureError, Result};

const NDISCAP_PARAMETERS: &str = r"SYSTEM\CurrentControlSet\Services\NdisCap\Parameters";
const REFCOUNT_VALUE: &str = "RefCount";

/// A `REG_DWORD` under `HKEY_LOCAL_MACHINE`.
pub struct RegistryCounter {
    key: HSTRING,
    value: HSTRING,
}

struct KeyHandle(HKEY);

impl Drop for KeyHandle {
    fn drop(&mut self) {
        let _ = unsafe { RegCloseKey(self.0) };
    }
}

fn registry_error(what: &str, err: WIN32_ERROR) -> CaptureError {
    CaptureError::ConfigError(format!("{} failed with error code {}", what, err.0))
}

impl RegistryCounter {
    /// 捕获驱动的引用计数
    pub fn ndiscap() -> Self {
        Self {
            key: HSTRING::from(NDISCAP_PARAMETERS),
            value: HSTRING::from(REFCOUNT_VALUE),
        }
    }

    fn open(&self) -> Result<KeyHandle> {
        let mut key = HKEY::default();
        let err = unsafe {
            RegOpenKeyExW(
                HKEY_LOCAL_MACHINE,
                &self.key,
                0,
                KEY_QUERY_VALUE | KEY_SET_VALUE,
                &mut key,
            )
        };
        if err != ERROR_SUCCESS {
            return Err(registry_error("RegOpenKeyEx", err));
        }
        Ok(KeyHandle(key))
    }
}

impl CounterStore for RegistryCounter {
    fn load(&self) -> Result<u32> {
        let key = self.open()?;
        let mut kind = REG_VALUE_TYPE::default();
        let mut data = 0u32;
        let mut size = std::mem::size_of::<u32>() as u32;
        let err = unsafe {
            RegQueryValueExW(
                key.0,
                &self.value,
                None,
                Some(&mut kind as *mut REG_VALUE_TYPE),
                Some(&mut data as *mut u32 as *mut u8),
                Some(&mut size as *mut u32),
            )
        };

        if err == ERROR_FILE_NOT_FOUND {
            return Ok(0);
        }
        if err != ERROR_SUCCESS {
            return Err(registry_error("RegQueryValueEx", err));
        }
        if kind != REG_DWORD {
            return Err(CaptureError::ConfigError(format!(
                "{} is not a REG_DWORD",
                REFCOUNT_VALUE
            )));
        }
        Ok(data)
    }

    fn store(&self, value: u32) -> Result<()> {
        let key = self.open()?;
        let err = unsafe {
            RegSetValueExW(key.0, &self.value, 0, REG_DWORD, Some(&value.to_le_bytes()))
        };
        if err != ERROR_SUCCESS {
            return Err(registry_error("RegSetValueEx", err));
        }
        Ok(())
    }
}
