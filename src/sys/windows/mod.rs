//! 网卡表、服务控制、注册表计数器、INetCfg、ETW 与控制台中断的 Windows 实现。

mod console;
mod etw;
mod iphlp;
mod netcfg;
mod registry;
mod scm;

pub use console::ConsoleInterrupt;
pub use etw::EtwBackend;
pub use iphlp::IfTable;
pub use netcfg::NetCfgStore;
pub use registry::RegistryCounter;
pub use scm::ServiceControl;

/// `windows::core::Error` 对应的 Win32 错误码；不是 Win32 错误时返回原始 HRESULT。
pub(crate) fn win32_code(e: &windows::core::Error) -> u32 {
    let hr = e.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}
