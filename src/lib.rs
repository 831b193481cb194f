//! 从 `Microsoft-Windows-NDIS-PacketCapture` ETW 提供程序实时捕获数据包并保存为 pcapng 文件。

pub mod cancel;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod enablement;
pub mod error;
pub mod interfaces;
pub mod pcapng;
pub mod service;
pub mod session;
pub mod sys;

pub use capture::{CaptureSummary, Capturer, Platform, native_interfaces};
pub use config::{CaptureOptions, DEFAULT_SNAPLEN, effective_snaplen};
pub use error::{CaptureError, Result};
pub use interfaces::{InterfaceInfo, InterfaceResolver, ethernet_listing};
pub use pcapng::PcapNgWriter;
