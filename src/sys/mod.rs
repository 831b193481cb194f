//! 捕获所需的系统绑定

#[cfg(windows)]
pub mod windows;
