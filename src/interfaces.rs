use crate::error::Result;
use crate::pcapng::IF_TYPE_ETHERNET;

/// 系统网卡表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub index: u32,
    /// 系统网卡类型（`IF_TYPE_*`）
    pub if_type: u32,
    pub name: String,
    pub description: String,
}

impl InterfaceInfo {
    pub fn is_ethernet(&self) -> bool {
        self.if_type == IF_TYPE_ETHERNET
    }
}

/// 系统网卡表的只读访问
pub trait InterfaceResolver {
    /// 按索引查找单个网卡。
    ///
    /// 网卡已消失时返回错误，解码器会据此丢弃该事件。
    fn resolve(&self, index: u32) -> Result<InterfaceInfo>;

    /// 全部网卡，按索引排序
    fn list(&self) -> Result<Vec<InterfaceInfo>>;
}

impl<T: InterfaceResolver + ?Sized> InterfaceResolver for &T {
    fn resolve(&self, index: u32) -> Result<InterfaceInfo> {
        (**self).resolve(index)
    }

    fn list(&self) -> Result<Vec<InterfaceInfo>> {
        (**self).list()
    }
}

impl<T: InterfaceResolver + ?Sized> InterfaceResolver for Box<T> {
    fn resolve(&self, index: u32) -> Result<InterfaceInfo> {
        (**self).resolve(index)
    }

    fn list(&self) -> Result<Vec<InterfaceInfo>> {
        (**self).list()
    }
}

/// 以太网网卡，每行 `[index] description`
pub fn ethernet_listing(interfaces: &[InterfaceInfo]) -> Vec<String> {
    interfaces
        .iter()
        .filter(|intf| intf.is_ethernet())
        .map(|intf| format!("[{}] {}", intf.index, intf.description))
        .collect()
}
