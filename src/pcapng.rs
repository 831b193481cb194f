//! 只追加的 pcapng 编码器。
//!
//! 每个块的布局为 `[type][total length][body][total length]`，小端序并按 4 字节对齐。
//! 读取方可以双向遍历文件，被截断的文件在最后一个完整块之前仍然可读。

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;
use pcap_file::DataLink;

use crate::error::{CaptureError, Result};

const SECTION_HEADER_BLOCK: u32 = 0x0A0D_0D0A;
const INTERFACE_DESCRIPTION_BLOCK: u32 = 0x0000_0001;
const ENHANCED_PACKET_BLOCK: u32 = 0x0000_0006;

const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;
const SECTION_LENGTH_UNKNOWN: i64 = -1;

const OPT_ENDOFOPT: u16 = 0;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_DESCRIPTION: u16 = 3;

/// 系统网卡表中的 `IF_TYPE_ETHERNET_CSMACD`
pub const IF_TYPE_ETHERNET: u32 = 6;
/// 系统网卡表中的 `IF_TYPE_IEEE80211`
pub const IF_TYPE_IEEE80211: u32 = 71;

/// 把系统网卡类型映射为 pcapng 链路类型
pub fn link_type_for(os_type: u32) -> u16 {
    let link = match os_type {
        IF_TYPE_ETHERNET => DataLink::ETHERNET,
        IF_TYPE_IEEE80211 => DataLink::IEEE802_11,
        other => return other as u16,
    };
    u32::from(link) as u16
}

pub struct PcapNgWriter<W: Write> {
    inner: W,
    block: Vec<u8>,
    // 按接口 id 索引
    snaplens: Vec<u32>,
}

impl PcapNgWriter<BufWriter<File>> {
    /// 以追加方式打开 `path`（不存在则创建），并开始新的 section。
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        debug!("Opened capture file {}", path.as_ref().display());
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PcapNgWriter<W> {
    /// 包装 `inner` 并写入 section header block
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Self {
            inner,
            block: Vec::with_capacity(4096),
            snaplens: Vec::new(),
        };

        writer.begin_block(SECTION_HEADER_BLOCK);
        writer.put_u32(BYTE_ORDER_MAGIC);
        writer.put_u16(VERSION_MAJOR);
        writer.put_u16(VERSION_MINOR);
        writer.put_bytes(&SECTION_LENGTH_UNKNOWN.to_le_bytes());
        writer.end_block()?;

        Ok(writer)
    }

    /// 写入 interface description block 并返回其 id。
    ///
    /// `os_type` 为系统报告的网卡类型，经 [`link_type_for`] 转换。id 从 0 开始，按调用顺序递增。
    pub fn add_interface(
        &mut self,
        os_type: u32,
        name: &str,
        description: &str,
        snaplen: u32,
    ) -> Result<u32> {
        let id = self.snaplens.len() as u32;

        self.begin_block(INTERFACE_DESCRIPTION_BLOCK);
        self.put_u16(link_type_for(os_type));
        self.put_u16(0);
        self.put_u32(snaplen);
        self.put_option(OPT_IF_NAME, name.as_bytes());
        self.put_option(OPT_IF_DESCRIPTION, description.as_bytes());
        self.put_option(OPT_ENDOFOPT, &[]);
        self.end_block()?;

        self.snaplens.push(snaplen);
        Ok(id)
    }

    /// 写入 enhanced packet block。
    ///
    /// `data` 最多保存接口 snaplen 个字节；`original_len` 原样记录。
    pub fn add_packet(
        &mut self,
        interface_id: u32,
        timestamp_micros: u64,
        data: &[u8],
        original_len: u32,
    ) -> Result<()> {
        let snaplen = *self
            .snaplens
            .get(interface_id as usize)
            .ok_or(CaptureError::UnknownInterface(interface_id))?;
        let captured = &data[..data.len().min(snaplen as usize)];

        self.begin_block(ENHANCED_PACKET_BLOCK);
        self.put_u32(interface_id);
        self.put_u32((timestamp_micros >> 32) as u32);
        self.put_u32(timestamp_micros as u32);
        self.put_u32(captured.len() as u32);
        self.put_u32(original_len);
        self.put_bytes(captured);
        self.pad();
        self.put_option(OPT_ENDOFOPT, &[]);
        self.end_block()
    }

    pub fn interface_count(&self) -> usize {
        self.snaplens.len()
    }

    /// 刷新缓冲的块并返回底层写入目标
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn begin_block(&mut self, block_type: u32) {
        self.block.clear();
        self.put_u32(block_type);
        // 在 end_block 中回填
        self.put_u32(0);
    }

    fn end_block(&mut self) -> Result<()> {
        let total = (self.block.len() + 4) as u32;
        self.put_u32(total);
        self.block[4..8].copy_from_slice(&total.to_le_bytes());

        // write_all 会处理短写并重试 EINTR
        self.inner.write_all(&self.block)?;
        Ok(())
    }

    fn put_option(&mut self, code: u16, value: &[u8]) {
        self.put_u16(code);
        self.put_u16(value.len() as u16);
        self.put_bytes(value);
        self.pad();
    }

    fn pad(&mut self) {
        let aligned = (self.block.len() + 3) & !3;
        self.block.resize(aligned, 0);
    }

    fn put_u16(&mut self, value: u16) {
        self.block.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.block.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.block.extend_from_slice(bytes);
    }
}
