use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CaptureError, Result};
use crate::interfaces::InterfaceResolver;
use crate::pcapng::PcapNgWriter;

/// `Microsoft-Windows-NDIS-PacketCapture`
pub const NDIS_PACKET_CAPTURE: Uuid = Uuid::from_u128(0x2ED6006E_4729_4609_B423_3EE7BCD678EF);

/// 数据包分片事件，版本 0，键为 `(version << 16) | id`
pub const PACKET_FRAGMENT: u32 = 1001;

/// 1601-01-01 到 1970-01-01 的微秒数
const FILETIME_UNIX_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// 跟踪会话投递的单个事件
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent<'a> {
    pub provider_id: Uuid,
    pub event_id: u16,
    pub version: u8,
    /// 自 1601-01-01 起的 100ns 计数
    pub timestamp: i64,
    pub payload: &'a [u8],
}

impl TraceEvent<'_> {
    fn key(&self) -> u32 {
        ((self.version as u32) << 16) | self.event_id as u32
    }
}

/// 接收 [`CaptureSession::process`](crate::session::CaptureSession::process) 投递的事件。
///
/// 返回错误会结束消费循环。
pub trait EventSink {
    fn on_event(&mut self, event: &TraceEvent<'_>) -> Result<()>;
}

/// 把自 1601 年起的 100ns 计数转换为 Unix 纪元微秒
pub fn filetime_to_unix_micros(ticks: i64) -> u64 {
    let micros = ticks / 10 - FILETIME_UNIX_OFFSET_MICROS;
    u64::try_from(micros).unwrap_or(0)
}

pub fn unix_micros_to_datetime(micros: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(i64::try_from(micros).ok()?)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets: u64,
    /// 因网卡无法解析而丢弃的数据包事件
    pub dropped: u64,
    /// 其他提供程序或其他 id 的事件
    pub ignored: u64,
}

struct Fragment<'a> {
    miniport_index: u32,
    data: &'a [u8],
}

fn read_u32(data: &mut &[u8]) -> Result<u32> {
    let (head, rest) = data
        .split_first_chunk::<4>()
        .ok_or_else(|| CaptureError::ProtocolError("truncated fragment header".to_string()))?;
    *data = rest;
    Ok(u32::from_le_bytes(*head))
}

fn parse_fragment(mut payload: &[u8]) -> Result<Fragment<'_>> {
    let miniport_index = read_u32(&mut payload)?;
    let _lower_index = read_u32(&mut payload)?;
    let size = read_u32(&mut payload)? as usize;

    if payload.len() < size {
        return Err(CaptureError::ProtocolError(format!(
            "fragment declares {} bytes but only {} remain",
            size,
            payload.len()
        )));
    }

    Ok(Fragment {
        miniport_index,
        data: &payload[..size],
    })
}

/// 把数据包分片事件转换为 pcapng 块
pub struct EventDecoder<W: Write, R: InterfaceResolver> {
    writer: PcapNgWriter<W>,
    resolver: R,
    snaplen: u32,
    // 系统网卡索引 -> pcapng 接口 id
    interfaces: HashMap<u32, u32>,
    stats: DecoderStats,
}

impl<W: Write, R: InterfaceResolver> EventDecoder<W, R> {
    pub fn new(writer: PcapNgWriter<W>, resolver: R, snaplen: u32) -> Self {
        Self {
            writer,
            resolver,
            snaplen,
            interfaces: HashMap::new(),
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn interface_count(&self) -> usize {
        self.writer.interface_count()
    }

    /// 刷新捕获文件，返回底层写入目标和本次计数
    pub fn finish(self) -> Result<(W, DecoderStats)> {
        let stats = self.stats;
        Ok((self.writer.finish()?, stats))
    }

    /// `os_index` 对应的 pcapng id，首次出现时登记接口。
    /// `None` 表示网卡无法解析。
    fn interface_id(&mut self, os_index: u32) -> Result<Option<u32>> {
        if let Some(&id) = self.interfaces.get(&os_index) {
            return Ok(Some(id));
        }

        let info = match self.resolver.resolve(os_index) {
            Ok(info) => info,
            Err(e) => {
                warn!("Dropping packet from interface {}: {}", os_index, e);
                return Ok(None);
            }
        };

        let id = self.writer.add_interface(
            info.if_type,
            &info.name,
            &info.description,
            self.snaplen,
        )?;
        info!(
            "Interface {} ({}) recorded as #{}",
            os_index, info.description, id
        );
        self.interfaces.insert(os_index, id);
        Ok(Some(id))
    }
}

impl<W: Write, R: InterfaceResolver> EventSink for EventDecoder<W, R> {
    fn on_event(&mut self, event: &TraceEvent<'_>) -> Result<()> {
        if event.provider_id != NDIS_PACKET_CAPTURE || event.key() != PACKET_FRAGMENT {
            self.stats.ignored += 1;
            return Ok(());
        }

        let fragment = parse_fragment(event.payload)?;
        let Some(interface_id) = self.interface_id(fragment.miniport_index)? else {
            self.stats.dropped += 1;
            return Ok(());
        };

        let timestamp = filetime_to_unix_micros(event.timestamp);
        let captured = &fragment.data[..fragment.data.len().min(self.snaplen as usize)];
        self.writer.add_packet(
            interface_id,
            timestamp,
            captured,
            fragment.data.len() as u32,
        )?;

        self.stats.packets += 1;
        if self.stats.packets == 1 {
            if let Some(at) = unix_micros_to_datetime(timestamp) {
                info!("First packet captured at {}", at.to_rfc3339());
            }
        } else if self.stats.packets % 1000 == 0 {
            debug!("Captured {} packets", self.stats.packets);
        }

        Ok(())
    }
}
