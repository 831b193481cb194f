use std::io;

use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR, TRUE};
use windows::Win32::NetworkManagement::IpHelper::{GetIfEntry, GetIfTable, MIB_IFROW, MIB_IFTABLE};

use crate::error::{CaptureError, Result};
use crate::interfaces::{InterfaceInfo, InterfaceResolver};

/// IP Helper 网卡表
pub struct IfTable;

fn row_info(row: &MIB_IFROW) -> InterfaceInfo {
    let name_len = row
        .wszName
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(row.wszName.len());
    let descr = &row.bDescr[..(row.dwDescrLen as usize).min(row.bDescr.len())];
    let descr = descr.split(|&b| b == 0).next().unwrap_or_default();

    InterfaceInfo {
        index: row.dwIndex,
        if_type: row.dwType,
        name: String::from_utf16_lossy(&row.wszName[..name_len]),
        description: String::from_utf8_lossy(descr).into_owned(),
    }
}

impl InterfaceResolver for IfTable {
    fn resolve(&self, index: u32) -> Result<InterfaceInfo> {
        let mut row = MIB_IFROW {
            dwIndex: index,
            ..Default::default()
        };
        let err = unsafe { GetIfEntry(&mut row) };
        if err != NO_ERROR.0 {
            return Err(CaptureError::InterfaceError { index, code: err });
        }
        Ok(row_info(&row))
    }

    fn list(&self) -> Result<Vec<InterfaceInfo>> {
        let mut size = 0u32;
        let err = unsafe { GetIfTable(None, &mut size, TRUE) };
        if err != ERROR_INSUFFICIENT_BUFFER.0 {
            return Err(io::Error::from_raw_os_error(err as i32).into());
        }

        // 用 u64 缓冲区保证对齐
        let mut buf = vec![0u64; (size as usize).div_ceil(8)];
        let table = buf.as_mut_ptr() as *mut MIB_IFTABLE;
        let err = unsafe { GetIfTable(Some(table), &mut size, TRUE) };
        if err != NO_ERROR.0 {
            return Err(io::Error::from_raw_os_error(err as i32).into());
        }

        let rows = unsafe {
            std::slice::from_raw_parts((*table).table.as_ptr(), (*table).dwNumEntries as usize)
        };
        Ok(rows.iter().map(row_info).collect())
    }
}
