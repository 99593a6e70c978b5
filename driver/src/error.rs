/*
Copyright © 2025 Mako and JayAndJef

This file is part of nvmeboot.

nvmeboot is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

nvmeboot is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with nvmeboot. If not, see
<https://www.gnu.org/licenses/>.
*/

//! Driver error taxonomy and completion status decoding.

use core::fmt;

/// NVMe driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// Malformed caller input, rejected before touching the hardware
    InvalidParameter,
    /// DMA allocation or mapping failed
    OutOfResources,
    /// Async submission queue is full, retry later
    NotReady,
    /// Feature the driver does not implement (SGL transfers)
    Unsupported,
    /// CAP.CSS does not advertise the NVM command set
    UnsupportedCommandSet,
    /// Transfer exceeds MDTS; carries the largest length the controller accepts
    BufferTooSmall { max_transfer: u32 },
    /// Request length is not a multiple of the block size
    BadBufferSize,
    /// CSTS.RDY did not clear after CC.EN was cleared
    DeviceBusyTimeout,
    /// CSTS.RDY did not set after CC.EN was set
    EnableTimeout,
    /// Command did not complete within its timeout
    Timeout,
    /// Controller posted a non-success completion
    DeviceError(CompletionStatus),
    /// Identify Controller failed during bring-up
    IdentifyFailed,
    /// Namespace or device index enumeration exhausted
    NotFound,
    /// No controller is attached
    DeviceNotReady,
    /// Namespace has no media
    NoMedia,
}

impl fmt::Display for NvmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeError::InvalidParameter => f.write_str("invalid parameter"),
            NvmeError::OutOfResources => f.write_str("out of DMA resources"),
            NvmeError::NotReady => f.write_str("submission queue full"),
            NvmeError::Unsupported => f.write_str("unsupported request"),
            NvmeError::UnsupportedCommandSet => {
                f.write_str("controller does not support the NVM command set")
            }
            NvmeError::BufferTooSmall { max_transfer } => {
                write!(f, "transfer too large, controller limit is {max_transfer} bytes")
            }
            NvmeError::BadBufferSize => f.write_str("buffer size is not a multiple of the block size"),
            NvmeError::DeviceBusyTimeout => f.write_str("timed out waiting for controller disable"),
            NvmeError::EnableTimeout => f.write_str("timed out waiting for controller enable"),
            NvmeError::Timeout => f.write_str("command timed out"),
            NvmeError::DeviceError(status) => write!(f, "device error: {status}"),
            NvmeError::IdentifyFailed => f.write_str("identify controller failed"),
            NvmeError::NotFound => f.write_str("not found"),
            NvmeError::DeviceNotReady => f.write_str("no controller attached"),
            NvmeError::NoMedia => f.write_str("no media"),
        }
    }
}

/// Status code types (CQE DW3 bits 27:25)
pub mod status_type {
    pub const GENERIC: u8 = 0x0;
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    pub const MEDIA_ERROR: u8 = 0x2;
    pub const PATH_ERROR: u8 = 0x3;
    pub const VENDOR_SPECIFIC: u8 = 0x7;
}

/// Generic command status codes used by the driver and the software controller
pub mod generic_status {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const DATA_TRANSFER_ERROR: u8 = 0x04;
    pub const INTERNAL_ERROR: u8 = 0x06;
    pub const INVALID_NAMESPACE: u8 = 0x0B;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
    pub const CAPACITY_EXCEEDED: u8 = 0x81;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
}

/// Decoded status field of a completion queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionStatus {
    pub sct: u8,
    pub sc: u8,
    pub more: bool,
    pub dnr: bool,
}

impl CompletionStatus {
    /// Decode the upper half of CQE DW3 (phase bit at bit 0)
    pub fn from_status_field(status: u16) -> Self {
        Self {
            sc: ((status >> 1) & 0xFF) as u8,
            sct: ((status >> 9) & 0x7) as u8,
            more: status & (1 << 14) != 0,
            dnr: status & (1 << 15) != 0,
        }
    }

    /// Encode into the CQE status field with the given phase bit
    pub fn to_status_field(self, phase: bool) -> u16 {
        (phase as u16)
            | ((self.sc as u16) << 1)
            | (((self.sct & 0x7) as u16) << 9)
            | ((self.more as u16) << 14)
            | ((self.dnr as u16) << 15)
    }

    pub const fn generic(sc: u8) -> Self {
        Self { sct: status_type::GENERIC, sc, more: false, dnr: false }
    }

    pub fn is_success(&self) -> bool {
        self.sct == status_type::GENERIC && self.sc == generic_status::SUCCESS
    }

    fn reason(&self) -> &'static str {
        match self.sct {
            status_type::GENERIC => match self.sc {
                0x00 => "successful completion",
                0x01 => "invalid command opcode",
                0x02 => "invalid field in command",
                0x03 => "command id conflict",
                0x04 => "data transfer error",
                0x05 => "commands aborted due to power loss notification",
                0x06 => "internal error",
                0x07 => "command abort requested",
                0x08 => "command aborted due to SQ deletion",
                0x09 => "command aborted due to failed fused command",
                0x0A => "command aborted due to missing fused command",
                0x0B => "invalid namespace or format",
                0x0C => "command sequence error",
                0x0D => "invalid SGL last segment descriptor",
                0x0E => "invalid number of SGL descriptors",
                0x0F => "data SGL length invalid",
                0x10 => "metadata SGL length invalid",
                0x11 => "SGL descriptor type invalid",
                0x80 => "LBA out of range",
                0x81 => "capacity exceeded",
                0x82 => "namespace not ready",
                0x83 => "reservation conflict",
                _ => "reserved generic status",
            },
            status_type::COMMAND_SPECIFIC => match self.sc {
                0x00 => "completion queue invalid",
                0x01 => "invalid queue identifier",
                0x02 => "maximum queue size exceeded",
                0x03 => "abort command limit exceeded",
                0x05 => "asynchronous event request limit exceeded",
                0x06 => "invalid firmware slot",
                0x07 => "invalid firmware image",
                0x08 => "invalid interrupt vector",
                0x09 => "invalid log page",
                0x0A => "invalid format",
                0x0B => "firmware application requires conventional reset",
                0x0C => "invalid queue deletion",
                0x80 => "conflicting attributes",
                0x81 => "invalid protection information",
                0x82 => "attempted write to read only range",
                _ => "reserved command specific status",
            },
            status_type::MEDIA_ERROR => match self.sc {
                0x80 => "write fault",
                0x81 => "unrecovered read error",
                0x82 => "end-to-end guard check error",
                0x83 => "end-to-end application tag check error",
                0x84 => "end-to-end reference tag check error",
                0x85 => "compare failure",
                0x86 => "access denied",
                _ => "reserved media error",
            },
            status_type::PATH_ERROR => "path related status",
            status_type::VENDOR_SPECIFIC => "vendor specific status",
            _ => "reserved status code type",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (SCT={:#x}, SC={:#04x}{}{})",
            self.reason(),
            self.sct,
            self.sc,
            if self.more { ", more" } else { "" },
            if self.dnr { ", do not retry" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn status_field_decodes_sct_and_sc() {
        // SC=0x80 (LBA out of range), SCT=0, DNR set, phase set
        let raw: u16 = 1 | (0x80 << 1) | (1 << 15);
        let status = CompletionStatus::from_status_field(raw);
        assert_eq!(status.sc, 0x80);
        assert_eq!(status.sct, status_type::GENERIC);
        assert!(status.dnr);
        assert!(!status.is_success());
        assert_eq!(status.to_status_field(true), raw);
    }

    #[test]
    fn status_dump_is_readable() {
        let status = CompletionStatus { sct: status_type::MEDIA_ERROR, sc: 0x81, more: false, dnr: true };
        let text = format!("{}", NvmeError::DeviceError(status));
        assert!(text.contains("unrecovered read error"));
        assert!(text.contains("do not retry"));
    }
}
