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

//! NVMe command structures and helpers
//!
//! Wire layouts of submission/completion queue entries and the identify data
//! structures, plus builders for the commands this driver issues.

use bitflags::bitflags;
use core::mem::{offset_of, size_of};
use static_assertions::const_assert_eq;

use super::{
    error::CompletionStatus,
    registers::{identify_cns, opcodes},
};

/// NVMe Submission Queue Entry (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCommand {
    pub cdw0: u32,          // Command Dword 0 (Opcode, Flags, CID)
    pub nsid: u32,          // Namespace Identifier
    pub cdw2: u32,          // Command Dword 2
    pub cdw3: u32,          // Command Dword 3
    pub mptr: u64,          // Metadata Pointer
    pub prp1: u64,          // PRP Entry 1 (Physical Region Page)
    pub prp2: u64,          // PRP Entry 2
    pub cdw10: u32,         // Command Dword 10
    pub cdw11: u32,         // Command Dword 11
    pub cdw12: u32,         // Command Dword 12
    pub cdw13: u32,         // Command Dword 13
    pub cdw14: u32,         // Command Dword 14
    pub cdw15: u32,         // Command Dword 15
}

/// NVMe Completion Queue Entry (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NvmeCompletion {
    pub dw0: u32,           // Command Specific
    pub dw1: u32,           // Reserved
    pub sq_head: u16,       // Submission Queue Head Pointer
    pub sq_id: u16,         // Submission Queue Identifier
    pub cid: u16,           // Command Identifier
    pub status: u16,        // Status Field (Phase bit + Status Code)
}

const_assert_eq!(size_of::<NvmeCommand>(), 64);
const_assert_eq!(size_of::<NvmeCompletion>(), 16);

impl NvmeCommand {
    /// Create a new command with all fields zeroed
    pub const fn new() -> Self {
        Self {
            cdw0: 0, nsid: 0, cdw2: 0, cdw3: 0, mptr: 0,
            prp1: 0, prp2: 0, cdw10: 0, cdw11: 0, cdw12: 0,
            cdw13: 0, cdw14: 0, cdw15: 0,
        }
    }

    /// Get the opcode from CDW0 (bits 0-7)
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    /// Set the opcode in CDW0 (bits 0-7)
    pub fn set_opcode(&mut self, opcode: u8) {
        self.cdw0 = (self.cdw0 & !0xFF) | (opcode as u32);
    }

    /// Fused operation (bits 8-9)
    pub fn set_fuse(&mut self, fuse: u8) {
        self.cdw0 = (self.cdw0 & !(0x3 << 8)) | (((fuse & 0x3) as u32) << 8);
    }

    /// Get the command identifier from CDW0 (bits 16-31)
    pub fn command_id(&self) -> u16 {
        ((self.cdw0 >> 16) & 0xFFFF) as u16
    }

    /// Set the command identifier in CDW0 (bits 16-31)
    pub fn set_command_id(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0x0000FFFF) | ((cid as u32) << 16);
    }
}

impl NvmeCompletion {
    /// Get the phase bit (bit 0 of status field)
    pub fn phase_bit(&self) -> bool {
        (self.status & 1) != 0
    }

    pub fn status(&self) -> CompletionStatus {
        CompletionStatus::from_status_field(self.status)
    }

    /// Check if the command completed successfully
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Check if this completion entry is valid (has expected phase bit)
    pub fn is_valid(&self, expected_phase: bool) -> bool {
        self.phase_bit() == expected_phase
    }
}

bitflags! {
    /// Which optional command dwords of a [`Command`] are meaningful
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CdwValid: u16 {
        const CDW2 = 1 << 0;
        const CDW3 = 1 << 1;
        const CDW10 = 1 << 2;
        const CDW11 = 1 << 3;
        const CDW12 = 1 << 4;
        const CDW13 = 1 << 5;
        const CDW14 = 1 << 6;
        const CDW15 = 1 << 7;
    }
}

/// Caller-facing command, copied into a submission entry by the pass-through
/// layer. Dwords are only copied when their [`CdwValid`] flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    /// Fused operation (0 = normal)
    pub fuse: u8,
    /// PRP or SGL selector; only 0 (PRP) is supported
    pub psdt: u8,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    pub valid: CdwValid,
}

impl Command {
    pub fn new(opcode: u8, nsid: u32) -> Self {
        Self { opcode, nsid, ..Self::default() }
    }

    pub fn with_cdw10(mut self, value: u32) -> Self {
        self.cdw10 = value;
        self.valid |= CdwValid::CDW10;
        self
    }

    pub fn with_cdw11(mut self, value: u32) -> Self {
        self.cdw11 = value;
        self.valid |= CdwValid::CDW11;
        self
    }

    pub fn with_cdw12(mut self, value: u32) -> Self {
        self.cdw12 = value;
        self.valid |= CdwValid::CDW12;
        self
    }

    pub fn with_cdw13(mut self, value: u32) -> Self {
        self.cdw13 = value;
        self.valid |= CdwValid::CDW13;
        self
    }

    /// Whether the device moves data for this opcode (bit 0: host to
    /// device, bit 1: device to host)
    pub fn transfers_data(&self) -> bool {
        self.opcode & 0x3 != 0
    }

    /// Whether the device reads host memory for this opcode
    pub fn is_host_to_device(&self) -> bool {
        self.opcode & 0x1 != 0
    }

    /// Create an IDENTIFY Controller command
    pub fn identify_controller() -> Self {
        Self::new(opcodes::ADMIN_IDENTIFY, 0).with_cdw10(identify_cns::CONTROLLER)
    }

    /// Create an IDENTIFY Namespace command
    pub fn identify_namespace(nsid: u32) -> Self {
        Self::new(opcodes::ADMIN_IDENTIFY, nsid).with_cdw10(identify_cns::NAMESPACE)
    }

    /// Create a CREATE I/O Completion Queue command (physically contiguous,
    /// interrupts disabled)
    pub fn create_io_cq(queue_id: u16, entries: u16) -> Self {
        Self::new(opcodes::ADMIN_CREATE_IO_CQ, 0)
            .with_cdw10(((entries - 1) as u32) << 16 | (queue_id as u32))   // QSIZE | QID
            .with_cdw11(1)                                                   // PC = 1
    }

    /// Create a CREATE I/O Submission Queue command
    pub fn create_io_sq(queue_id: u16, cq_id: u16, entries: u16) -> Self {
        Self::new(opcodes::ADMIN_CREATE_IO_SQ, 0)
            .with_cdw10(((entries - 1) as u32) << 16 | (queue_id as u32))   // QSIZE | QID
            .with_cdw11((cq_id as u32) << 16 | 1)                            // CQID | PC = 1
    }

    /// Create a READ command; `blocks` is 1-based
    pub fn read(nsid: u32, lba: u64, blocks: u32) -> Self {
        Self::new(opcodes::NVM_READ, nsid)
            .with_cdw10(lba as u32)                     // SLBA (lower 32 bits)
            .with_cdw11((lba >> 32) as u32)             // SLBA (upper 32 bits)
            .with_cdw12((blocks - 1) & 0xFFFF)          // NLB (0-based)
    }

    /// Create a WRITE command with Force Unit Access set
    pub fn write(nsid: u32, lba: u64, blocks: u32) -> Self {
        Self::new(opcodes::NVM_WRITE, nsid)
            .with_cdw10(lba as u32)
            .with_cdw11((lba >> 32) as u32)
            .with_cdw12(((blocks - 1) & 0xFFFF) | NVM_FUA)
    }

    pub fn flush(nsid: u32) -> Self {
        Self::new(opcodes::NVM_FLUSH, nsid)
    }

    /// SECURITY SEND / RECEIVE. The protocol specific field is placed in
    /// big-endian byte order.
    pub fn security(send: bool, nsid: u32, protocol_id: u8, protocol_specific: u16, length: u32) -> Self {
        let opcode = if send { opcodes::ADMIN_SECURITY_SEND } else { opcodes::ADMIN_SECURITY_RECEIVE };
        Self::new(opcode, nsid)
            .with_cdw10(((protocol_id as u32) << 24) | ((protocol_specific.swap_bytes() as u32) << 8))
            .with_cdw11(length)
    }
}

/// Force Unit Access (CDW12 bit 30 of Read/Write)
pub const NVM_FUA: u32 = 1 << 30;

/// Controller Identify Data Structure (4096 bytes)
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct IdentifyController {
    pub vid: u16,           // PCI Vendor ID
    pub ssvid: u16,         // PCI Subsystem Vendor ID
    pub sn: [u8; 20],       // Serial Number
    pub mn: [u8; 40],       // Model Number
    pub fr: [u8; 8],        // Firmware Revision
    pub rab: u8,            // Recommended Arbitration Burst
    pub ieee: [u8; 3],      // IEEE OUI Identifier
    pub cmic: u8,           // Controller Multi-Path I/O and Namespace Sharing
    pub mdts: u8,           // Maximum Data Transfer Size
    pub cntlid: u16,        // Controller ID
    pub ver: u32,           // Version
    pub rtd3r: u32,         // RTD3 Resume Latency
    pub rtd3e: u32,         // RTD3 Entry Latency
    pub oaes: u32,          // Optional Asynchronous Events Supported
    pub ctratt: u32,        // Controller Attributes
    pub rrls: u16,          // Read Recovery Levels Supported
    pub _reserved1: [u8; 9],
    pub cntrltype: u8,      // Controller Type
    pub fguid: [u8; 16],    // FRU Globally Unique Identifier
    pub crdt: [u16; 3],     // Command Retry Delay Times
    pub _reserved2: [u8; 122],

    // Admin Command Set Attributes & Optional Controller Capabilities (256-511)
    pub oacs: u16,          // Optional Admin Command Support
    pub acl: u8,            // Abort Command Limit
    pub aerl: u8,           // Asynchronous Event Request Limit
    pub frmw: u8,           // Firmware Updates
    pub lpa: u8,            // Log Page Attributes
    pub elpe: u8,           // Error Log Page Entries
    pub npss: u8,           // Number of Power States Support
    pub avscc: u8,          // Admin Vendor Specific Command Configuration
    pub apsta: u8,          // Autonomous Power State Transition Attributes
    pub wctemp: u16,        // Warning Composite Temperature Threshold
    pub cctemp: u16,        // Critical Composite Temperature Threshold
    pub _reserved3: [u8; 242],

    // NVM Command Set Attributes (512-703)
    pub sqes: u8,           // Submission Queue Entry Size
    pub cqes: u8,           // Completion Queue Entry Size
    pub maxcmd: u16,        // Maximum Outstanding Commands
    pub nn: u32,            // Number of Namespaces
    pub oncs: u16,          // Optional NVM Command Support
    pub fuses: u16,         // Fused Operation Support
    pub fna: u8,            // Format NVM Attributes
    pub vwc: u8,            // Volatile Write Cache
    pub awun: u16,          // Atomic Write Unit Normal
    pub awupf: u16,         // Atomic Write Unit Power Fail
    pub nvscc: u8,          // NVM Vendor Specific Command Configuration
    pub nwpc: u8,           // Namespace Write Protection Capabilities
    pub acwu: u16,          // Atomic Compare & Write Unit
    pub _reserved4: [u8; 2],
    pub sgls: u32,          // SGL Support
    pub mnan: u32,          // Maximum Number of Allowed Namespaces
    pub _reserved5: [u8; 224],

    // I/O Command Set Independent Attributes (768-2047)
    pub subnqn: [u8; 256],  // NVM Subsystem NVMe Qualified Name
    pub _reserved6: [u8; 1024],

    // Power State Descriptors (2048-3071)
    pub psd: [u8; 1024],

    // Vendor Specific (3072-4095)
    pub vs: [u8; 1024],
}

const_assert_eq!(size_of::<IdentifyController>(), 4096);
const_assert_eq!(offset_of!(IdentifyController, mdts), 77);
const_assert_eq!(offset_of!(IdentifyController, oacs), 256);
const_assert_eq!(offset_of!(IdentifyController, nn), 516);
const_assert_eq!(offset_of!(IdentifyController, sgls), 536);
const_assert_eq!(offset_of!(IdentifyController, psd), 2048);

fn ascii_field(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes)
        .unwrap_or("Unknown")
        .trim_end_matches('\0')
        .trim()
}

impl IdentifyController {
    pub fn serial_number(&self) -> &str {
        ascii_field(&self.sn)
    }

    pub fn model_number(&self) -> &str {
        ascii_field(&self.mn)
    }

    pub fn firmware_revision(&self) -> &str {
        ascii_field(&self.fr)
    }
}

/// Namespace Identify Data Structure (4096 bytes)
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct IdentifyNamespace {
    pub nsze: u64,          // Namespace Size
    pub ncap: u64,          // Namespace Capacity
    pub nuse: u64,          // Namespace Utilization
    pub nsfeat: u8,         // Namespace Features
    pub nlbaf: u8,          // Number of LBA Formats
    pub flbas: u8,          // Formatted LBA Size
    pub mc: u8,             // Metadata Capabilities
    pub dpc: u8,            // End-to-end Data Protection Capabilities
    pub dps: u8,            // End-to-end Data Protection Type Settings
    pub nmic: u8,           // Namespace Multi-path I/O and Namespace Sharing
    pub rescap: u8,         // Reservation Capabilities
    pub fpi: u8,            // Format Progress Indicator
    pub dlfeat: u8,         // Deallocate Logical Block Features
    pub nawun: u16,         // Namespace Atomic Write Unit Normal
    pub nawupf: u16,        // Namespace Atomic Write Unit Power Fail
    pub nacwu: u16,         // Namespace Atomic Compare & Write Unit
    pub nabsn: u16,         // Namespace Atomic Boundary Size Normal
    pub nabo: u16,          // Namespace Atomic Boundary Offset
    pub nabspf: u16,        // Namespace Atomic Boundary Size Power Fail
    pub noiob: u16,         // Namespace Optimal I/O Boundary
    pub nvmcap: [u8; 16],   // NVM Capacity
    pub _reserved1: [u8; 40],
    pub nguid: [u8; 16],    // Namespace Globally Unique Identifier
    pub eui64: [u8; 8],     // IEEE Extended Unique Identifier

    // LBA Format Support (128-191)
    pub lbaf: [LbaFormat; 16],

    // Reserved (192-383)
    pub _reserved2: [u8; 192],

    // Vendor Specific (384-4095)
    pub vs: [u8; 3712],
}

/// LBA Format Data Structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LbaFormat {
    pub ms: u16,            // Metadata Size
    pub lbads: u8,          // LBA Data Size (2^n bytes)
    pub rp: u8,             // Relative Performance
}

const_assert_eq!(size_of::<IdentifyNamespace>(), 4096);
const_assert_eq!(offset_of!(IdentifyNamespace, nguid), 104);
const_assert_eq!(offset_of!(IdentifyNamespace, eui64), 120);
const_assert_eq!(offset_of!(IdentifyNamespace, lbaf), 128);

impl IdentifyNamespace {
    /// LBA format currently selected by FLBAS
    pub fn current_format(&self) -> LbaFormat {
        self.lbaf[(self.flbas & 0x0F) as usize]
    }

    /// Get the LBA size in bytes for the current format
    pub fn lba_size(&self) -> u32 {
        1 << self.current_format().lbads
    }

    pub fn eui64(&self) -> u64 {
        u64::from_le_bytes(self.eui64)
    }

    /// Get the namespace size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.nsze * self.lba_size() as u64
    }
}

/// Zero-filled identify buffer on the heap; these structures are plain data
/// for which all-zero is a valid value.
pub(crate) fn zeroed_box<T: Copy>() -> alloc::boxed::Box<T> {
    let boxed = alloc::boxed::Box::<T>::new_zeroed();
    // SAFETY: only instantiated with the identify structures above, which
    // consist of integers and byte arrays
    unsafe { boxed.assume_init() }
}

/// Raw bytes of an identify structure, as transferred by the device
pub(crate) fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // SAFETY: plain data, see `zeroed_box`
    unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

pub(crate) fn as_bytes_mut<T: Copy>(value: &mut T) -> &mut [u8] {
    // SAFETY: plain data for which every byte pattern is valid
    unsafe { core::slice::from_raw_parts_mut(value as *mut T as *mut u8, size_of::<T>()) }
}
