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

//! NVMe controller register definitions
//!
//! Register offsets and bit layouts of the controller's BAR0 window, following
//! NVM Express, plus typed accessors over a [`RegisterAccess`].

use x86_64::PhysAddr;

use crate::{
    error::NvmeError,
    mmio::{RegisterAccess, Width},
};

/// Register offsets within BAR0
pub mod offsets {
    pub const CAP: u32 = 0x00;              // Controller Capabilities
    pub const VS: u32 = 0x08;               // Version
    pub const INTMS: u32 = 0x0C;            // Interrupt Mask Set
    pub const INTMC: u32 = 0x10;            // Interrupt Mask Clear
    pub const CC: u32 = 0x14;               // Controller Configuration
    pub const CSTS: u32 = 0x1C;             // Controller Status
    pub const NSSR: u32 = 0x20;             // NVM Subsystem Reset
    pub const AQA: u32 = 0x24;              // Admin Queue Attributes
    pub const ASQ: u32 = 0x28;              // Admin Submission Queue Base Address
    pub const ACQ: u32 = 0x30;              // Admin Completion Queue Base Address
    pub const DOORBELL_BASE: u32 = 0x1000;  // SQ0 tail doorbell
}

/// Controller Capabilities Register (CAP) bit definitions
pub mod cap_bits {
    pub const MQES_MASK: u64 = 0xFFFF;           // Maximum Queue Entries Supported
    pub const CQR_SHIFT: u64 = 16;               // Contiguous Queues Required
    pub const TO_SHIFT: u64 = 24;                // Timeout
    pub const DSTRD_SHIFT: u64 = 32;             // Doorbell Stride
    pub const CSS_SHIFT: u64 = 37;               // Command Sets Supported
    pub const CSS_NVM: u64 = 1 << CSS_SHIFT;     // NVM command set
    pub const MPSMIN_SHIFT: u64 = 48;            // Memory Page Size Minimum
    pub const MPSMAX_SHIFT: u64 = 52;            // Memory Page Size Maximum
}

/// Controller Configuration Register (CC) bit definitions
pub mod cc_bits {
    pub const EN: u32 = 1 << 0;                  // Enable
    pub const IOSQES_SHIFT: u32 = 16;            // I/O Submission Queue Entry Size
    pub const IOCQES_SHIFT: u32 = 20;            // I/O Completion Queue Entry Size
}

/// Controller Status Register (CSTS) bit definitions
pub mod csts_bits {
    pub const RDY: u32 = 1 << 0;                 // Ready
    pub const CFS: u32 = 1 << 1;                 // Controller Fatal Status
}

/// Admin Queue Attributes Register (AQA) bit definitions
pub mod aqa_bits {
    pub const ASQS_MASK: u32 = 0xFFF;            // Admin Submission Queue Size
    pub const ACQS_SHIFT: u32 = 16;              // Admin Completion Queue Size shift
}

/// NVMe command opcodes
pub mod opcodes {
    // Admin commands
    pub const ADMIN_DELETE_IO_SQ: u8 = 0x00;
    pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
    pub const ADMIN_DELETE_IO_CQ: u8 = 0x04;
    pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
    pub const ADMIN_IDENTIFY: u8 = 0x06;
    pub const ADMIN_SECURITY_SEND: u8 = 0x81;
    pub const ADMIN_SECURITY_RECEIVE: u8 = 0x82;

    // NVM commands
    pub const NVM_FLUSH: u8 = 0x00;
    pub const NVM_WRITE: u8 = 0x01;
    pub const NVM_READ: u8 = 0x02;
}

/// IDENTIFY command CNS (Controller or Namespace Structure) values
pub mod identify_cns {
    pub const NAMESPACE: u32 = 0x00;
    pub const CONTROLLER: u32 = 0x01;
}

/// Captured CAP register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// MQES, 0-based
    pub fn mqes(&self) -> u16 {
        (self.0 & cap_bits::MQES_MASK) as u16
    }

    /// Maximum queue entries (CAP.MQES + 1)
    pub fn max_queue_entries(&self) -> u32 {
        self.mqes() as u32 + 1
    }

    /// CAP.TO in 500 ms units
    pub fn timeout(&self) -> u8 {
        ((self.0 >> cap_bits::TO_SHIFT) & 0xFF) as u8
    }

    pub fn doorbell_stride_exponent(&self) -> u8 {
        ((self.0 >> cap_bits::DSTRD_SHIFT) & 0xF) as u8
    }

    /// Doorbell stride in bytes (4 << CAP.DSTRD)
    pub fn doorbell_stride(&self) -> u32 {
        4 << self.doorbell_stride_exponent()
    }

    pub fn supports_nvm_command_set(&self) -> bool {
        self.0 & cap_bits::CSS_NVM != 0
    }

    pub fn mpsmin(&self) -> u8 {
        ((self.0 >> cap_bits::MPSMIN_SHIFT) & 0xF) as u8
    }

    pub fn mpsmax(&self) -> u8 {
        ((self.0 >> cap_bits::MPSMAX_SHIFT) & 0xF) as u8
    }

    /// Minimum memory page size (4KB << CAP.MPSMIN)
    pub fn min_page_size(&self) -> u64 {
        4096 << self.mpsmin()
    }
}

/// Build the CC value written by the enable step: EN=1, 64 byte SQ entries,
/// 16 byte CQ entries, everything else zero (NVM command set, 4KB pages,
/// round robin arbitration).
pub fn enable_configuration() -> u32 {
    cc_bits::EN | (6 << cc_bits::IOSQES_SHIFT) | (4 << cc_bits::IOCQES_SHIFT)
}

/// AQA value for 1-based admin queue sizes
pub fn admin_queue_attributes(sq_entries: u16, cq_entries: u16) -> u32 {
    ((cq_entries as u32 - 1) << aqa_bits::ACQS_SHIFT) | ((sq_entries as u32 - 1) & aqa_bits::ASQS_MASK)
}

/// Offset of the submission queue tail doorbell for `queue_id`
pub fn sq_tail_doorbell(queue_id: u16, stride: u32) -> u32 {
    offsets::DOORBELL_BASE + (2 * queue_id as u32) * stride
}

/// Offset of the completion queue head doorbell for `queue_id`
pub fn cq_head_doorbell(queue_id: u16, stride: u32) -> u32 {
    offsets::DOORBELL_BASE + (2 * queue_id as u32 + 1) * stride
}

/// Typed register window of one controller
pub struct Registers<'a, R: RegisterAccess + ?Sized> {
    mmio: &'a R,
    base: u64,
}

impl<'a, R: RegisterAccess + ?Sized> Registers<'a, R> {
    pub fn new(mmio: &'a R, base: u64) -> Self {
        Self { mmio, base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn cap(&self) -> Result<Capabilities, NvmeError> {
        self.mmio.read(self.base, offsets::CAP, Width::Qword).map(Capabilities)
    }

    pub fn version(&self) -> Result<u32, NvmeError> {
        Ok(self.mmio.read(self.base, offsets::VS, Width::Dword)? as u32)
    }

    pub fn cc(&self) -> Result<u32, NvmeError> {
        Ok(self.mmio.read(self.base, offsets::CC, Width::Dword)? as u32)
    }

    pub fn set_cc(&self, cc: u32) -> Result<(), NvmeError> {
        self.mmio.write(self.base, offsets::CC, Width::Dword, cc as u64)
    }

    pub fn csts(&self) -> Result<u32, NvmeError> {
        Ok(self.mmio.read(self.base, offsets::CSTS, Width::Dword)? as u32)
    }

    /// Check if the controller is ready
    pub fn is_ready(&self) -> Result<bool, NvmeError> {
        Ok(self.csts()? & csts_bits::RDY != 0)
    }

    /// Check if the controller has a fatal status
    pub fn is_fatal(&self) -> Result<bool, NvmeError> {
        Ok(self.csts()? & csts_bits::CFS != 0)
    }

    pub fn set_aqa(&self, aqa: u32) -> Result<(), NvmeError> {
        self.mmio.write(self.base, offsets::AQA, Width::Dword, aqa as u64)
    }

    /// Set admin submission queue base address
    pub fn set_asq(&self, addr: PhysAddr) -> Result<(), NvmeError> {
        self.mmio.write(self.base, offsets::ASQ, Width::Qword, addr.as_u64())
    }

    /// Set admin completion queue base address
    pub fn set_acq(&self, addr: PhysAddr) -> Result<(), NvmeError> {
        self.mmio.write(self.base, offsets::ACQ, Width::Qword, addr.as_u64())
    }

    pub fn ring_sq_tail(&self, queue_id: u16, stride: u32, tail: u16) -> Result<(), NvmeError> {
        self.mmio.write(self.base, sq_tail_doorbell(queue_id, stride), Width::Dword, tail as u64)
    }

    pub fn ring_cq_head(&self, queue_id: u16, stride: u32, head: u16) -> Result<(), NvmeError> {
        self.mmio.write(self.base, cq_head_doorbell(queue_id, stride), Width::Dword, head as u64)
    }
}
