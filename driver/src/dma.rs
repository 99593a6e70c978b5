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

//! Bus-master DMA collaborator.
//!
//! All DMA memory the driver touches goes through four operations: allocate,
//! free, map and unmap. Device-visible addresses are [`PhysAddr`]s and are
//! never assumed to equal the host [`VirtAddr`] of the same memory.

use x86_64::{PhysAddr, VirtAddr};

use crate::error::NvmeError;

/// Platform page size; PRP entries and queue memory are laid out in these units
pub const PAGE_SIZE: usize = 4096;

/// Direction of a bus-master transfer, seen from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads host memory (host-to-device data)
    DeviceRead,
    /// Device writes host memory (device-to-host data)
    DeviceWrite,
}

/// Opaque token identifying one mapping or allocation to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle(pub u64);

/// A live mapping of a caller buffer. Not `Clone`: it is returned to
/// [`DmaService::unmap`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaMapping {
    phys: PhysAddr,
    len: usize,
    handle: MappingHandle,
}

impl DmaMapping {
    pub fn new(phys: PhysAddr, len: usize, handle: MappingHandle) -> Self {
        Self { phys, len, handle }
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn handle(&self) -> MappingHandle {
        self.handle
    }
}

/// Physically contiguous, page-granular DMA memory owned by the driver.
///
/// Entry accessors are bounds-checked against the owned page count.
#[derive(Debug)]
pub struct DmaPages {
    host: VirtAddr,
    phys: PhysAddr,
    pages: usize,
    handle: MappingHandle,
}

impl DmaPages {
    /// # Safety
    /// `host` must point to `pages * PAGE_SIZE` writable bytes, exclusively
    /// owned by the returned value until it is handed back to
    /// [`DmaService::free`], and `phys` must be the device address of the
    /// same memory.
    pub unsafe fn new(host: VirtAddr, phys: PhysAddr, pages: usize, handle: MappingHandle) -> Self {
        Self { host, phys, pages, handle }
    }

    pub fn host(&self) -> VirtAddr {
        self.host
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn handle(&self) -> MappingHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn page_host(&self, page: usize) -> Option<VirtAddr> {
        (page < self.pages).then(|| self.host + (page * PAGE_SIZE) as u64)
    }

    pub fn page_phys(&self, page: usize) -> Option<PhysAddr> {
        (page < self.pages).then(|| self.phys + (page * PAGE_SIZE) as u64)
    }

    /// Number of 64-bit slots in the span
    pub fn u64_capacity(&self) -> usize {
        self.len() / core::mem::size_of::<u64>()
    }

    pub fn write_u64(&mut self, index: usize, value: u64) -> Result<(), NvmeError> {
        if index >= self.u64_capacity() {
            return Err(NvmeError::InvalidParameter);
        }
        // SAFETY: index is in bounds of memory we own (see `new`)
        unsafe { core::ptr::write_volatile(self.host.as_mut_ptr::<u64>().add(index), value) };
        Ok(())
    }

    pub fn read_u64(&self, index: usize) -> Result<u64, NvmeError> {
        if index >= self.u64_capacity() {
            return Err(NvmeError::InvalidParameter);
        }
        // SAFETY: index is in bounds of memory we own (see `new`)
        Ok(unsafe { core::ptr::read_volatile(self.host.as_ptr::<u64>().add(index)) })
    }

    pub fn zero(&mut self) {
        // SAFETY: the whole span is owned
        unsafe { core::ptr::write_bytes(self.host.as_mut_ptr::<u8>(), 0, self.len()) };
    }
}

/// DMA mapping collaborator
pub trait DmaService {
    /// Allocate and map `pages` contiguous pages of common-buffer memory
    fn allocate(&self, pages: usize) -> Result<DmaPages, NvmeError>;
    /// Unmap and release memory obtained from [`DmaService::allocate`]
    fn free(&self, pages: DmaPages);
    /// Map a caller buffer for bus-master access
    fn map(&self, direction: DmaDirection, host: VirtAddr, len: usize) -> Result<DmaMapping, NvmeError>;
    fn unmap(&self, mapping: DmaMapping);
}
