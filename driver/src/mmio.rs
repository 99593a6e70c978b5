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

//! Width-typed access to a controller's MMIO window.
//!
//! The driver never dereferences BAR memory itself; every register access goes
//! through a [`RegisterAccess`] implementation supplied by the platform.

use crate::error::NvmeError;

/// Register access width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    /// Width from a byte count; only 1, 2, 4 and 8 are valid
    pub fn from_bytes(bytes: usize) -> Result<Self, NvmeError> {
        match bytes {
            1 => Ok(Width::Byte),
            2 => Ok(Width::Word),
            4 => Ok(Width::Dword),
            8 => Ok(Width::Qword),
            _ => Err(NvmeError::InvalidParameter),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }

    /// Mask covering the bits a value of this width can hold
    pub fn mask(self) -> u64 {
        match self {
            Width::Qword => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }
}

/// MMIO collaborator.
///
/// Implementations fail with [`NvmeError::InvalidParameter`] when `base` is zero.
#[cfg_attr(test, mockall::automock)]
pub trait RegisterAccess {
    fn read(&self, base: u64, offset: u32, width: Width) -> Result<u64, NvmeError>;
    fn write(&self, base: u64, offset: u32, width: Width, value: u64) -> Result<(), NvmeError>;
}

/// Direct volatile access to a BAR mapped into the current address space
#[derive(Debug)]
pub struct VolatileMmio {
    _private: (),
}

impl VolatileMmio {
    /// # Safety
    /// Every `base + offset` later passed to this accessor must be a mapped,
    /// uncached MMIO address for the lifetime of the returned value.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterAccess for VolatileMmio {
    fn read(&self, base: u64, offset: u32, width: Width) -> Result<u64, NvmeError> {
        if base == 0 {
            return Err(NvmeError::InvalidParameter);
        }
        let addr = (base + offset as u64) as usize;
        // SAFETY: guaranteed by the contract of `VolatileMmio::new`
        let value = unsafe {
            match width {
                Width::Byte => core::ptr::read_volatile(addr as *const u8) as u64,
                Width::Word => core::ptr::read_volatile(addr as *const u16) as u64,
                Width::Dword => core::ptr::read_volatile(addr as *const u32) as u64,
                Width::Qword => core::ptr::read_volatile(addr as *const u64),
            }
        };
        Ok(value)
    }

    fn write(&self, base: u64, offset: u32, width: Width, value: u64) -> Result<(), NvmeError> {
        if base == 0 {
            return Err(NvmeError::InvalidParameter);
        }
        let addr = (base + offset as u64) as usize;
        // SAFETY: guaranteed by the contract of `VolatileMmio::new`
        unsafe {
            match width {
                Width::Byte => core::ptr::write_volatile(addr as *mut u8, value as u8),
                Width::Word => core::ptr::write_volatile(addr as *mut u16, value as u16),
                Width::Dword => core::ptr::write_volatile(addr as *mut u32, value as u32),
                Width::Qword => core::ptr::write_volatile(addr as *mut u64, value),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_power_of_two_widths_up_to_eight() {
        for bytes in [1, 2, 4, 8] {
            assert_eq!(Width::from_bytes(bytes).map(Width::bytes), Ok(bytes));
        }
        for bytes in [0, 3, 5, 16] {
            assert_eq!(Width::from_bytes(bytes), Err(NvmeError::InvalidParameter));
        }
    }

    #[test]
    fn zero_base_is_rejected() {
        let mmio = unsafe { VolatileMmio::new() };
        assert_eq!(mmio.read(0, 0x1C, Width::Dword), Err(NvmeError::InvalidParameter));
        assert_eq!(mmio.write(0, 0x14, Width::Dword, 1), Err(NvmeError::InvalidParameter));
    }

    #[test]
    fn volatile_access_round_trips_through_memory() {
        let mut window = [0u64; 4];
        let base = window.as_mut_ptr() as u64;
        let mmio = unsafe { VolatileMmio::new() };
        mmio.write(base, 8, Width::Qword, 0xDEAD_BEEF_CAFE_F00D).unwrap();
        mmio.write(base, 0, Width::Word, 0x1234).unwrap();
        assert_eq!(mmio.read(base, 8, Width::Qword).unwrap(), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(mmio.read(base, 0, Width::Word).unwrap(), 0x1234);
        assert_eq!(window[0] & 0xFFFF, 0x1234);
    }
}
