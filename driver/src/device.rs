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

//! Boot device entry points
//!
//! The firmware boot path attaches one NVMe controller, then addresses its
//! namespaces by index through [`BlockDevice`].

use log::{info, warn};

use super::{
    block::MediaInfo,
    config::DriverConfig,
    controller::{Controller, Platform},
    error::NvmeError,
};

/// Block access by device index, as consumed by boot device selection
pub trait BlockDevice {
    /// Number of attached namespaces
    fn device_count(&self) -> usize;

    fn media_info(&self, index: usize) -> Result<MediaInfo, NvmeError>;

    fn read_blocks(&mut self, index: usize, lba: u64, buffer: &mut [u8]) -> Result<(), NvmeError>;

    fn write_blocks(&mut self, index: usize, lba: u64, buffer: &[u8]) -> Result<(), NvmeError>;
}

/// Owner of the controller used for booting
pub struct NvmeBootDevice<P: Platform> {
    controller: Option<Controller<P>>,
}

impl<P: Platform> Default for NvmeBootDevice<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> NvmeBootDevice<P> {
    pub const fn new() -> Self {
        Self { controller: None }
    }

    /// Bring up the controller at `mmio_base` and attach its namespaces.
    /// Returns the number of namespaces attached.
    pub fn initialize(&mut self, platform: P, mmio_base: u64, config: DriverConfig) -> Result<usize, NvmeError> {
        if let Some(controller) = &self.controller {
            warn!("NVMe boot device already initialized at {:#x}", controller.base());
            return Ok(controller.namespaces().len());
        }

        let mut controller = Controller::new(platform, mmio_base, config)?;
        let count = controller.discover_namespaces();
        self.controller = Some(controller);
        Ok(count)
    }

    /// Shut the controller down; does nothing when none is attached
    pub fn deinitialize(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            info!("Releasing NVMe boot device at {:#x}", controller.base());
            controller.shutdown();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.controller.is_some()
    }

    pub fn controller(&self) -> Option<&Controller<P>> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut Controller<P>> {
        self.controller.as_mut()
    }

    /// Namespace id behind device `index`
    fn nsid(&self, index: usize) -> Result<u32, NvmeError> {
        self.controller
            .as_ref()
            .and_then(|controller| controller.namespaces().get(index))
            .map(|ns| ns.nsid)
            .ok_or(NvmeError::NotFound)
    }

    fn attached(&mut self, index: usize) -> Result<(&mut Controller<P>, u32), NvmeError> {
        let nsid = self.nsid(index)?;
        let controller = self.controller.as_mut().ok_or(NvmeError::NotFound)?;
        Ok((controller, nsid))
    }
}

impl<P: Platform> BlockDevice for NvmeBootDevice<P> {
    fn device_count(&self) -> usize {
        self.controller.as_ref().map_or(0, |controller| controller.namespaces().len())
    }

    fn media_info(&self, index: usize) -> Result<MediaInfo, NvmeError> {
        self.controller
            .as_ref()
            .and_then(|controller| controller.namespaces().get(index))
            .map(|ns| ns.media)
            .ok_or(NvmeError::NotFound)
    }

    fn read_blocks(&mut self, index: usize, lba: u64, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let (controller, nsid) = self.attached(index)?;
        controller.read_blocks(nsid, lba, buffer)
    }

    fn write_blocks(&mut self, index: usize, lba: u64, buffer: &[u8]) -> Result<(), NvmeError> {
        let (controller, nsid) = self.attached(index)?;
        controller.write_blocks(nsid, lba, buffer)
    }
}
