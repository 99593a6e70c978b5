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

//! Bounded busy-wait polling.
//!
//! There is no scheduler below the driver, so every wait is a poll loop with
//! an iteration bound and a fixed stall between checks.

use crate::error::NvmeError;

/// Stall collaborator
#[cfg_attr(test, mockall::automock)]
pub trait Delay {
    fn stall_ns(&self, nanos: u64);
}

/// Iterations allotted per unit of CAP.TO (500 ms units, 1 ms per iteration)
pub const READY_ITERATIONS_PER_TIMEOUT_UNIT: u64 = 500;
pub const READY_POLL_INTERVAL_NS: u64 = 1_000_000;
pub const COMMAND_POLL_INTERVAL_NS: u64 = 128;

/// An iteration bound paired with a per-iteration stall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub iterations: u64,
    pub interval_ns: u64,
}

impl Poll {
    pub const fn new(iterations: u64, interval_ns: u64) -> Self {
        Self { iterations, interval_ns }
    }

    /// Bound for the CC.EN / CSTS.RDY handshake, derived from CAP.TO
    pub fn controller_ready(cap_timeout: u8) -> Self {
        let units = core::cmp::max(1, cap_timeout as u64);
        Self::new(units * READY_ITERATIONS_PER_TIMEOUT_UNIT, READY_POLL_INTERVAL_NS)
    }

    /// Bound for a command completion, `timeout` in 100 ns units
    pub fn command(timeout: u64) -> Self {
        Self::new(core::cmp::max(1, timeout >> 7), COMMAND_POLL_INTERVAL_NS)
    }

    /// Poll `cond` until it reports `true` or the bound runs out.
    ///
    /// Returns `Ok(false)` on timeout; errors from `cond` end the wait early.
    pub fn until<D, F>(&self, delay: &D, mut cond: F) -> Result<bool, NvmeError>
    where
        D: Delay + ?Sized,
        F: FnMut() -> Result<bool, NvmeError>,
    {
        for remaining in (0..=self.iterations).rev() {
            if cond()? {
                return Ok(true);
            }
            if remaining > 0 {
                delay.stall_ns(self.interval_ns);
            }
        }
        Ok(false)
    }
}
