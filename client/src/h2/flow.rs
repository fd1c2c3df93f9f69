//! flow control windows.

use super::error::H2Error;

/// initial window of every stream and of the connection before any SETTINGS.
pub const DEFAULT_WINDOW: u32 = 65_535;

/// largest legal window, 2^31 - 1.
pub const MAX_WINDOW: i64 = 0x7fff_ffff;

/// A flow control window. Never negative: when the peer shrinks INITIAL_WINDOW_SIZE below what
/// is already in flight the shortfall is kept as debt, paid off by later credit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    size: u32,
    debt: u32,
}

impl Window {
    pub(crate) fn new(size: u32) -> Self {
        Self { size, debt: 0 }
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    #[cfg(test)]
    pub(crate) fn debt(&self) -> u32 {
        self.debt
    }

    /// credit usable right now.
    pub(crate) fn available(&self) -> u32 {
        self.size
    }

    pub(crate) fn consume(&mut self, n: u32) -> Result<(), H2Error> {
        self.size = self.size.checked_sub(n).ok_or(H2Error::FlowControl)?;
        Ok(())
    }

    pub(crate) fn increase(&mut self, n: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(n))
    }

    /// apply the delta of an INITIAL_WINDOW_SIZE change.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let net = i64::from(self.size) - i64::from(self.debt) + delta;
        if net > MAX_WINDOW {
            return Err(H2Error::FlowControl);
        }
        // net is within (-2^32, 2^31).
        if net >= 0 {
            self.size = net as u32;
            self.debt = 0;
        } else {
            self.size = 0;
            self.debt = net.unsigned_abs() as u32;
        }
        Ok(())
    }
}

/// A receive window with batched credit return.
///
/// Bytes received shrink the window at once. Bytes consumed by the application are returned to
/// the peer only after at least half of `target` has accumulated.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: Window,
    target: u32,
    unacked: u32,
}

impl RecvWindow {
    pub(crate) fn new(target: u32) -> Self {
        Self {
            window: Window::new(target),
            target,
            unacked: 0,
        }
    }

    /// account received DATA payload. peer sending beyond its credit is a flow control error.
    pub(crate) fn receive(&mut self, n: u32) -> Result<(), H2Error> {
        self.window.consume(n)
    }

    /// account consumed bytes. returns the WINDOW_UPDATE increment to send, if due.
    pub(crate) fn release(&mut self, n: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(n);
        if self.unacked == 0 || u64::from(self.unacked) * 2 < u64::from(self.target) {
            return None;
        }
        let increment = core::mem::take(&mut self.unacked);
        // can not overflow: credit returned never exceeds credit received.
        let _ = self.window.increase(increment);
        Some(increment)
    }

    /// move to a new target, adjusting the window by the delta.
    pub(crate) fn retarget(&mut self, target: u32) -> Result<(), H2Error> {
        let delta = i64::from(target) - i64::from(self.target);
        self.target = target;
        self.window.adjust(delta)
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> u32 {
        self.window.size()
    }
}
