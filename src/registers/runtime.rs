//! The runtime register set: `MFINDEX` and the Interrupter Register Set array. See xHCI §5.5.

use super::interrupter::InterrupterRegisterSet;
use super::Window;

const MFINDEX: usize = 0x00;
const INTERRUPTER_REGISTER_SETS_BASE: usize = 0x20;
const INTERRUPTER_REGISTER_SET_STRIDE: usize = 0x20;

/// The runtime registers: the microframe counter and every interrupter's register block.
pub struct RuntimeRegisters {
    window: Window,
}

impl RuntimeRegisters {
    /// # Safety
    /// `window` must point at the controller's real runtime register block.
    pub(crate) unsafe fn new(window: Window) -> Self {
        Self { window }
    }

    /// The controller's free-running microframe counter, wrapping every 2^14 microframes. Used
    /// to anchor isochronous scheduling windows; see xHCI §4.11.2.5.
    pub fn microframe_index(&self) -> u32 {
        self.window.read32(MFINDEX) & 0x3fff
    }

    pub fn interrupter(&self, index: u16) -> InterrupterRegisterSet {
        let offset =
            INTERRUPTER_REGISTER_SETS_BASE + usize::from(index) * INTERRUPTER_REGISTER_SET_STRIDE;
        InterrupterRegisterSet::new(self.window.sub_window(offset))
    }
}
