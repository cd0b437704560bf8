//! A handful of allocation helpers shared by every owner of a DMA page (rings, contexts, the
//! DCBAA, the scratchpad array): every single-page allocation in this core needs the same
//! "allocate, then reject it if the controller can't address it" dance.

use alloc::boxed::Box;

use crate::error::{Result, XhciError};
use crate::hal::{DmaBuffer, DmaBufferFactory};

/// Allocates one `size`-byte DMA buffer and rejects it with [`XhciError::NoMemory`] if `is_32bit`
/// is set and the resulting physical address doesn't fit in 32 bits. Every ring segment, context
/// page, and the DCBAA/scratchpad arrays go through this rather than calling
/// [`DmaBufferFactory::allocate`] directly.
pub(crate) fn alloc_checked(
    factory: &dyn DmaBufferFactory,
    size: usize,
    is_32bit: bool,
) -> Result<Box<dyn DmaBuffer>> {
    let buffer = factory.allocate(size).map_err(|_| XhciError::NoMemory)?;
    if is_32bit && buffer.phys_addr() > u64::from(u32::MAX) {
        return Err(XhciError::NoMemory);
    }
    Ok(buffer)
}
