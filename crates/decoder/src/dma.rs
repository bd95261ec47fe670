//! DMA-coherent memory collaborator.
//!
//! The engine addresses memory through 32-bit bus addresses written into
//! its registers, so every region carries both the CPU view and the bus
//! address the hardware sees.

use std::fmt;

use vdec_common::DmaError;

/// One DMA-coherent region.
///
/// Ownership is the release token: a region can only be handed back to the
/// allocator once, by value.
pub struct DmaBuffer {
    paddr: u32,
    mem: Box<[u8]>,
}

impl DmaBuffer {
    /// Wrap an allocator-provided mapping.
    pub fn new(paddr: u32, mem: Box<[u8]>) -> Self {
        Self { paddr, mem }
    }

    /// Bus address as programmed into the engine.
    pub fn paddr(&self) -> u32 {
        self.paddr
    }

    /// Bus address one past the end of the region.
    pub fn end_paddr(&self) -> u32 {
        self.paddr.wrapping_add(self.mem.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mem
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("paddr", &format_args!("0x{:08x}", self.paddr))
            .field("len", &self.mem.len())
            .finish()
    }
}

/// Coherent allocate/free, as provided by the platform.
///
/// Allocation may block; it is only ever called from process context or
/// the interrupt bottom half, never from the top half.
pub trait DmaAllocator: Send + Sync {
    fn alloc_coherent(&self, size: usize) -> Result<DmaBuffer, DmaError>;
    fn free_coherent(&self, buf: DmaBuffer);
}

/// Release `slot` if it holds a region, leaving it empty.
pub(crate) fn release(dma: &dyn DmaAllocator, slot: &mut Option<DmaBuffer>) {
    if let Some(buf) = slot.take() {
        dma.free_coherent(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDma;

    #[test]
    fn end_address_covers_length() {
        let buf = DmaBuffer::new(0x1000_0000, vec![0u8; 0x2000].into_boxed_slice());
        assert_eq!(buf.end_paddr(), 0x1000_2000);
        assert_eq!(buf.len(), 0x2000);
    }

    #[test]
    fn release_is_idempotent() {
        let dma = SimDma::new();
        let mut slot = Some(dma.alloc_coherent(64).unwrap());
        release(&dma, &mut slot);
        release(&dma, &mut slot);
        assert!(slot.is_none());
        assert_eq!(dma.live_allocations(), 0);
        assert_eq!(dma.total_frees(), 1);
    }
}
