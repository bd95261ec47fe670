//! Register access on the two hardware windows: the decoder-core ("DOS")
//! window and the bitstream-parser window.
//!
//! Offsets are byte offsets from the base of their window. All accesses are
//! 32-bit and relaxed; ordering against DMA is the caller's concern.

// ---------------------------------------------------------------------------
// Decoder-core window offsets
// ---------------------------------------------------------------------------

/// Mailbox-1 interrupt acknowledge.
pub const ASSIST_MBOX1_CLR_REG: u32 = 0x01d4;

pub const AV_SCRATCH_0: u32 = 0x09c0;
pub const AV_SCRATCH_1: u32 = 0x09c4;
pub const AV_SCRATCH_4: u32 = 0x09d0;
pub const AV_SCRATCH_7: u32 = 0x09dc;
pub const AV_SCRATCH_8: u32 = 0x09e0;
pub const AV_SCRATCH_A: u32 = 0x09e8;
pub const AV_SCRATCH_D: u32 = 0x09f4;
pub const AV_SCRATCH_F: u32 = 0x09fc;
pub const AV_SCRATCH_G: u32 = 0x0a00;
pub const AV_SCRATCH_I: u32 = 0x0a08;
pub const AV_SCRATCH_J: u32 = 0x0a0c;

/// First canvas bank-select register of the motion-compensation unit.
pub const ANC0_CANVAS_ADDR: u32 = 0x2648;
pub const MDEC_PIC_DC_THRESH: u32 = 0x26e0;
pub const POWER_CTL_VLD: u32 = 0x3020;

/// Single-bit mask.
pub const fn bit(n: u32) -> u32 {
    1 << n
}

/// Contiguous mask covering bits `low..=high`.
pub const fn genmask(high: u32, low: u32) -> u32 {
    (u32::MAX >> (31 - high)) & (u32::MAX << low)
}

// ---------------------------------------------------------------------------
// Register I/O collaborator
// ---------------------------------------------------------------------------

/// Typed 32-bit access to both register windows.
///
/// Implementations must be callable from the interrupt top half: no
/// blocking, no allocation.
pub trait RegisterIo: Send + Sync {
    fn read_dos(&self, reg: u32) -> u32;
    fn write_dos(&self, reg: u32, val: u32);
    fn read_parser(&self, reg: u32) -> u32;
    fn write_parser(&self, reg: u32, val: u32);

    /// Read-modify-write setting `val` bits in a decoder-core register.
    fn write_dos_bits(&self, reg: u32, val: u32) {
        self.write_dos(reg, self.read_dos(reg) | val);
    }

    /// Read-modify-write clearing `val` bits in a decoder-core register.
    fn clear_dos_bits(&self, reg: u32, val: u32) {
        self.write_dos(reg, self.read_dos(reg) & !val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    #[test]
    fn masks() {
        assert_eq!(genmask(7, 0), 0xff);
        assert_eq!(genmask(15, 0), 0xffff);
        assert_eq!(genmask(6, 0), 0x7f);
        assert_eq!(genmask(31, 16), 0xffff_0000);
        assert_eq!(bit(15), 0x8000);
    }

    #[test]
    fn scratch_registers_are_word_spaced() {
        assert_eq!(AV_SCRATCH_1 - AV_SCRATCH_0, 4);
        assert_eq!(AV_SCRATCH_A, AV_SCRATCH_0 + 10 * 4);
        assert_eq!(AV_SCRATCH_J, AV_SCRATCH_0 + 19 * 4);
    }

    #[test]
    fn set_and_clear_bits() {
        let regs = SimRegisters::new();
        regs.write_dos(POWER_CTL_VLD, 0x1);
        regs.write_dos_bits(POWER_CTL_VLD, bit(9) | bit(6));
        assert_eq!(regs.read_dos(POWER_CTL_VLD), 0x241);
        regs.clear_dos_bits(POWER_CTL_VLD, bit(6));
        assert_eq!(regs.read_dos(POWER_CTL_VLD), 0x201);
    }

    #[test]
    fn windows_are_independent() {
        let regs = SimRegisters::new();
        regs.write_parser(0x10, 7);
        assert_eq!(regs.read_parser(0x10), 7);
        assert_eq!(regs.read_dos(0x10), 0);
    }
}
