//! PSW and register files.

use crate::fault::{Fault, PGM_SPECIFICATION};

/// PSW system-mask bit: PER enabled.
pub const PSW_PERMODE: u8 = 0x40;
/// PSW system-mask bit: DAT on.
pub const PSW_DATMODE: u8 = 0x04;
/// PSW system-mask bit: I/O interrupts enabled.
pub const PSW_IOMASK: u8 = 0x02;
/// PSW system-mask bit: external interrupts enabled.
pub const PSW_EXTMASK: u8 = 0x01;

/// Address-space control, PSW bits 16-17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsMode {
    /// Primary-space mode.
    #[default]
    Primary,
    /// Access-register mode.
    AccessRegister,
    /// Secondary-space mode.
    Secondary,
    /// Home-space mode.
    Home,
}

impl AsMode {
    /// Encode as PSW bits 16-17.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Primary => 0b00,
            Self::AccessRegister => 0b01,
            Self::Secondary => 0b10,
            Self::Home => 0b11,
        }
    }

    /// Decode from PSW bits 16-17.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0b01 => Self::AccessRegister,
            0b10 => Self::Secondary,
            0b11 => Self::Home,
            _ => Self::Primary,
        }
    }
}

/// Program status word.
///
/// Held decomposed; [`Psw::to_esa_bytes`] / [`Psw::from_esa_bytes`] and the
/// 16-byte ESAME forms produce the architectural storage images.
#[derive(Debug, Clone, Copy, Default)]
pub struct Psw {
    /// System mask (PER, DAT, I/O, external).
    pub sysmask: u8,
    /// PSW key, 0-15.
    pub pkey: u8,
    /// EC-mode bit (always set in ESA/390 PSWs).
    pub ecmode: bool,
    /// Machine-check mask.
    pub mach: bool,
    /// Wait state.
    pub wait: bool,
    /// Problem state.
    pub prob: bool,
    /// Address-space control.
    pub asmode: AsMode,
    /// Condition code, 0-3.
    pub cc: u8,
    /// Program mask (fixed-overflow, decimal-overflow, exponent-underflow,
    /// significance).
    pub progmask: u8,
    /// 31-bit addressing mode.
    pub amode: bool,
    /// 64-bit addressing mode (ESAME).
    pub amode64: bool,
    /// Instruction address.
    pub ia: u64,
    /// Instruction-length code of the last decoded instruction, in bytes.
    pub ilc: u8,
}

impl Psw {
    /// True if DAT is on.
    #[must_use]
    pub const fn dat_on(&self) -> bool {
        self.sysmask & PSW_DATMODE != 0
    }

    /// True in real mode (DAT off).
    #[must_use]
    pub const fn real_mode(&self) -> bool {
        !self.dat_on()
    }

    /// Mask an effective address to the current addressing mode.
    #[must_use]
    pub const fn address_wrap(&self) -> u64 {
        if self.amode64 {
            0xFFFF_FFFF_FFFF_FFFF
        } else if self.amode {
            0x7FFF_FFFF
        } else {
            0x00FF_FFFF
        }
    }

    /// Program-mask decimal-overflow bit.
    #[must_use]
    pub const fn domask(&self) -> bool {
        self.progmask & 0x4 != 0
    }

    /// Program-mask fixed-overflow bit.
    #[must_use]
    pub const fn fomask(&self) -> bool {
        self.progmask & 0x8 != 0
    }

    /// Serialize to the 8-byte ESA/390 image.
    #[must_use]
    pub fn to_esa_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.sysmask;
        b[1] = self.pkey << 4
            | u8::from(self.ecmode) << 3
            | u8::from(self.mach) << 2
            | u8::from(self.wait) << 1
            | u8::from(self.prob);
        b[2] = self.asmode.bits() << 6 | self.cc << 4 | self.progmask;
        let ia = (self.ia & 0x7FFF_FFFF) as u32 | u32::from(self.amode) << 31;
        b[4..8].copy_from_slice(&ia.to_be_bytes());
        b
    }

    /// Load from the 8-byte ESA/390 image. Checks the architectural
    /// validity rules: even instruction address within the addressing
    /// mode's reach.
    pub fn from_esa_bytes(bytes: [u8; 8]) -> Result<Self, Fault> {
        let ia_word = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let amode = ia_word & 0x8000_0000 != 0;
        let ia = u64::from(ia_word & 0x7FFF_FFFF);
        let psw = Self {
            sysmask: bytes[0],
            pkey: bytes[1] >> 4,
            ecmode: bytes[1] & 0x08 != 0,
            mach: bytes[1] & 0x04 != 0,
            wait: bytes[1] & 0x02 != 0,
            prob: bytes[1] & 0x01 != 0,
            asmode: AsMode::from_bits(bytes[2] >> 6),
            cc: (bytes[2] >> 4) & 3,
            progmask: bytes[2] & 0x0F,
            amode,
            amode64: false,
            ia,
            ilc: 0,
        };
        psw.check()?;
        Ok(psw)
    }

    /// Serialize to the 16-byte ESAME image.
    #[must_use]
    pub fn to_esame_bytes(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0] = self.sysmask;
        b[1] = self.pkey << 4
            | u8::from(self.mach) << 2
            | u8::from(self.wait) << 1
            | u8::from(self.prob);
        b[2] = self.asmode.bits() << 6 | self.cc << 4 | self.progmask;
        b[3] = u8::from(self.amode64);
        b[4] = u8::from(self.amode) << 7;
        b[8..16].copy_from_slice(&self.ia.to_be_bytes());
        b
    }

    /// Load from the 16-byte ESAME image.
    pub fn from_esame_bytes(bytes: [u8; 16]) -> Result<Self, Fault> {
        let amode64 = bytes[3] & 0x01 != 0;
        let amode = bytes[4] & 0x80 != 0;
        // EA without BA is invalid.
        if amode64 && !amode {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let ia = u64::from_be_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        let psw = Self {
            sysmask: bytes[0],
            pkey: bytes[1] >> 4,
            ecmode: true,
            mach: bytes[1] & 0x04 != 0,
            wait: bytes[1] & 0x02 != 0,
            prob: bytes[1] & 0x01 != 0,
            asmode: AsMode::from_bits(bytes[2] >> 6),
            cc: (bytes[2] >> 4) & 3,
            progmask: bytes[2] & 0x0F,
            amode,
            amode64,
            ia,
            ilc: 0,
        };
        psw.check()?;
        Ok(psw)
    }

    /// Architectural PSW validity: odd instruction addresses and addresses
    /// beyond the reach of the addressing mode are specification exceptions.
    pub fn check(&self) -> Result<(), Fault> {
        if self.ia & 1 != 0 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        if !self.amode64 {
            if self.amode {
                if self.ia > 0x7FFF_FFFF {
                    return Err(Fault(PGM_SPECIFICATION));
                }
            } else if self.ia > 0x00FF_FFFF {
                return Err(Fault(PGM_SPECIFICATION));
            }
        }
        Ok(())
    }
}

/// The register files: 16 general registers (64-bit under ESAME, of which
/// ESA/390 sees the low halves), 16 control registers and 16 access
/// registers.
#[derive(Debug, Clone)]
pub struct Registers {
    /// General registers, full 64-bit width.
    pub gr: [u64; 16],
    /// Control registers, full 64-bit width; ESA/390 uses the low halves.
    pub cr: [u64; 16],
    /// Access registers.
    pub ar: [u32; 16],
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            gr: [0; 16],
            cr: [0; 16],
            ar: [0; 16],
        }
    }
}

impl Registers {
    // === General registers ===

    /// 64-bit view of GR `n`.
    #[must_use]
    pub const fn gr_g(&self, n: usize) -> u64 {
        self.gr[n]
    }

    /// Low 32 bits of GR `n` (the ESA/390 register).
    #[must_use]
    pub const fn gr_l(&self, n: usize) -> u32 {
        self.gr[n] as u32
    }

    /// High 32 bits of GR `n`.
    #[must_use]
    pub const fn gr_h(&self, n: usize) -> u32 {
        (self.gr[n] >> 32) as u32
    }

    /// Set the full 64-bit GR `n`.
    pub const fn set_gr_g(&mut self, n: usize, value: u64) {
        self.gr[n] = value;
    }

    /// Set the low 32 bits of GR `n`, preserving the high half.
    pub const fn set_gr_l(&mut self, n: usize, value: u32) {
        self.gr[n] = (self.gr[n] & 0xFFFF_FFFF_0000_0000) | value as u64;
    }

    /// Set the high 32 bits of GR `n`, preserving the low half.
    pub const fn set_gr_h(&mut self, n: usize, value: u32) {
        self.gr[n] = (self.gr[n] & 0x0000_0000_FFFF_FFFF) | (value as u64) << 32;
    }

    /// One of the four 16-bit quarters of GR `n`; 0 selects bits 0-15.
    #[must_use]
    pub const fn gr_q(&self, n: usize, quarter: usize) -> u16 {
        (self.gr[n] >> (48 - quarter * 16)) as u16
    }

    /// Replace one 16-bit quarter of GR `n`.
    pub const fn set_gr_q(&mut self, n: usize, quarter: usize, value: u16) {
        let shift = 48 - quarter * 16;
        self.gr[n] = (self.gr[n] & !(0xFFFF << shift)) | (value as u64) << shift;
    }

    /// Even/odd register pair viewed as a 64-bit quantity; the even
    /// register is the high half.
    #[must_use]
    pub const fn gr_pair(&self, even: usize) -> u64 {
        (self.gr_l(even) as u64) << 32 | self.gr_l(even + 1) as u64
    }

    /// Store into an even/odd register pair.
    pub const fn set_gr_pair(&mut self, even: usize, value: u64) {
        self.set_gr_l(even, (value >> 32) as u32);
        self.set_gr_l(even + 1, value as u32);
    }

    // === Control registers ===

    /// Low 32 bits of CR `n` (the ESA/390 register).
    #[must_use]
    pub const fn cr_l(&self, n: usize) -> u32 {
        self.cr[n] as u32
    }

    /// Set the low 32 bits of CR `n`, preserving the high half.
    pub const fn set_cr_l(&mut self, n: usize, value: u32) {
        self.cr[n] = (self.cr[n] & 0xFFFF_FFFF_0000_0000) | value as u64;
    }

    /// PSW-key mask from CR3 bits 0-15.
    #[must_use]
    pub const fn pkm(&self) -> u16 {
        (self.cr_l(3) >> 16) as u16
    }

    /// Secondary ASN from CR3 bits 16-31.
    #[must_use]
    pub const fn sasn(&self) -> u16 {
        self.cr_l(3) as u16
    }

    /// Authorization index from CR4 bits 0-15.
    #[must_use]
    pub const fn ax(&self) -> u16 {
        (self.cr_l(4) >> 16) as u16
    }

    /// Primary ASN from CR4 bits 16-31.
    #[must_use]
    pub const fn pasn(&self) -> u16 {
        self.cr_l(4) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esa_psw_round_trip() {
        let psw = Psw {
            sysmask: PSW_DATMODE | PSW_EXTMASK,
            pkey: 7,
            ecmode: true,
            mach: true,
            wait: false,
            prob: true,
            asmode: AsMode::Home,
            cc: 2,
            progmask: 0x0C,
            amode: true,
            amode64: false,
            ia: 0x0012_3456,
            ilc: 0,
        };
        let bytes = psw.to_esa_bytes();
        let back = Psw::from_esa_bytes(bytes).expect("valid PSW");
        assert_eq!(back.pkey, 7);
        assert_eq!(back.cc, 2);
        assert_eq!(back.asmode, AsMode::Home);
        assert!(back.amode);
        assert_eq!(back.ia, 0x0012_3456);
    }

    #[test]
    fn odd_instruction_address_is_invalid() {
        let mut bytes = [0u8; 8];
        bytes[7] = 0x01;
        assert!(Psw::from_esa_bytes(bytes).is_err());
    }

    #[test]
    fn amode24_limits_instruction_address() {
        let mut bytes = [0u8; 8];
        // IA = 0x0100_0000 with the amode bit clear: beyond 24-bit reach.
        bytes[4..8].copy_from_slice(&0x0100_0000u32.to_be_bytes());
        assert!(Psw::from_esa_bytes(bytes).is_err());
        // The same address is fine in 31-bit mode.
        bytes[4..8].copy_from_slice(&(0x8100_0000u32).to_be_bytes());
        assert!(Psw::from_esa_bytes(bytes).is_ok());
    }

    #[test]
    fn esame_psw_requires_ba_with_ea() {
        let mut bytes = [0u8; 16];
        bytes[3] = 0x01; // EA without BA
        assert!(Psw::from_esame_bytes(bytes).is_err());
        bytes[4] = 0x80;
        assert!(Psw::from_esame_bytes(bytes).is_ok());
    }

    #[test]
    fn register_views() {
        let mut regs = Registers::default();
        regs.set_gr_g(1, 0x1122_3344_5566_7788);
        assert_eq!(regs.gr_l(1), 0x5566_7788);
        assert_eq!(regs.gr_h(1), 0x1122_3344);
        assert_eq!(regs.gr_q(1, 0), 0x1122);
        assert_eq!(regs.gr_q(1, 3), 0x7788);
        regs.set_gr_l(1, 0xAABB_CCDD);
        assert_eq!(regs.gr_g(1), 0x1122_3344_AABB_CCDD);
        regs.set_gr_q(1, 1, 0xBEEF);
        assert_eq!(regs.gr_h(1), 0x1122_BEEF);
    }

    #[test]
    fn register_pairs() {
        let mut regs = Registers::default();
        regs.set_gr_pair(4, 0x0102_0304_0506_0708);
        assert_eq!(regs.gr_l(4), 0x0102_0304);
        assert_eq!(regs.gr_l(5), 0x0506_0708);
        assert_eq!(regs.gr_pair(4), 0x0102_0304_0506_0708);
    }
}
