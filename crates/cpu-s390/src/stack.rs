//! The linkage stack: state entries in guest storage, anchored by CR15.
//!
//! Every entry is 168 bytes: a 160-byte state area (GR0-15, AR0-15,
//! PKM/SASN/EAX/PASN, a PSW image, the called-space identification and
//! the modifiable area) followed by the 8-byte entry descriptor (LSED).
//! CR15 addresses the LSED of the current entry. Stack references
//! translate through the home segment table regardless of the PSW
//! address-space control.

use crate::cpu::Cpu;
use crate::dat::{AccType, Space};
use crate::fault::{
    Fault, PGM_STACK_EMPTY, PGM_STACK_FULL, PGM_STACK_OPERATION, PGM_STACK_SPECIFICATION,
    PGM_STACK_TYPE,
};

/// LSED entry-type field mask.
pub const LSED_UET_ET: u8 = 0x7F;
/// Unstack-suppression bit.
pub const LSED_UET_U: u8 = 0x80;
/// Header entry.
pub const LSED_UET_HDR: u8 = 0x01;
/// Trailer entry.
pub const LSED_UET_TLR: u8 = 0x02;
/// Branch state entry (BAKR).
pub const LSED_UET_BAKR: u8 = 0x04;
/// Program-call state entry.
pub const LSED_UET_PC: u8 = 0x05;

/// Size of a state entry including its descriptor.
pub const LSSE_SIZE: u64 = 168;
/// CR15 linkage-stack-entry address bits.
pub const CR15_LSEA: u32 = 0x7FFF_FFF8;

/// One parsed entry descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Lsed {
    /// Unstack-suppression bit and entry type.
    pub uet: u8,
    /// Section identification.
    pub si: u8,
    /// Remaining free space in the section.
    pub rfs: u16,
    /// Next-entry size.
    pub nes: u16,
}

/// Everything a Program Return pops, staged so the caller can finish its
/// own checks (ASN translation, authorization) before committing.
#[derive(Debug, Clone)]
pub struct StackState {
    /// `LSED_UET_BAKR` or `LSED_UET_PC`.
    pub etype: u8,
    pub gr: [u32; 16],
    pub ar: [u32; 16],
    pub pkm: u16,
    pub sasn: u16,
    pub eax: u16,
    pub pasn: u16,
    /// The stacked 8-byte PSW image.
    pub psw_bytes: [u8; 8],
    /// New CR15 value: the previous entry's descriptor address.
    pub new_cr15: u32,
    /// Absolute address of that descriptor, for the NES clear.
    pub alsed_abs: u64,
}

impl Cpu {
    fn stack_abs(&mut self, vaddr: u64, write: bool) -> Result<u64, Fault> {
        let acc = if write { AccType::Write } else { AccType::Read };
        // Stack accesses always translate through the home space with an
        // effective key of zero; AccType::Stack picks the home STD, and
        // the explicit access type only drives the ref/change update.
        if self.psw.real_mode() {
            self.logical_to_abs(vaddr, Space::Real, acc, 0)
        } else {
            let t = self.translate_addr(vaddr, Space::Ar(0), AccType::Stack)?;
            let abs = s390_storage::apply_prefixing(t.raddr, self.prefix);
            if abs >= self.mainsize() {
                return Err(Fault(crate::fault::PGM_ADDRESSING));
            }
            Ok(abs)
        }
    }

    fn stack_fetch4(&mut self, vaddr: u64) -> Result<u32, Fault> {
        let abs = self.stack_abs(vaddr, false)?;
        Ok(self.sysblk.storage().fetch_fullword_absolute(abs))
    }

    fn stack_store4(&mut self, value: u32, vaddr: u64) -> Result<(), Fault> {
        let abs = self.stack_abs(vaddr, true)?;
        self.sysblk.storage().store_fullword_absolute(value, abs);
        Ok(())
    }

    fn fetch_lsed(&mut self, vaddr: u64) -> Result<Lsed, Fault> {
        let w0 = self.stack_fetch4(vaddr)?;
        let w1 = self.stack_fetch4(vaddr + 4)?;
        Ok(Lsed {
            uet: (w0 >> 24) as u8,
            si: (w0 >> 16) as u8,
            rfs: w0 as u16,
            nes: (w1 >> 16) as u16,
        })
    }

    fn store_lsed(&mut self, lsed: Lsed, vaddr: u64) -> Result<(), Fault> {
        let w0 = u32::from(lsed.uet) << 24 | u32::from(lsed.si) << 16 | u32::from(lsed.rfs);
        let w1 = u32::from(lsed.nes) << 16;
        self.stack_store4(w0, vaddr)?;
        self.stack_store4(w1, vaddr + 4)
    }

    /// Form a BAKR or PC state entry.
    ///
    /// `retn` is the return address with the amode bit in bit 0; `calla`
    /// is the branch address (BAKR) or PC number (PC); `csi` the
    /// called-space identification (stacking PC only).
    pub fn form_stack_entry(
        &mut self,
        etype: u8,
        retn: u32,
        calla: u32,
        csi: u32,
    ) -> Result<(), Fault> {
        let lsea = u64::from(self.regs.cr_l(15) & CR15_LSEA);
        let lsed = self.fetch_lsed(lsea)?;

        // The new entry must fit in the current section.
        if u64::from(lsed.rfs) < LSSE_SIZE {
            return Err(Fault(PGM_STACK_FULL));
        }

        let state = lsea + 8;
        for r in 0..16 {
            self.stack_store4(self.regs.gr_l(r), state + r as u64 * 4)?;
            self.stack_store4(self.regs.ar[r], state + 64 + r as u64 * 4)?;
        }
        self.stack_store4(
            u32::from(self.regs.pkm()) << 16 | u32::from(self.regs.sasn()),
            state + 128,
        )?;
        let eax = (self.regs.cr_l(8) >> 16) as u16;
        self.stack_store4(
            u32::from(eax) << 16 | u32::from(self.regs.pasn()),
            state + 132,
        )?;

        // PSW image with the return address in place of the IA.
        let mut psw = self.psw;
        psw.amode = retn & 0x8000_0000 != 0;
        psw.ia = u64::from(retn & 0x7FFF_FFFF);
        let img = psw.to_esa_bytes();
        self.stack_store4(u32::from_be_bytes([img[0], img[1], img[2], img[3]]), state + 136)?;
        self.stack_store4(u32::from_be_bytes([img[4], img[5], img[6], img[7]]), state + 140)?;

        self.stack_store4(calla, state + 144)?;
        self.stack_store4(csi, state + 148)?;
        self.stack_store4(0, state + 152)?;
        self.stack_store4(0, state + 156)?;

        // Descriptor of the new entry, then chain the old one to it.
        self.store_lsed(
            Lsed {
                uet: etype,
                si: lsed.si,
                rfs: lsed.rfs - LSSE_SIZE as u16,
                nes: 0,
            },
            lsea + LSSE_SIZE,
        )?;
        self.store_lsed(
            Lsed {
                nes: LSSE_SIZE as u16,
                ..lsed
            },
            lsea,
        )?;

        let new_cr15 = (lsea + LSSE_SIZE) as u32 & CR15_LSEA;
        self.regs
            .set_cr_l(15, self.regs.cr_l(15) & !CR15_LSEA | new_cr15);
        Ok(())
    }

    /// Locate the descriptor of the current state entry, `back` entries
    /// down from the top.
    pub fn locate_stack_entry(&mut self, back: usize) -> Result<(u64, Lsed), Fault> {
        let mut lsea = u64::from(self.regs.cr_l(15) & CR15_LSEA);
        let mut lsed = self.fetch_lsed(lsea)?;
        Self::check_state_entry(lsed)?;
        for _ in 0..back {
            lsea -= LSSE_SIZE;
            lsed = self.fetch_lsed(lsea)?;
            Self::check_state_entry(lsed)?;
        }
        Ok((lsea, lsed))
    }

    fn check_state_entry(lsed: Lsed) -> Result<(), Fault> {
        match lsed.uet & LSED_UET_ET {
            LSED_UET_BAKR | LSED_UET_PC => Ok(()),
            LSED_UET_HDR | LSED_UET_TLR => Err(Fault(PGM_STACK_EMPTY)),
            _ => Err(Fault(PGM_STACK_SPECIFICATION)),
        }
    }

    /// Pop the current state entry for Program Return.
    ///
    /// Nothing in the CPU context is modified; the staged state carries
    /// everything the caller commits after its own checks.
    pub fn program_return_unstack(&mut self) -> Result<StackState, Fault> {
        let lsea = u64::from(self.regs.cr_l(15) & CR15_LSEA);
        let lsed = self.fetch_lsed(lsea)?;

        let etype = lsed.uet & LSED_UET_ET;
        match etype {
            LSED_UET_BAKR | LSED_UET_PC => {}
            LSED_UET_HDR | LSED_UET_TLR => return Err(Fault(PGM_STACK_EMPTY)),
            _ => return Err(Fault(PGM_STACK_TYPE)),
        }
        if lsed.uet & LSED_UET_U != 0 {
            return Err(Fault(PGM_STACK_OPERATION));
        }

        let state = lsea - 160;
        let mut gr = [0u32; 16];
        let mut ar = [0u32; 16];
        for r in 0..16 {
            gr[r] = self.stack_fetch4(state + r as u64 * 4)?;
            ar[r] = self.stack_fetch4(state + 64 + r as u64 * 4)?;
        }
        let w = self.stack_fetch4(state + 128)?;
        let (pkm, sasn) = ((w >> 16) as u16, w as u16);
        let w = self.stack_fetch4(state + 132)?;
        let (eax, pasn) = ((w >> 16) as u16, w as u16);
        let hi = self.stack_fetch4(state + 136)?;
        let lo = self.stack_fetch4(state + 140)?;
        let mut psw_bytes = [0u8; 8];
        psw_bytes[..4].copy_from_slice(&hi.to_be_bytes());
        psw_bytes[4..].copy_from_slice(&lo.to_be_bytes());

        // The previous entry's descriptor sits just below this state.
        let prev = lsea - LSSE_SIZE;
        let alsed_abs = self.stack_abs(prev, true)?;

        Ok(StackState {
            etype,
            gr,
            ar,
            pkm,
            sasn,
            eax,
            pasn,
            psw_bytes,
            new_cr15: prev as u32 & CR15_LSEA,
            alsed_abs,
        })
    }

    /// EREG: load GR and AR `r1`-`r2` (wrapping) from the current entry.
    pub fn unstack_registers(&mut self, lsea: u64, r1: usize, r2: usize) -> Result<(), Fault> {
        let state = lsea - 160;
        let mut r = r1;
        loop {
            let gr = self.stack_fetch4(state + r as u64 * 4)?;
            let ar = self.stack_fetch4(state + 64 + r as u64 * 4)?;
            self.regs.set_gr_l(r, gr);
            self.regs.ar[r] = ar;
            if r == r2 {
                break;
            }
            r = (r + 1) & 15;
        }
        Ok(())
    }

    /// ESTA: one doubleword of stacked state, by extraction code 0-3.
    pub fn extract_stacked_state(&mut self, lsea: u64, code: u8) -> Result<(u32, u32), Fault> {
        let addr = lsea - 160 + 128 + u64::from(code) * 8;
        Ok((self.stack_fetch4(addr)?, self.stack_fetch4(addr + 4)?))
    }

    /// MSTA: replace the modifiable area of the current entry with an
    /// even/odd register pair.
    pub fn modify_stacked_state(&mut self, lsea: u64, hi: u32, lo: u32) -> Result<(), Fault> {
        let addr = lsea - 160 + 152;
        self.stack_store4(hi, addr)?;
        self.stack_store4(lo, addr + 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::real_cpu;

    /// An empty stack section at 0x6000: a header entry whose LSED sits
    /// at 0x6008 with plenty of free space.
    fn setup_stack(cpu: &mut Cpu) {
        let stor = cpu.sysblk.storage();
        let lsed0 = u32::from(LSED_UET_HDR) << 24 | 0x0700; // rfs = 0x700
        stor.store_fullword_absolute(lsed0, 0x6008);
        stor.store_fullword_absolute(0, 0x600C);
        cpu.regs.set_cr_l(15, 0x6008);
    }

    #[test]
    fn bakr_entry_forms_and_advances_cr15() {
        let mut cpu = real_cpu(0x10_0000);
        setup_stack(&mut cpu);
        cpu.regs.set_gr_l(5, 0xAAAA_BBBB);
        cpu.regs.ar[5] = 0x1111_2222;
        cpu.form_stack_entry(LSED_UET_BAKR, 0x8040_0000, 0x0041_0000, 0)
            .expect("stack entry");
        // CR15 moved up one entry.
        assert_eq!(cpu.regs.cr_l(15) & CR15_LSEA, 0x6008 + 168);
        // GR5 and AR5 captured in the state area at 0x6010.
        let stor = cpu.sysblk.storage();
        assert_eq!(stor.fetch_fullword_absolute(0x6010 + 5 * 4), 0xAAAA_BBBB);
        assert_eq!(stor.fetch_fullword_absolute(0x6010 + 64 + 5 * 4), 0x1111_2222);
        // Old header LSED now chains forward.
        assert_eq!(stor.fetch_fullword_absolute(0x600C) >> 16, 168);
    }

    #[test]
    fn stack_full_when_no_room() {
        let mut cpu = real_cpu(0x10_0000);
        let stor = cpu.sysblk.storage();
        stor.store_fullword_absolute(u32::from(LSED_UET_HDR) << 24 | 100, 0x6008);
        cpu.regs.set_cr_l(15, 0x6008);
        let err = cpu
            .form_stack_entry(LSED_UET_BAKR, 0, 0, 0)
            .expect_err("full");
        assert_eq!(err, Fault(PGM_STACK_FULL));
    }

    #[test]
    fn unstack_restores_what_bakr_stacked() {
        let mut cpu = real_cpu(0x10_0000);
        setup_stack(&mut cpu);
        cpu.regs.set_gr_l(7, 0xDEAD_BEEF);
        cpu.regs.set_cr_l(3, 0xFFFF_0042); // PKM | SASN
        cpu.regs.set_cr_l(4, 0x0001_0042); // AX | PASN
        cpu.form_stack_entry(LSED_UET_BAKR, 0x0040_1000, 0, 0)
            .expect("stack entry");
        cpu.regs.set_gr_l(7, 0);
        let state = cpu.program_return_unstack().expect("unstack");
        assert_eq!(state.etype, LSED_UET_BAKR);
        assert_eq!(state.gr[7], 0xDEAD_BEEF);
        assert_eq!(state.pkm, 0xFFFF);
        assert_eq!(state.sasn, 0x0042);
        assert_eq!(state.pasn, 0x0042);
        assert_eq!(state.new_cr15, 0x6008);
        // The stacked PSW image carries the return address.
        let ia = u32::from_be_bytes([
            state.psw_bytes[4],
            state.psw_bytes[5],
            state.psw_bytes[6],
            state.psw_bytes[7],
        ]);
        assert_eq!(ia & 0x7FFF_FFFF, 0x0040_1000);
    }

    #[test]
    fn unstack_on_header_is_stack_empty() {
        let mut cpu = real_cpu(0x10_0000);
        setup_stack(&mut cpu);
        let err = cpu.program_return_unstack().expect_err("empty");
        assert_eq!(err, Fault(PGM_STACK_EMPTY));
    }

    #[test]
    fn esta_and_msta_reach_the_state_areas() {
        let mut cpu = real_cpu(0x10_0000);
        setup_stack(&mut cpu);
        cpu.form_stack_entry(LSED_UET_PC, 0x1000, 0x2000, 0x0042_0007)
            .expect("stack entry");
        let (lsea, lsed) = cpu.locate_stack_entry(0).expect("locate");
        assert_eq!(lsed.uet & LSED_UET_ET, LSED_UET_PC);
        // Code 2: called-space identification doubleword.
        let (hi, _lo) = cpu.extract_stacked_state(lsea, 2).expect("esta");
        assert_eq!(hi, 0x2000); // calla word at +144
        cpu.modify_stacked_state(lsea, 0x1234_5678, 0x9ABC_DEF0)
            .expect("msta");
        let (hi, lo) = cpu.extract_stacked_state(lsea, 3).expect("esta");
        assert_eq!((hi, lo), (0x1234_5678, 0x9ABC_DEF0));
    }

    #[test]
    fn locate_walks_back_entries() {
        let mut cpu = real_cpu(0x10_0000);
        setup_stack(&mut cpu);
        cpu.form_stack_entry(LSED_UET_BAKR, 0x1000, 0, 0).expect("first");
        cpu.form_stack_entry(LSED_UET_PC, 0x2000, 0x30, 0).expect("second");
        let (top, _) = cpu.locate_stack_entry(0).expect("top");
        let (below, lsed) = cpu.locate_stack_entry(1).expect("below");
        assert_eq!(top - below, LSSE_SIZE);
        assert_eq!(lsed.uet & LSED_UET_ET, LSED_UET_BAKR);
    }
}
