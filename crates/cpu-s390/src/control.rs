//! Privileged and semi-privileged control instructions.
//!
//! The control transfers (PC, PR, PT, BSA, BSG, SSAR, LASP) are state-
//! machine transitions over CR1/CR3/CR4/CR5/CR7/CR8/CR13 and the PSW;
//! each serializes at entry and exit. The rest of the module covers
//! system-mask and key manipulation, storage-key instructions, the
//! address-space control, translation-purge instructions, timekeeping
//! and the cross-space move family.

use s390_storage::{STORKEY_BADFRM, STORKEY_CHANGE, STORKEY_REF, apply_prefixing};

use crate::arch::{
    ALET_PRI_LIST, ALET_PRIMARY, ALET_SECONDARY, ASTE0_BASE, ASTE0_INVALID, ASTE1_AX, ATE_PRIMARY,
    ATE_SECONDARY, CR0_ASF, CR0_EXT_AUTH, CR0_LOW_PROT, CR0_PAGE_SIZE, CR0_PAGE_SZ_2K,
    CR0_PAGE_SZ_4K, CR0_SEG_SIZE, CR0_SEG_SZ_1M, CR0_SEG_SZ_64K, CR0_SEC_SPACE, CR0_SSM_SUPP,
    CR0_TRAN_ESA390, CR0_TRAN_FMT, CR2_DUCTO, CR5_PASTEO, CR5_SSLINK, CR12_ASNTRACE, CR12_BRTRACE,
    CR14_ASN_TRAN, DUCT0_BASTEO, DUCT1_SA, DUCT1_SSASTEO, DUCT8_AMODE, DUCT8_IA, DUCT9_KEY,
    DUCT9_PKM, DUCT9_PROB, DUCT9_RA, ETE0_AKM, ETE0_ASN, ETE1_AMODE, ETE1_EIA, ETE1_PROB,
    ETE3_EKM, ETE4_C, ETE4_E, ETE4_EEAX, ETE4_EK, ETE4_K, ETE4_M, ETE4_S, ETE4_T, LTE_ETL,
    LTE_ETO, LTE_INVALID, PAGETAB_INV_2K, PAGETAB_INV_4K, PAGETAB_INVALID, PC_EX, PC_LX,
    PSA_STFL, SEGTAB_370_PTO, SEGTAB_PTO, STD_GROUP, STD_SAEVENT, STD_SSEVENT, STFL_ESAME_ACTIVE,
    STFL_ESAME_INSTALLED, STFL_N3, TEA_PROTADDR, TEA_SSEVENT,
};
use crate::cpu::{ArchMode, Cpu};
use crate::dat::{AccType, Space};
use crate::decode::{rre, rs, rx, s, si, sse, ss_rr};
use crate::fault::{
    Fault, PGM_ADDRESSING, PGM_EX_TRANSLATION, PGM_LX_TRANSLATION,
    PGM_PC_TRANSLATION_SPECIFICATION, PGM_PRIMARY_AUTHORITY, PGM_PRIVILEGED_OPERATION,
    PGM_PROTECTION, PGM_SECONDARY_AUTHORITY, PGM_SPACE_SWITCH_EVENT, PGM_SPECIAL_OPERATION,
    PGM_SPECIFICATION, PGM_TRANSLATION_SPECIFICATION,
};
use crate::regs::{AsMode, PSW_PERMODE, Psw};
use crate::stack::{LSED_UET_BAKR, LSED_UET_PC};
use s390_system::BroadcastKind;

impl Cpu {
    /// True if the PSW-key mask permits `key` in problem state.
    fn pkm_allows(&self, key: u8) -> bool {
        self.regs.pkm() & (0x8000 >> key) != 0
    }

    /// Linkage-table designation: CR5 directly, or PASTE word 3 when the
    /// ASF control is on.
    fn fetch_ltd(&mut self) -> Result<(u32, u32), Fault> {
        if self.regs.cr_l(0) & CR0_ASF == 0 {
            Ok((self.regs.cr_l(5), 0))
        } else {
            let pasteo = self.regs.cr_l(5) & CR5_PASTEO;
            let abs = apply_prefixing(u64::from(pasteo), self.prefix);
            if abs >= self.mainsize() {
                return Err(Fault(PGM_ADDRESSING));
            }
            Ok((
                self.sysblk.storage().fetch_fullword_absolute(abs + 12),
                pasteo,
            ))
        }
    }

    // === System mask and PSW key ===

    /// 80: SSM - Set System Mask.
    pub fn exec_ssm(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        if self.regs.cr_l(0) & CR0_SSM_SUPP != 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let mask = self.vfetchb(addr, Space::Ar(b2 as u8))?;
        self.psw.sysmask = mask;
        if self.psw.ecmode && self.psw.sysmask & 0xB8 != 0 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        self.recheck_interrupts();
        Ok(())
    }

    /// AC: STNSM - Store Then And System Mask.
    pub fn exec_stnsm(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (i2, addr, b1) = si(self, inst);
        self.priv_check()?;
        self.vstoreb(self.psw.sysmask, addr, Space::Ar(b1 as u8))?;
        self.psw.sysmask &= i2;
        Ok(())
    }

    /// AD: STOSM - Store Then Or System Mask.
    pub fn exec_stosm(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (i2, addr, b1) = si(self, inst);
        self.priv_check()?;
        self.vstoreb(self.psw.sysmask, addr, Space::Ar(b1 as u8))?;
        self.psw.sysmask |= i2;
        if self.psw.ecmode && self.psw.sysmask & 0xB8 != 0 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        self.recheck_interrupts();
        Ok(())
    }

    /// B20A: SPKA - Set PSW Key From Address.
    pub fn exec_spka(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, _) = s(self, inst);
        let key = (addr as u8 & 0xF0) >> 4;
        if self.psw.prob && !self.pkm_allows(key) {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        self.psw.pkey = key;
        Ok(())
    }

    /// B20B: IPK - Insert PSW Key.
    pub fn exec_ipk(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let _ = s(self, inst);
        if self.psw.prob && self.regs.cr_l(0) & CR0_EXT_AUTH == 0 {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        let val = self.regs.gr_l(2) & 0xFFFF_FF00 | u32::from(self.psw.pkey) << 4;
        self.regs.set_gr_l(2, val);
        Ok(())
    }

    // === PSW and control registers ===

    /// 82: LPSW - Load PSW.
    pub fn exec_lpsw(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        self.perform_serialization();
        let mut img = [0u8; 8];
        self.vfetchc(&mut img, addr, Space::Ar(b2 as u8))?;
        self.psw = Psw::from_esa_bytes(img)?;
        self.recheck_interrupts();
        self.perform_serialization();
        Ok(())
    }

    /// B7: LCTL - Load Control.
    pub fn exec_lctl(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        self.priv_check()?;
        Self::fw_check(addr)?;
        let mut r = r1;
        let mut a = addr;
        let mut touched_translation = false;
        loop {
            let value = self.vfetch4(a, Space::Ar(b2 as u8))?;
            self.regs.set_cr_l(r, value);
            if matches!(r, 0 | 1 | 2 | 5 | 7 | 8 | 13 | 14) {
                touched_translation = true;
            }
            if r == r3 {
                break;
            }
            r = (r + 1) & 15;
            a += 4;
        }
        // A reload of any translation-relevant CR drops the lookasides.
        if touched_translation {
            self.purge_tlb();
            self.purge_alb();
        }
        self.recheck_interrupts();
        Ok(())
    }

    /// B6: STCTL - Store Control.
    pub fn exec_stctl(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        self.priv_check()?;
        Self::fw_check(addr)?;
        let mut buf = Vec::with_capacity(64);
        let mut r = r1;
        loop {
            buf.extend_from_slice(&self.regs.cr_l(r).to_be_bytes());
            if r == r3 {
                break;
            }
            r = (r + 1) & 15;
        }
        self.vstorec(&buf, addr, Space::Ar(b2 as u8))
    }

    // === Real-address instructions ===

    /// B1: LRA - Load Real Address.
    pub fn exec_lra(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        self.priv_check()?;
        match self.translate_addr(addr, Space::Ar(b2 as u8), AccType::Lra) {
            Ok(t) => {
                self.regs.set_gr_l(r1, t.raddr as u32);
                self.psw.cc = 0;
            }
            Err(f) => match f.cc {
                Some(4) => {
                    self.regs.set_gr_l(r1, u32::from(f.code));
                    self.psw.cc = 3;
                }
                Some(cc) => {
                    self.regs.set_gr_l(r1, f.entry as u32);
                    self.psw.cc = cc;
                }
                None => return Err(f.into()),
            },
        }
        Ok(())
    }

    /// B24B: LURA - Load Using Real Address.
    pub fn exec_lura(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.priv_check()?;
        let addr = u64::from(self.regs.gr_l(r2)) & self.psw.address_wrap();
        Self::fw_check(addr)?;
        let value = self.vfetch4(addr, Space::Real)?;
        self.regs.set_gr_l(r1, value);
        Ok(())
    }

    /// B246: STURA - Store Using Real Address.
    pub fn exec_stura(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.priv_check()?;
        let addr = u64::from(self.regs.gr_l(r2)) & self.psw.address_wrap();
        Self::fw_check(addr)?;
        self.vstore4(self.regs.gr_l(r1), addr, Space::Real)
    }

    // === Storage keys ===

    /// B229: ISKE - Insert Storage Key Extended.
    pub fn exec_iske(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.priv_check()?;
        let abs = self.real_block_abs(u64::from(self.regs.gr_l(r2)), 0xFFF)?;
        let key = self.sysblk.storage().key(abs);
        let val = self.regs.gr_l(r1) & 0xFFFF_FF00 | u32::from(key & 0xFE);
        self.regs.set_gr_l(r1, val);
        Ok(())
    }

    /// B22B: SSKE - Set Storage Key Extended.
    pub fn exec_sske(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.priv_check()?;
        self.perform_serialization();
        let abs = self.real_block_abs(u64::from(self.regs.gr_l(r2)), 0xFFF)?;
        let key = self.regs.gr_l(r1) as u8 & !STORKEY_BADFRM;
        // 2 KiB key granularity: a 4 KiB frame carries two keys.
        for half in [0u64, 0x800] {
            let old = self.sysblk.storage().key(abs + half);
            self.sysblk
                .storage()
                .set_key(abs + half, old & STORKEY_BADFRM | key);
        }
        // Stale access decisions may be cached with the old key.
        self.purge_tlb();
        self.perform_serialization();
        Ok(())
    }

    /// B22A: RRBE - Reset Reference Bit Extended.
    pub fn exec_rrbe(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (_r1, r2) = rre(inst);
        self.priv_check()?;
        let abs = self.real_block_abs(u64::from(self.regs.gr_l(r2)), 0xFFF)?;
        let mut old = 0;
        for half in [0u64, 0x800] {
            old |= self.sysblk.storage().and_key(abs + half, !STORKEY_REF);
        }
        self.psw.cc = u8::from(old & STORKEY_REF != 0) << 1 | u8::from(old & STORKEY_CHANGE != 0);
        Ok(())
    }

    /// B223: IVSK - Insert Virtual Storage Key.
    pub fn exec_ivsk(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        if self.psw.real_mode() {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if self.psw.prob && self.regs.cr_l(0) & CR0_EXT_AUTH == 0 {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        let addr = u64::from(self.regs.gr_l(r2)) & self.psw.address_wrap();
        let t = self
            .translate_addr(addr, Space::Ar(r2 as u8), AccType::Ivsk)
            .map_err(Fault::from)?;
        let abs = apply_prefixing(t.raddr, self.prefix);
        if abs >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let key = self.sysblk.storage().key(abs);
        let val = self.regs.gr_l(r1) & 0xFFFF_FF00 | u32::from(key & 0xF8);
        self.regs.set_gr_l(r1, val);
        Ok(())
    }

    /// Real block address → absolute, bounds-checked.
    fn real_block_abs(&self, real: u64, blockmask: u64) -> Result<u64, Fault> {
        let real = real & self.psw.address_wrap() & !blockmask;
        let abs = apply_prefixing(real, self.prefix);
        if abs >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        Ok(abs)
    }

    /// B22C: TB - Test Block.
    pub fn exec_tb(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (_r1, r2) = rre(inst);
        self.priv_check()?;
        let real = u64::from(self.regs.gr_l(r2)) & self.psw.address_wrap() & !0xFFF;
        self.perform_serialization();
        if real == 0 && self.regs.cr_l(0) & CR0_LOW_PROT != 0 {
            self.tea = real & TEA_PROTADDR;
            self.excarid = 0;
            return Err(Fault(PGM_PROTECTION));
        }
        let abs = apply_prefixing(real, self.prefix);
        if abs >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        self.sysblk.storage().clear_span(abs, 4096);
        self.psw.cc = u8::from(self.sysblk.storage().key(abs) & STORKEY_BADFRM != 0);
        self.perform_serialization();
        self.regs.set_gr_l(0, 0);
        Ok(())
    }

    // === Address-space control ===

    /// B219/B279: SAC/SACF - Set Address Space Control.
    pub fn exec_sac(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, _) = s(self, inst);
        if inst[1] == 0x19 {
            self.perform_serialization();
        }
        let mode = (addr >> 8) as u8 & 0xF;
        if self.psw.real_mode() || self.regs.cr_l(0) & CR0_SEC_SPACE == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if mode == 3 && self.psw.prob {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        if mode == 2 && self.regs.cr_l(0) & CR0_ASF == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if mode > 3 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let oldmode = self.psw.asmode;
        // Encoded as in the operand: 0=primary, 1=secondary, 2=AR, 3=home.
        let newmode = match mode {
            1 => AsMode::Secondary,
            2 => AsMode::AccessRegister,
            3 => AsMode::Home,
            _ => AsMode::Primary,
        };
        self.psw.asmode = newmode;
        let crossed_home = (oldmode == AsMode::Home) != (newmode == AsMode::Home);
        if crossed_home
            && (self.regs.cr_l(1) & STD_SSEVENT != 0
                || self.regs.cr_l(13) & STD_SSEVENT != 0
                || self.psw.sysmask & PSW_PERMODE != 0)
        {
            self.tea = if newmode == AsMode::Home {
                let mut tea = u64::from(self.regs.pasn());
                if self.regs.cr_l(1) & STD_SSEVENT != 0 {
                    tea |= TEA_SSEVENT;
                }
                tea
            } else if self.regs.cr_l(13) & STD_SSEVENT != 0 {
                TEA_SSEVENT
            } else {
                0
            };
            return Err(Fault(PGM_SPACE_SWITCH_EVENT));
        }
        if inst[1] == 0x19 {
            self.perform_serialization();
        }
        Ok(())
    }

    /// B224: IAC - Insert Address Space Control.
    pub fn exec_iac(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, _) = rre(inst);
        if self.psw.real_mode() {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if self.psw.prob && self.regs.cr_l(0) & CR0_EXT_AUTH == 0 {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        // Same encoding SAC consumes.
        let mode = match self.psw.asmode {
            AsMode::Primary => 0,
            AsMode::Secondary => 1,
            AsMode::AccessRegister => 2,
            AsMode::Home => 3,
        };
        self.psw.cc = mode;
        let val = self.regs.gr_l(r1) & 0xFFFF_00FF | u32::from(mode) << 8;
        self.regs.set_gr_l(r1, val);
        Ok(())
    }

    /// B226: EPAR - Extract Primary ASN.
    pub fn exec_epar(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, _) = rre(inst);
        self.extraction_check()?;
        self.regs.set_gr_l(r1, u32::from(self.regs.pasn()));
        Ok(())
    }

    /// B227: ESAR - Extract Secondary ASN.
    pub fn exec_esar(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, _) = rre(inst);
        self.extraction_check()?;
        self.regs.set_gr_l(r1, u32::from(self.regs.sasn()));
        Ok(())
    }

    fn extraction_check(&self) -> Result<(), Fault> {
        if self.psw.real_mode() {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if self.psw.prob && self.regs.cr_l(0) & CR0_EXT_AUTH == 0 {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        Ok(())
    }

    // === Lookaside purges ===

    /// B20D: PTLB - Purge TLB.
    pub fn exec_ptlb(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let _ = s(self, inst);
        self.priv_check()?;
        self.purge_tlb();
        Ok(())
    }

    /// B248: PALB - Purge ALB.
    pub fn exec_palb(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let _ = rre(inst);
        self.priv_check()?;
        self.purge_alb();
        Ok(())
    }

    /// B221: IPTE - Invalidate Page Table Entry.
    ///
    /// Sets the invalid bit in the designated PTE, then guarantees that no
    /// CPU retains a TLB entry for the invalidated frame before completing.
    pub fn exec_ipte(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.priv_check()?;
        self.perform_serialization();

        let cr0 = self.regs.cr_l(0);
        let pte = if self.arch == ArchMode::S370 {
            let pagesz_4k = cr0 & CR0_PAGE_SIZE == CR0_PAGE_SZ_4K;
            let seg_1m = cr0 & CR0_SEG_SIZE == CR0_SEG_SZ_1M;
            if (cr0 & CR0_PAGE_SIZE != CR0_PAGE_SZ_2K && !pagesz_4k)
                || (cr0 & CR0_SEG_SIZE != CR0_SEG_SZ_64K && !seg_1m)
            {
                return Err(Fault(PGM_TRANSLATION_SPECIFICATION));
            }
            let px = u64::from(self.regs.gr_l(r2));
            let offset = if seg_1m {
                if pagesz_4k {
                    (px & 0x000F_F000) >> 11
                } else {
                    (px & 0x000F_F800) >> 10
                }
            } else if pagesz_4k {
                (px & 0x0000_F000) >> 11
            } else {
                (px & 0x0000_F800) >> 10
            };
            let raddr =
                (u64::from(self.regs.gr_l(r1) & SEGTAB_370_PTO) + offset) & 0x00FF_FFFF;
            let invbit = if pagesz_4k {
                PAGETAB_INV_4K
            } else {
                PAGETAB_INV_2K
            };
            let pte = self.vfetch2(raddr, Space::Real)?;
            self.vstore2(pte | invbit, raddr, Space::Real)?;
            u32::from(pte)
        } else {
            if cr0 & CR0_TRAN_FMT != CR0_TRAN_ESA390 {
                return Err(Fault(PGM_TRANSLATION_SPECIFICATION));
            }
            let raddr = (u64::from(self.regs.gr_l(r1) & SEGTAB_PTO)
                + ((u64::from(self.regs.gr_l(r2)) & 0x000F_F000) >> 10))
                & 0x7FFF_FFFF;
            let pte = self.vfetch4(raddr, Space::Real)?;
            self.vstore4(pte | PAGETAB_INVALID, raddr, Space::Real)?;
            pte
        };

        // Drop matching local entries, then quiesce the peers.
        self.invalidate_tlb_pfra(pte);
        if self.sysblk.numcpu() > 1 {
            self.sysblk
                .synchronize_broadcast(self.cpuad, BroadcastKind::Ptlb);
        }

        self.perform_serialization();
        Ok(())
    }

    // === Prefix, CPU identification, facilities ===

    /// B210: SPX - Set Prefix.
    pub fn exec_spx(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::fw_check(addr)?;
        self.perform_serialization();
        let new = u64::from(self.vfetch4(addr, Space::Ar(b2 as u8))? & 0x7FFF_F000);
        if new >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        self.prefix = new;
        self.sysblk.set_prefix(self.cpuad, new);
        self.purge_tlb();
        self.purge_alb();
        self.perform_serialization();
        Ok(())
    }

    /// B211: STPX - Store Prefix.
    pub fn exec_stpx(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::fw_check(addr)?;
        self.vstore4(self.prefix as u32, addr, Space::Ar(b2 as u8))
    }

    /// B212: STAP - Store CPU Address.
    pub fn exec_stap(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::hw_check(addr)?;
        self.vstore2(self.cpuad as u16, addr, Space::Ar(b2 as u8))
    }

    /// B202: STIDP - Store CPU ID.
    pub fn exec_stidp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let mut id = self.sysblk.cpuid;
        if id & 0x00F0_0000_0000_0000 == 0 {
            id |= (self.cpuad as u64 & 0xF) << 52;
        }
        self.vstore8(id, addr, Space::Ar(b2 as u8))
    }

    /// B2B1: STFL - Store Facility List.
    pub fn exec_stfl(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let _ = s(self, inst);
        self.priv_check()?;
        let mut byte0 = STFL_N3 | STFL_ESAME_INSTALLED;
        if self.arch == ArchMode::Esame {
            byte0 |= STFL_ESAME_ACTIVE;
        }
        let psa = apply_prefixing(0, self.prefix);
        self.sysblk
            .storage()
            .store_fullword_absolute(u32::from(byte0) << 24, psa + PSA_STFL);
        Ok(())
    }

    // === Timekeeping ===

    /// B204: SCK - Set Clock.
    pub fn exec_sck(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let value = self.vfetch8(addr, Space::Ar(b2 as u8))? & !0xFFF;
        self.sysblk.set_tod(value);
        self.psw.cc = 0;
        Ok(())
    }

    /// B205: STCK - Store Clock.
    pub fn exec_stck(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.perform_serialization();
        let tod = self.sysblk.read_tod();
        self.vstore8(tod, addr, Space::Ar(b2 as u8))?;
        self.psw.cc = 0;
        Ok(())
    }

    /// B206: SCKC - Set Clock Comparator.
    pub fn exec_sckc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let value = self.vfetch8(addr, Space::Ar(b2 as u8))? & !0xFFF;
        self.sysblk.set_clock_comparator(self.cpuad, value);
        Ok(())
    }

    /// B207: STCKC - Store Clock Comparator.
    pub fn exec_stckc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let value = self.sysblk.clock_comparator(self.cpuad);
        self.vstore8(value, addr, Space::Ar(b2 as u8))
    }

    /// B208: SPT - Set CPU Timer.
    pub fn exec_spt(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let value = self.vfetch8(addr, Space::Ar(b2 as u8))? as i64;
        self.sysblk.set_cpu_timer(self.cpuad, value);
        Ok(())
    }

    /// B209: STPT - Store CPU Timer.
    pub fn exec_stpt(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        let value = self.sysblk.cpu_timer(self.cpuad) as u64;
        self.vstore8(value, addr, Space::Ar(b2 as u8))
    }

    // === Test instructions ===

    /// E501: TPROT - Test Protection.
    pub fn exec_tprot(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr1, b1, addr2, _) = sse(self, inst);
        self.priv_check()?;
        let (raddr, private, protect) = if self.psw.real_mode() {
            (addr1, false, false)
        } else {
            match self.translate_addr(addr1, Space::Ar(b1 as u8), AccType::Tprot) {
                Ok(t) => (t.raddr, t.private, t.protect),
                // Any translation exception is condition code 3, and the
                // protection tests are skipped.
                Err(f) if f.cc.is_some() => {
                    self.psw.cc = 3;
                    return Ok(());
                }
                Err(f) => return Err(f.into()),
            }
        };
        let aaddr = apply_prefixing(raddr, self.prefix);
        if aaddr >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let akey = (addr2 as u8 & 0xF0) >> 4;
        let skey = self.sysblk.storage().key(aaddr);
        self.psw.cc = if self.is_fetch_protected(addr1, skey, akey, private) {
            2
        } else if self.is_store_protected(addr1, skey, akey, private, protect) {
            1
        } else {
            0
        };
        Ok(())
    }

    /// B24C: TAR - Test Access.
    pub fn exec_tar(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        if self.regs.cr_l(0) & CR0_ASF == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let alet = self.regs.ar[r1];
        self.psw.cc = match alet {
            ALET_PRIMARY => 0,
            ALET_SECONDARY => 3,
            _ => {
                let eax = (self.regs.gr_l(r2) >> 16) as u16;
                match self.translate_alet(alet, eax, AccType::Tar) {
                    Ok(_) => {
                        if alet & ALET_PRI_LIST != 0 {
                            2
                        } else {
                            1
                        }
                    }
                    Err(x) if x.hard => return Err(x.into()),
                    Err(_) => 3,
                }
            }
        };
        Ok(())
    }

    // === Tracing ===

    /// 99: TRACE.
    pub fn exec_trace(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        self.priv_check()?;
        Self::fw_check(addr)?;
        let operand = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        if let Some(newcr12) = self.trace_explicit(r1, r3, operand)? {
            self.perform_serialization();
            self.regs.set_cr_l(12, newcr12);
        }
        Ok(())
    }

    // === Control transfers ===

    /// B25A: BSA - Branch and Set Authority.
    pub fn exec_bsa(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        if self.regs.cr_l(0) & CR0_ASF == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_BRTRACE != 0 && r2 != 0 {
            let target = self.regs.gr_l(r2);
            newcr12 = Some(self.trace_br(target & 0x8000_0000 != 0, target)?);
        }

        let ducto = u64::from(self.regs.cr_l(2) & CR2_DUCTO);
        if ducto < 512 && self.regs.cr_l(0) & CR0_LOW_PROT != 0 {
            self.tea = ducto & TEA_PROTADDR;
            self.excarid = 0;
            return Err(Fault(PGM_PROTECTION));
        }
        let ducto = apply_prefixing(ducto, self.prefix);
        if ducto >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let duct9 = self.sysblk.storage().fetch_fullword_absolute(ducto + 36);

        if duct9 & DUCT9_RA == 0 {
            // Base-authority state: capture state, reduce authority.
            if r2 == 0 {
                return Err(Fault(PGM_SPECIAL_OPERATION));
            }
            let key = (self.regs.gr_l(r1) >> 4) as u8 & 0xF;
            if self.psw.prob && !self.pkm_allows(key) {
                return Err(Fault(PGM_PRIVILEGED_OPERATION));
            }
            let mut save8 = self.psw.ia as u32 & DUCT8_IA;
            if self.psw.amode {
                save8 |= DUCT8_AMODE;
            }
            let mut save9 = self.regs.cr_l(3) & DUCT9_PKM | u32::from(self.psw.pkey) << 4;
            if self.psw.prob {
                save9 |= DUCT9_PROB;
            }
            save9 |= DUCT9_RA;
            let stor = self.sysblk.storage();
            stor.store_fullword_absolute(save8, ducto + 32);
            stor.store_fullword_absolute(save9, ducto + 36);

            self.psw.pkey = key;
            let cr3 = self.regs.cr_l(3) & !DUCT9_PKM | self.regs.gr_l(r1) & DUCT9_PKM;
            self.regs.set_cr_l(3, cr3);
            self.psw.prob = true;
            let target = self.regs.gr_l(r2);
            if target & 0x8000_0000 != 0 {
                self.psw.amode = true;
                self.psw.ia = u64::from(target & 0x7FFF_FFFF);
            } else {
                self.psw.amode = false;
                self.psw.ia = u64::from(target & 0x00FF_FFFF);
            }
        } else {
            // Reduced-authority state: restore from the save area.
            if r2 != 0 {
                return Err(Fault(PGM_SPECIAL_OPERATION));
            }
            let duct8 = self.sysblk.storage().fetch_fullword_absolute(ducto + 32);
            if r1 != 0 {
                let mut ret = self.psw.ia as u32;
                if self.psw.amode {
                    ret |= 0x8000_0000;
                }
                self.regs.set_gr_l(r1, ret);
            }
            self.psw.ia = u64::from(duct8 & DUCT8_IA);
            self.psw.amode = duct8 & DUCT8_AMODE != 0;
            let cr3 = self.regs.cr_l(3) & !DUCT9_PKM | duct9 & DUCT9_PKM;
            self.regs.set_cr_l(3, cr3);
            self.psw.pkey = (duct9 & DUCT9_KEY) as u8 >> 4;
            self.psw.prob = duct9 & DUCT9_PROB != 0;
            self.sysblk
                .storage()
                .store_fullword_absolute(duct9 & !DUCT9_RA, ducto + 36);
            if self.psw.ia & 1 != 0 || (!self.psw.amode && self.psw.ia > 0x00FF_FFFF) {
                self.psw.ilc = 0;
                return Err(Fault(PGM_SPECIFICATION));
            }
        }

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }
        Ok(())
    }

    /// B258: BSG - Branch in Subspace Group.
    pub fn exec_bsg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        if self.psw.real_mode() || self.regs.cr_l(0) & CR0_ASF == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let alet = if r2 == 0 { 0 } else { self.regs.ar[r2] };
        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_ASNTRACE != 0 {
            newcr12 = Some(self.trace_bsg(alet)?);
        } else if self.regs.cr_l(12) & CR12_BRTRACE != 0 {
            let target = self.regs.gr_l(r2);
            newcr12 = Some(self.trace_br(target & 0x8000_0000 != 0, target)?);
        }

        let ducto = u64::from(self.regs.cr_l(2) & CR2_DUCTO);
        if ducto < 512 && self.regs.cr_l(0) & CR0_LOW_PROT != 0 {
            self.tea = ducto & TEA_PROTADDR;
            self.excarid = 0;
            return Err(Fault(PGM_PROTECTION));
        }
        let ducto = apply_prefixing(ducto, self.prefix);
        if ducto >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let stor = self.sysblk.storage();
        let duct0 = stor.fetch_fullword_absolute(ducto);
        let mut duct1 = stor.fetch_fullword_absolute(ducto + 4);
        let duct3 = stor.fetch_fullword_absolute(ducto + 12);

        // The current primary must be the DU's base space.
        if self.regs.cr_l(5) & CR5_PASTEO != duct0 & DUCT0_BASTEO {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }

        let dasteo;
        let dstd;
        let mut dastesn = 0;
        match alet {
            ALET_PRIMARY => {
                dasteo = duct0 & DUCT0_BASTEO;
                let abs = apply_prefixing(u64::from(dasteo), self.prefix);
                if abs >= self.mainsize() {
                    return Err(Fault(PGM_ADDRESSING));
                }
                dstd = self.sysblk.storage().fetch_fullword_absolute(abs + 8);
            }
            ALET_SECONDARY => {
                dasteo = duct1 & DUCT1_SSASTEO;
                if dasteo == 0 {
                    return Err(Fault(PGM_SPECIAL_OPERATION));
                }
                let abs = apply_prefixing(u64::from(dasteo), self.prefix);
                if abs >= self.mainsize() {
                    return Err(Fault(PGM_ADDRESSING));
                }
                let stor = self.sysblk.storage();
                let daste0 = stor.fetch_fullword_absolute(abs);
                dstd = stor.fetch_fullword_absolute(abs + 8);
                let daste5 = stor.fetch_fullword_absolute(abs + 20);
                if daste0 & ASTE0_INVALID != 0 {
                    return Err(Fault(crate::fault::PGM_ASTE_VALIDITY));
                }
                if daste5 != duct3 {
                    return Err(Fault(crate::fault::PGM_ASTE_SEQUENCE));
                }
                dastesn = daste5;
            }
            _ => {
                let art = self
                    .translate_alet(alet, 0, AccType::Bsg)
                    .map_err(Fault::from)?;
                dasteo = art.asteo;
                dstd = art.aste[2];
                dastesn = art.aste[5];
                // A foreign ASTE must be a subspace of this group or the
                // base space itself.
                if dasteo != duct0 & DUCT0_BASTEO
                    && (dstd & STD_GROUP == 0 || art.aste[0] & ASTE0_BASE == 0)
                {
                    return Err(Fault(PGM_SPECIAL_OPERATION));
                }
            }
        }

        // New primary STD: full replacement for the base space, subspace
        // replacement otherwise.
        if dasteo == duct0 & DUCT0_BASTEO {
            self.regs.set_cr_l(1, dstd);
        } else {
            let cr1 = self.regs.cr_l(1) & (STD_SSEVENT | STD_SAEVENT)
                | dstd & !(STD_SSEVENT | STD_SAEVENT);
            self.regs.set_cr_l(1, cr1);
        }

        let newia = self.regs.gr_l(r2);
        if r1 != 0 {
            let mut ret = self.psw.ia as u32;
            if self.psw.amode {
                ret |= 0x8000_0000;
            }
            self.regs.set_gr_l(r1, ret);
        }
        if newia & 0x8000_0000 != 0 {
            self.psw.amode = true;
            self.psw.ia = u64::from(newia & 0x7FFF_FFFF);
        } else {
            self.psw.amode = false;
            self.psw.ia = u64::from(newia & 0x00FF_FFFF);
        }

        // SSTD := PSTD, SASN := PASN.
        self.regs.set_cr_l(7, self.regs.cr_l(1));
        let cr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(self.regs.pasn());
        self.regs.set_cr_l(3, cr3);

        // Record the subspace state in the DUCT.
        let stor = self.sysblk.storage();
        if dasteo == duct0 & DUCT0_BASTEO {
            duct1 &= !DUCT1_SA;
            stor.store_fullword_absolute(duct1, ducto + 4);
        } else if alet == ALET_SECONDARY {
            duct1 |= DUCT1_SA;
            stor.store_fullword_absolute(duct1, ducto + 4);
        } else {
            stor.store_fullword_absolute(DUCT1_SA | dasteo, ducto + 4);
            stor.store_fullword_absolute(dastesn, ducto + 12);
        }

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }
        // Purge the lookasides: the primary space changed identity.
        self.purge_tlb();
        self.purge_alb();
        Ok(())
    }

    /// B240: BAKR - Branch and Stack.
    pub fn exec_bakr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        let retn = if r1 != 0 {
            let n = self.regs.gr_l(r1);
            if n & 0x8000_0000 == 0 { n & 0x00FF_FFFF } else { n }
        } else {
            let mut n = self.psw.ia as u32;
            if self.psw.amode {
                n |= 0x8000_0000;
            }
            n
        };
        let mut branch = if r2 != 0 {
            self.regs.gr_l(r2)
        } else {
            self.psw.ia as u32
        };
        if self.psw.amode {
            branch |= 0x8000_0000;
        } else {
            branch &= 0x00FF_FFFF;
        }

        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_BRTRACE != 0 && r2 != 0 {
            newcr12 = Some(self.trace_br(self.psw.amode, self.regs.gr_l(r2))?);
        }

        self.form_stack_entry(LSED_UET_BAKR, retn, branch, 0)?;

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }
        if r2 != 0 {
            self.psw.ia = u64::from(self.regs.gr_l(r2)) & self.psw.address_wrap();
        }
        Ok(())
    }

    /// B249: EREG - Extract Stacked Registers.
    pub fn exec_ereg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        let (lsea, _) = self.locate_stack_entry(0)?;
        self.unstack_registers(lsea, r1, r2)
    }

    /// B24A: ESTA - Extract Stacked State.
    pub fn exec_esta(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        let code = self.regs.gr_l(r2) as u8;
        if r1 & 1 != 0 || code > 3 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let (lsea, lsed) = self.locate_stack_entry(0)?;
        let (hi, lo) = self.extract_stacked_state(lsea, code)?;
        self.regs.set_gr_l(r1, hi);
        self.regs.set_gr_l(r1 + 1, lo);
        self.psw.cc = u8::from(lsed.uet & crate::stack::LSED_UET_ET == LSED_UET_PC);
        Ok(())
    }

    /// B247: MSTA - Modify Stacked State.
    pub fn exec_msta(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, _) = rre(inst);
        Self::even_check(r1)?;
        let (lsea, _) = self.locate_stack_entry(0)?;
        self.modify_stacked_state(lsea, self.regs.gr_l(r1), self.regs.gr_l(r1 + 1))
    }

    /// B218: PC - Program Call, basic and stacking.
    pub fn exec_pc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (pcnum, _) = s(self, inst);
        self.perform_serialization();
        self.perform_chkpt_sync();

        if self.psw.real_mode()
            || self.psw.asmode == AsMode::Secondary
            || self.psw.asmode == AsMode::Home
        {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let asf = self.regs.cr_l(0) & CR0_ASF != 0;
        let (ltd, mut pasteo) = self.fetch_ltd()?;

        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_ASNTRACE != 0 {
            newcr12 = Some(self.trace_pc(pcnum as u32)?);
        }

        if ltd & CR5_SSLINK == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }

        // Linkage-table lookup.
        let lto = ltd & crate::arch::CR5_LTO;
        let ltl = ltd & crate::arch::CR5_LTL;
        if ltl < (pcnum as u32 & PC_LX) >> 13 {
            self.tea = pcnum;
            return Err(Fault(PGM_LX_TRANSLATION));
        }
        let lte_addr = (u64::from(lto) + ((pcnum & u64::from(PC_LX)) >> 6)) & 0x7FFF_FFFF;
        if lte_addr >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let lte = self
            .sysblk
            .storage()
            .fetch_fullword_absolute(apply_prefixing(lte_addr, self.prefix));
        if lte & LTE_INVALID != 0 {
            self.tea = pcnum;
            return Err(Fault(PGM_LX_TRANSLATION));
        }

        // Entry-table lookup.
        let etl = lte & LTE_ETL;
        if etl < (pcnum as u32 & PC_EX) >> 2 {
            self.tea = pcnum;
            return Err(Fault(PGM_EX_TRANSLATION));
        }
        let mut ete_addr = u64::from(lte & LTE_ETO)
            + ((pcnum & u64::from(PC_EX)) << if asf { 5 } else { 4 });
        let numwords = if asf { 8 } else { 4 };
        let mut ete = [0u32; 8];
        for word in ete.iter_mut().take(numwords) {
            ete_addr &= 0x7FFF_FFFF;
            let abs = apply_prefixing(ete_addr, self.prefix);
            if abs >= self.mainsize() {
                return Err(Fault(PGM_ADDRESSING));
            }
            *word = self.sysblk.storage().fetch_fullword_absolute(abs);
            ete_addr += 4;
        }

        let stacking = ete[4] & ETE4_T != 0;
        if !stacking && self.psw.asmode == AsMode::AccessRegister {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if ete[1] & ETE1_AMODE == 0 && ete[1] & ETE1_EIA > 0x00FF_FFFF {
            return Err(Fault(PGM_PC_TRANSLATION_SPECIFICATION));
        }
        if self.psw.prob && self.regs.cr_l(3) & 0xFFFF_0000 & (ete[0] & ETE0_AKM) == 0 {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }

        // ASN translation for a space-switching call.
        let pasn = (ete[0] & ETE0_ASN) as u16;
        let (aste, pstd) = if pasn != 0 {
            if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 {
                return Err(Fault(PGM_SPECIAL_OPERATION));
            }
            let (o, a) = self.translate_asn(pasn).map_err(Fault::from)?;
            pasteo = o;
            let pstd = self.subspace_replace(a[2], o).map_err(Fault::from)?;
            (a, pstd)
        } else {
            ([0u32; 16], self.regs.cr_l(1))
        };

        let mut ssevent = false;
        if stacking {
            let csi = if pasn == 0 {
                0
            } else {
                u32::from(pasn) << 16 | aste[5] & 0xFFFF
            };
            let mut retn = self.psw.ia as u32;
            if self.psw.amode {
                retn |= 0x8000_0000;
            }
            self.form_stack_entry(LSED_UET_PC, retn, pcnum as u32, csi)?;

            self.psw.amode = ete[1] & ETE1_AMODE != 0;
            self.psw.ia = u64::from(ete[1] & ETE1_EIA);
            self.psw.prob = ete[1] & ETE1_PROB != 0;

            if ete[4] & ETE4_K != 0 {
                self.psw.pkey = ((ete[4] & ETE4_EK) >> 20) as u8;
            }
            let mut cr3 = self.regs.cr_l(3);
            if ete[4] & ETE4_M != 0 {
                cr3 &= 0x0000_FFFF;
            }
            cr3 |= ete[3] & ETE3_EKM;
            self.regs.set_cr_l(3, cr3);
            if ete[4] & ETE4_E != 0 {
                let cr8 = self.regs.cr_l(8) & 0x0000_FFFF | (ete[4] & ETE4_EEAX) << 16;
                self.regs.set_cr_l(8, cr8);
            }
            self.psw.asmode = if ete[4] & ETE4_C != 0 {
                AsMode::AccessRegister
            } else {
                AsMode::Primary
            };
            self.regs.set_gr_l(4, ete[2]);
        } else {
            // Basic PC: linkage information in GR14.
            let mut link = self.psw.ia as u32 | u32::from(self.psw.prob);
            if self.psw.amode {
                link |= 0x8000_0000;
            }
            self.regs.set_gr_l(14, link);

            self.psw.amode = ete[1] & ETE1_AMODE != 0;
            self.psw.ia = u64::from(ete[1] & ETE1_EIA);
            self.psw.prob = ete[1] & ETE1_PROB != 0;

            let gr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(self.regs.pasn());
            self.regs.set_gr_l(3, gr3);
            let cr3 = self.regs.cr_l(3) | ete[3] & ETE3_EKM;
            self.regs.set_cr_l(3, cr3);
            self.regs.set_gr_l(4, ete[2]);
        }

        if pasn == 0 {
            // PC to current primary.
            let cr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(self.regs.pasn());
            self.regs.set_cr_l(3, cr3);
            self.regs.set_cr_l(7, self.regs.cr_l(1));
        } else {
            // Space switch: old primary becomes the secondary.
            let cr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(self.regs.pasn());
            self.regs.set_cr_l(3, cr3);
            self.regs.set_cr_l(7, self.regs.cr_l(1));

            if self.regs.cr_l(1) & STD_SSEVENT != 0
                || aste[2] & STD_SSEVENT != 0
                || self.psw.sysmask & PSW_PERMODE != 0
            {
                self.tea = u64::from(self.regs.pasn());
                if self.regs.cr_l(1) & STD_SSEVENT != 0 {
                    self.tea |= TEA_SSEVENT;
                }
                ssevent = true;
            }

            self.regs
                .set_cr_l(4, aste[1] & ASTE1_AX | u32::from(pasn));
            self.regs.set_cr_l(1, pstd);
            self.regs
                .set_cr_l(5, if asf { pasteo } else { aste[3] });

            if stacking && ete[4] & ETE4_S != 0 {
                let cr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(self.regs.pasn());
                self.regs.set_cr_l(3, cr3);
                self.regs.set_cr_l(7, self.regs.cr_l(1));
            }
            self.purge_tlb();
            self.purge_alb();
        }

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }
        if ssevent {
            return Err(Fault(PGM_SPACE_SWITCH_EVENT));
        }
        self.perform_serialization();
        self.perform_chkpt_sync();
        Ok(())
    }

    /// 0101: PR - Program Return.
    pub fn exec_pr(&mut self) -> Result<(), Fault> {
        self.perform_serialization();
        self.perform_chkpt_sync();

        let oldpasn = self.regs.pasn();
        let state = self.program_return_unstack()?;
        let new_psw = Psw::from_esa_bytes(state.psw_bytes)?;

        // Stage the control-register changes; nothing commits until all
        // the checks are done.
        let mut new_cr1 = self.regs.cr_l(1);
        let mut new_cr4 = self.regs.cr_l(4) & 0xFFFF_0000 | u32::from(state.pasn);
        let mut new_cr5 = self.regs.cr_l(5);
        let mut new_cr7 = self.regs.cr_l(7);
        let mut newcr12 = None;
        let mut ssevent = false;

        if state.etype == LSED_UET_PC {
            if self.regs.cr_l(12) & CR12_ASNTRACE != 0 {
                newcr12 = Some(self.trace_pr(
                    state.pasn,
                    new_psw.amode,
                    new_psw.ia as u32,
                    new_psw.prob,
                )?);
            }

            if state.pasn != oldpasn {
                if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 {
                    return Err(Fault(PGM_SPECIAL_OPERATION));
                }
                let (pasteo, aste) = self.translate_asn(state.pasn).map_err(Fault::from)?;

                if self.regs.cr_l(1) & STD_SSEVENT != 0 || aste[2] & STD_SSEVENT != 0 {
                    self.tea = u64::from(oldpasn);
                    if self.regs.cr_l(1) & STD_SSEVENT != 0 {
                        self.tea |= TEA_SSEVENT;
                    }
                    ssevent = true;
                }

                new_cr4 = aste[1] & ASTE1_AX | u32::from(state.pasn);
                new_cr5 = pasteo;
                new_cr1 = self
                    .subspace_replace(aste[2], pasteo)
                    .map_err(Fault::from)?;
            }

            if state.sasn == state.pasn {
                new_cr7 = new_cr1;
            } else {
                if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 {
                    return Err(Fault(PGM_SPECIAL_OPERATION));
                }
                let (sasteo, aste) = self.translate_asn(state.sasn).map_err(Fault::from)?;
                let ax = (new_cr4 >> 16) as u16;
                if !self.authorize_asn(ax, &aste, ATE_SECONDARY)? {
                    self.tea = u64::from(state.sasn);
                    return Err(Fault(PGM_SECONDARY_AUTHORITY));
                }
                new_cr7 = self
                    .subspace_replace(aste[2], sasteo)
                    .map_err(Fault::from)?;
            }
        }

        // Commit: registers 2-14, the PSW, and the control registers.
        for r in 2..=14 {
            self.regs.set_gr_l(r, state.gr[r]);
            self.regs.ar[r] = state.ar[r];
        }
        self.psw = new_psw;
        self.regs.set_cr_l(1, new_cr1);
        self.regs
            .set_cr_l(3, u32::from(state.pkm) << 16 | u32::from(state.sasn));
        self.regs.set_cr_l(4, new_cr4);
        self.regs.set_cr_l(5, new_cr5);
        self.regs.set_cr_l(7, new_cr7);
        let cr8 = self.regs.cr_l(8) & 0x0000_FFFF | u32::from(state.eax) << 16;
        self.regs.set_cr_l(8, cr8);
        self.regs
            .set_cr_l(15, self.regs.cr_l(15) & !crate::stack::CR15_LSEA | state.new_cr15);
        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }

        // Clear the next-entry size of the now-current entry.
        self.sysblk
            .storage()
            .store_halfword_absolute(0, state.alsed_abs + 4);

        if state.pasn != oldpasn {
            self.purge_tlb();
            self.purge_alb();
        }
        if ssevent {
            return Err(Fault(PGM_SPACE_SWITCH_EVENT));
        }
        self.perform_serialization();
        self.perform_chkpt_sync();
        self.recheck_interrupts();
        Ok(())
    }

    /// B228: PT - Program Transfer.
    pub fn exec_pt(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.perform_serialization();
        self.perform_chkpt_sync();

        if self.psw.real_mode() || self.psw.asmode != AsMode::Primary {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }

        let pkm = (self.regs.gr_l(r1) >> 16) as u16;
        let pasn = self.regs.gr_l(r1) as u16;

        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_ASNTRACE != 0 {
            newcr12 = Some(self.trace_pt(pasn, self.regs.gr_l(r2))?);
        }

        let amode = self.regs.gr_l(r2) & 0x8000_0000 != 0;
        let ia = self.regs.gr_l(r2) & 0x7FFF_FFFE;
        let prob = self.regs.gr_l(r2) & 1 != 0;

        let (ltd, _) = self.fetch_ltd()?;
        if ltd & CR5_SSLINK == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        if self.psw.prob && !prob {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        if !amode && ia > 0x00FF_FFFF {
            return Err(Fault(PGM_SPECIFICATION));
        }

        let mut ssevent = false;
        let pstd;
        if pasn != self.regs.pasn() {
            if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 {
                return Err(Fault(PGM_SPECIAL_OPERATION));
            }
            let (pasteo, aste) = self.translate_asn(pasn).map_err(Fault::from)?;
            let ax = self.regs.ax();
            if !self.authorize_asn(ax, &aste, ATE_PRIMARY)? {
                self.tea = u64::from(pasn);
                return Err(Fault(PGM_PRIMARY_AUTHORITY));
            }
            pstd = self
                .subspace_replace(aste[2], pasteo)
                .map_err(Fault::from)?;

            if self.regs.cr_l(1) & STD_SSEVENT != 0 || pstd & STD_SSEVENT != 0 {
                self.tea = u64::from(self.regs.pasn());
                if self.regs.cr_l(1) & STD_SSEVENT != 0 {
                    self.tea |= TEA_SSEVENT;
                }
                ssevent = true;
            }

            self.regs.set_cr_l(1, pstd);
            self.regs
                .set_cr_l(4, aste[1] & ASTE1_AX | u32::from(pasn));
            self.regs.set_cr_l(
                5,
                if self.regs.cr_l(0) & CR0_ASF != 0 {
                    pasteo
                } else {
                    aste[3]
                },
            );
            self.purge_tlb();
            self.purge_alb();
        } else {
            pstd = self.regs.cr_l(1);
        }

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }

        self.psw.amode = amode;
        self.psw.ia = u64::from(ia);
        self.psw.prob = prob;

        // AND the PKM with the supplied mask, replace the SASN.
        let cr3 = self.regs.cr_l(3) & (u32::from(pkm) << 16) & 0xFFFF_0000 | u32::from(pasn);
        self.regs.set_cr_l(3, cr3);
        self.regs.set_cr_l(7, pstd);

        if ssevent {
            return Err(Fault(PGM_SPACE_SWITCH_EVENT));
        }
        self.perform_serialization();
        self.perform_chkpt_sync();
        Ok(())
    }

    /// B225: SSAR - Set Secondary ASN.
    pub fn exec_ssar(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, _) = rre(inst);
        self.perform_serialization();
        self.perform_chkpt_sync();

        if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 || self.psw.real_mode() {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let sasn = self.regs.gr_l(r1) as u16;

        let mut newcr12 = None;
        if self.regs.cr_l(12) & CR12_ASNTRACE != 0 {
            newcr12 = Some(self.trace_ssar(sasn)?);
        }

        let sstd = if sasn == self.regs.pasn() {
            self.regs.cr_l(1)
        } else {
            let (sasteo, aste) = self.translate_asn(sasn).map_err(Fault::from)?;
            let ax = self.regs.ax();
            if !self.authorize_asn(ax, &aste, ATE_SECONDARY)? {
                self.tea = u64::from(sasn);
                return Err(Fault(PGM_SECONDARY_AUTHORITY));
            }
            self.subspace_replace(aste[2], sasteo)
                .map_err(Fault::from)?
        };

        if let Some(cr12) = newcr12 {
            self.regs.set_cr_l(12, cr12);
        }
        let cr3 = self.regs.cr_l(3) & 0xFFFF_0000 | u32::from(sasn);
        self.regs.set_cr_l(3, cr3);
        self.regs.set_cr_l(7, sstd);
        self.purge_tlb();

        self.perform_serialization();
        self.perform_chkpt_sync();
        Ok(())
    }

    /// E500: LASP - Load Address Space Parameters.
    pub fn exec_lasp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr1, b1, func, _) = sse(self, inst);
        self.priv_check()?;
        if self.regs.cr_l(14) & CR14_ASN_TRAN == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        Self::dw_check(addr1)?;

        let dreg = self.vfetch8(addr1, Space::Ar(b1 as u8))?;
        let pkm_d = (dreg >> 48) as u16;
        let sasn_d = (dreg >> 32) as u16;
        let ax_d = (dreg >> 16) as u16;
        let pasn_d = dreg as u16;

        let pstd;
        let ltd_or_pasteo;
        let mut ax;
        // Function bit 29: force PASN translation.
        if func & 0x4 != 0 || pasn_d != self.regs.pasn() {
            let (pasteo, aste) = match self.translate_asn(pasn_d) {
                Ok(v) => v,
                Err(x) if x.hard => return Err(x.into()),
                Err(_) => {
                    self.psw.cc = 1;
                    return Ok(());
                }
            };
            ax = ((aste[1] & ASTE1_AX) >> 16) as u16;
            pstd = match self.subspace_replace(aste[2], pasteo) {
                Ok(v) => v,
                Err(x) if x.hard => return Err(x.into()),
                Err(_) => {
                    self.psw.cc = 1;
                    return Ok(());
                }
            };
            ltd_or_pasteo = if self.regs.cr_l(0) & CR0_ASF != 0 {
                pasteo
            } else {
                aste[3]
            };
            if self.regs.cr_l(1) & STD_SSEVENT != 0 || aste[2] & STD_SSEVENT != 0 {
                self.psw.cc = 3;
                return Ok(());
            }
        } else {
            pstd = self.regs.cr_l(1);
            ltd_or_pasteo = self.regs.cr_l(5);
            ax = self.regs.ax();
        }

        // Function bit 30: use the operand AX.
        if func & 0x2 != 0 {
            ax = ax_d;
        }

        let sstd;
        if sasn_d == pasn_d {
            sstd = pstd;
        } else if func & 0x4 == 0 && func & 0x1 != 0 && sasn_d == self.regs.sasn() {
            sstd = self.regs.cr_l(7);
        } else {
            let (sasteo, aste) = match self.translate_asn(sasn_d) {
                Ok(v) => v,
                Err(x) if x.hard => return Err(x.into()),
                Err(_) => {
                    self.psw.cc = 2;
                    return Ok(());
                }
            };
            // Function bit 31 suppresses the authorization test.
            if func & 0x1 == 0 && !self.authorize_asn(ax, &aste, ATE_SECONDARY)? {
                self.psw.cc = 2;
                return Ok(());
            }
            sstd = match self.subspace_replace(aste[2], sasteo) {
                Ok(v) => v,
                Err(x) if x.hard => return Err(x.into()),
                Err(_) => {
                    self.psw.cc = 2;
                    return Ok(());
                }
            };
        }

        self.regs.set_cr_l(1, pstd);
        self.regs
            .set_cr_l(3, u32::from(pkm_d) << 16 | u32::from(sasn_d));
        self.regs
            .set_cr_l(4, u32::from(ax) << 16 | u32::from(pasn_d));
        self.regs.set_cr_l(5, ltd_or_pasteo);
        self.regs.set_cr_l(7, sstd);
        self.purge_tlb();
        self.purge_alb();
        self.psw.cc = 0;
        Ok(())
    }

    // === Cross-space moves ===

    /// DA: MVCP - Move to Primary.
    pub fn exec_mvcp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr1, _, addr2, _) = ss_rr(self, inst);
        self.move_across_spaces(r1, r3, addr1, Space::Primary, addr2, Space::Secondary, true)
    }

    /// DB: MVCS - Move to Secondary.
    pub fn exec_mvcs(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr1, _, addr2, _) = ss_rr(self, inst);
        self.move_across_spaces(r1, r3, addr1, Space::Secondary, addr2, Space::Primary, false)
    }

    /// The MVCP/MVCS engine: length in `r1`, secondary-side key in `r3`.
    #[allow(clippy::too_many_arguments)]
    fn move_across_spaces(
        &mut self,
        r1: usize,
        r3: usize,
        addr1: u64,
        space1: Space,
        addr2: u64,
        space2: Space,
        to_primary: bool,
    ) -> Result<(), Fault> {
        if self.psw.real_mode() || self.regs.cr_l(0) & CR0_SEC_SPACE == 0 {
            return Err(Fault(PGM_SPECIAL_OPERATION));
        }
        let key3 = (self.regs.gr_l(r3) >> 4) as u8 & 0xF;
        if self.psw.prob && !self.pkm_allows(key3) {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        let len = u64::from(self.regs.gr_l(r1));
        self.psw.cc = if len > 256 { 3 } else { 0 };
        let len = len.min(256) as usize;
        // The untrusted key guards the secondary-space operand.
        let (key1, key2) = if to_primary {
            (self.psw.pkey, key3)
        } else {
            (key3, self.psw.pkey)
        };
        self.move_chars(addr1, space1, key1, addr2, space2, key2, len)
    }

    /// D9: MVCK - Move with Key.
    pub fn exec_mvck(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr1, b1, addr2, b2) = ss_rr(self, inst);
        let key3 = (self.regs.gr_l(r3) >> 4) as u8 & 0xF;
        if self.psw.prob && !self.pkm_allows(key3) {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        let len = u64::from(self.regs.gr_l(r1));
        self.psw.cc = if len > 256 { 3 } else { 0 };
        let len = len.min(256) as usize;
        self.move_chars(
            addr1,
            Space::Ar(b1 as u8),
            self.psw.pkey,
            addr2,
            Space::Ar(b2 as u8),
            key3,
            len,
        )
    }

    /// E50E: MVCSK - Move with Source Key.
    pub fn exec_mvcsk(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr1, b1, addr2, b2) = sse(self, inst);
        self.move_with_one_key(addr1, b1, addr2, b2, true)
    }

    /// E50F: MVCDK - Move with Destination Key.
    pub fn exec_mvcdk(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (addr1, b1, addr2, b2) = sse(self, inst);
        self.move_with_one_key(addr1, b1, addr2, b2, false)
    }

    fn move_with_one_key(
        &mut self,
        addr1: u64,
        b1: usize,
        addr2: u64,
        b2: usize,
        source_key: bool,
    ) -> Result<(), Fault> {
        let key = (self.regs.gr_l(1) >> 4) as u8 & 0xF;
        if self.psw.prob && !self.pkm_allows(key) {
            return Err(Fault(PGM_PRIVILEGED_OPERATION));
        }
        let len = (self.regs.gr_l(0) as usize & 0xFF) + 1;
        let (key1, key2) = if source_key {
            (self.psw.pkey, key)
        } else {
            (key, self.psw.pkey)
        };
        self.move_chars(
            addr1,
            Space::Ar(b1 as u8),
            key1,
            addr2,
            Space::Ar(b2 as u8),
            key2,
            len,
        )
    }

    // === DIAGNOSE ===

    /// 83: DIAGNOSE - host-hypervisor hook.
    pub fn exec_diagnose(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, code, _) = rs(self, inst);
        self.priv_check()?;
        if let Some(diag) = self.diag.take() {
            diag.diagnose(
                &self.sysblk,
                code as u32 & 0x00FF_FFFF,
                self.regs.gr_l(r1),
                self.regs.gr_l(r3),
            );
            self.diag = Some(diag);
        }
        Ok(())
    }
}
