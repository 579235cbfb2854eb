//! Dynamic address translation: virtual → real → absolute.
//!
//! Five translation formats: S/370 with 64 KiB or 1 MiB segments crossed
//! with 2 KiB or 4 KiB pages, and the single ESA/390 format (1 MiB
//! segments, 4 KiB pages). The ESAME personality runs the ESA/390 tables.
//!
//! The per-CPU TLB holds 256 entries, direct-mapped by virtual-address
//! bits 12-19. LRA bypasses it so the walk result is always current.
//! Protection (storage key, low-address, page/ALE) is applied by the
//! logical-to-absolute wrapper, which every operand access funnels
//! through.

use std::sync::Arc;

use s390_storage::{STORKEY_CHANGE, STORKEY_FETCH, STORKEY_KEY, STORKEY_REF, apply_prefixing};

use crate::arch::{
    CR0_FETCH_OVRD, CR0_LOW_PROT, CR0_PAGE_SIZE, CR0_PAGE_SZ_2K, CR0_PAGE_SZ_4K, CR0_SEG_SIZE,
    CR0_SEG_SZ_1M, CR0_SEG_SZ_64K, CR0_STORE_OVRD, CR0_TRAN_ESA390, CR0_TRAN_FMT, CR8_EAX,
    PAGETAB_INV_2K, PAGETAB_INV_4K, PAGETAB_INVALID, PAGETAB_PFRA, PAGETAB_PFRA_2K,
    PAGETAB_PFRA_4K, PAGETAB_PROT, PAGETAB_RESV, PAGETAB_RSV_2K, SEGTAB_370_CMN, SEGTAB_370_INVL,
    SEGTAB_370_PROT, SEGTAB_370_PTL, SEGTAB_370_PTO, SEGTAB_370_RSV, SEGTAB_COMMON, SEGTAB_INVALID,
    SEGTAB_PTL,
    SEGTAB_PTO, SEGTAB_RESV, STD_370_STL, STD_370_STO, STD_PRIVATE, STD_STL, STD_STO, TEA_EFFADDR,
    TEA_PROT_AP, TEA_PROTADDR, TEA_SECADDR, TEA_ST_ARMODE, TEA_ST_HOME, TEA_ST_PRIMARY,
    TEA_ST_SECNDRY,
};
use crate::cpu::{ArchMode, Cpu, TLB_SIZE};
use crate::fault::{
    Fault, PGM_ADDRESSING, PGM_PAGE_TRANSLATION, PGM_PROTECTION, PGM_SEGMENT_TRANSLATION,
    PGM_SPECIFICATION, PGM_TRANSLATION_SPECIFICATION,
};
use crate::regs::AsMode;

/// Which address space an operand reference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Access register `n`; meaningful only in AR mode, where AR0 is
    /// treated as holding ALET 0.
    Ar(u8),
    /// Bypass translation: the address is already real.
    Real,
    /// Force the primary space (MVCP, MVCS).
    Primary,
    /// Force the secondary space.
    Secondary,
}

/// Access type of a storage reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccType {
    Read,
    Write,
    InstFetch,
    /// LRA: no TLB use, exceptions become condition codes.
    Lra,
    /// IVSK key extraction.
    Ivsk,
    /// TPROT: exceptions become condition codes.
    Tprot,
    /// Linkage-stack access: always the home space.
    Stack,
    /// TAR: ART only, special ALET handling.
    Tar,
    /// BSG special ART: no sequence/authority checks.
    Bsg,
}

/// One TLB entry. A probe hits when the entry is valid, the virtual page
/// matches, and either the STD matches or the entry is common (and the
/// STD is not private).
#[derive(Debug, Clone, Copy, Default)]
pub struct TlbEntry {
    pub std: u32,
    pub vaddr: u64,
    pub pte: u32,
    pub common: bool,
    pub valid: bool,
}

/// Successful translation.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    /// Real address.
    pub raddr: u64,
    /// The STD named a private address space.
    pub private: bool,
    /// Page protection or ALE fetch-only protection applies.
    pub protect: bool,
    /// Which segment table translated the address (TEA bits 30-31).
    pub stid: u64,
}

/// Failed translation.
///
/// `cc` carries the LRA-style condition code for conditions the caller may
/// report instead of program-checking (invalid entry, length violation,
/// ALET error); `None` marks conditions that always program-check
/// (addressing, translation specification).
#[derive(Debug, Clone, Copy)]
pub struct TranFault {
    /// Program-interruption code.
    pub code: u16,
    /// LRA condition code, if reportable.
    pub cc: Option<u8>,
    /// Real address of the table entry, for LRA's R1 result.
    pub entry: u64,
}

impl TranFault {
    const fn hard(code: u16) -> Self {
        Self {
            code,
            cc: None,
            entry: 0,
        }
    }
}

impl From<TranFault> for Fault {
    fn from(t: TranFault) -> Self {
        Self(t.code)
    }
}

impl Cpu {
    // === TLB maintenance ===

    /// Invalidate every TLB entry of this CPU.
    pub fn purge_tlb(&mut self) {
        self.tlb = [TlbEntry::default(); TLB_SIZE];
    }

    /// Test accessor: is the TLB entry for `vaddr` valid?
    #[must_use]
    pub fn tlb_entry_valid(&self, vaddr: u64) -> bool {
        self.tlb[(vaddr >> 12 & 0xFF) as usize].valid
    }

    /// Count of valid TLB entries (test visibility).
    #[must_use]
    pub fn tlb_valid_count(&self) -> usize {
        self.tlb.iter().filter(|e| e.valid).count()
    }

    /// Drop every local TLB entry whose PFRA matches `pte`'s frame.
    pub fn invalidate_tlb_pfra(&mut self, pte: u32) {
        for entry in &mut self.tlb {
            if entry.valid && entry.pte & PAGETAB_PFRA == pte & PAGETAB_PFRA {
                entry.valid = false;
            }
        }
    }

    // === Effective STD selection ===

    /// Pick the STD for this access, running ART when in AR mode.
    ///
    /// Returns `(std, stid, protect)`.
    fn effective_std(
        &mut self,
        space: Space,
        acctype: AccType,
    ) -> Result<(u32, u64, bool), TranFault> {
        if acctype == AccType::InstFetch {
            return Ok(if self.psw.asmode == AsMode::Home {
                (self.regs.cr_l(13), TEA_ST_HOME, false)
            } else {
                (self.regs.cr_l(1), TEA_ST_PRIMARY, false)
            });
        }
        if acctype == AccType::Stack {
            return Ok((self.regs.cr_l(13), TEA_ST_HOME, false));
        }
        match space {
            Space::Primary => Ok((self.regs.cr_l(1), TEA_ST_PRIMARY, false)),
            Space::Secondary => Ok((self.regs.cr_l(7), TEA_ST_SECNDRY, false)),
            Space::Ar(arn) if self.psw.asmode == AsMode::AccessRegister => {
                let alet = if arn == 0 { 0 } else { self.regs.ar[arn as usize] };
                match alet {
                    0 => Ok((self.regs.cr_l(1), TEA_ST_PRIMARY, false)),
                    1 => Ok((self.regs.cr_l(7), TEA_ST_SECNDRY, false)),
                    _ => {
                        let eax = ((self.regs.cr_l(8) & CR8_EAX) >> 16) as u16;
                        match self.translate_alet_cached(alet, eax, acctype) {
                            Ok((_asteo, std, protect)) => Ok((std, TEA_ST_ARMODE, protect)),
                            Err(x) => {
                                self.excarid = arn;
                                Err(TranFault {
                                    code: x.code,
                                    cc: if x.hard { None } else { Some(4) },
                                    entry: 0,
                                })
                            }
                        }
                    }
                }
            }
            _ => Ok(match self.psw.asmode {
                AsMode::Primary | AsMode::AccessRegister => {
                    (self.regs.cr_l(1), TEA_ST_PRIMARY, false)
                }
                AsMode::Secondary => (self.regs.cr_l(7), TEA_ST_SECNDRY, false),
                AsMode::Home => (self.regs.cr_l(13), TEA_ST_HOME, false),
            }),
        }
    }

    // === Translation proper ===

    /// Translate a virtual address to a real address.
    pub fn translate_addr(
        &mut self,
        vaddr: u64,
        space: Space,
        acctype: AccType,
    ) -> Result<Translation, TranFault> {
        let (std, stid, mut protect) = self.effective_std(space, acctype)?;
        let result = match self.arch {
            ArchMode::S370 => self.translate_s370(vaddr, std, acctype, &mut protect),
            ArchMode::Esa390 | ArchMode::Esame => {
                self.translate_esa390(vaddr, std, acctype, &mut protect)
            }
        };
        match result {
            Ok((raddr, private)) => Ok(Translation {
                raddr,
                private,
                protect,
                stid,
            }),
            Err(mut fault) => {
                if fault.cc.is_some() {
                    self.set_tran_exception_address(vaddr, std, space);
                }
                if fault.code == PGM_ADDRESSING || fault.code == PGM_TRANSLATION_SPECIFICATION {
                    fault.cc = None;
                }
                Err(fault)
            }
        }
    }

    /// S/370 walk: 64 KiB/1 MiB segments, 2 KiB/4 KiB pages.
    fn translate_s370(
        &mut self,
        vaddr: u64,
        std: u32,
        acctype: AccType,
        protect: &mut bool,
    ) -> Result<(u64, bool), TranFault> {
        let cr0 = self.regs.cr_l(0);
        let pagesz_4k = cr0 & CR0_PAGE_SIZE == CR0_PAGE_SZ_4K;
        let seg_1m = cr0 & CR0_SEG_SIZE == CR0_SEG_SZ_1M;
        if (cr0 & CR0_PAGE_SIZE != CR0_PAGE_SZ_2K && !pagesz_4k)
            || (cr0 & CR0_SEG_SIZE != CR0_SEG_SZ_64K && !seg_1m)
        {
            return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
        }

        let page_mask: u64 = if pagesz_4k { 0x00FF_F000 } else { 0x00FF_F800 };
        let tlbx = (vaddr >> 12 & 0xFF) as usize;
        let use_tlb = acctype != AccType::Lra;
        let mut ste = 0u32;
        let pte: u16;

        let hit = use_tlb && {
            let e = &self.tlb[tlbx];
            e.valid && vaddr & page_mask == e.vaddr && (e.common || e.std == std)
        };
        if hit {
            pte = self.tlb[tlbx].pte as u16;
        } else {
            // Segment-table lookup.
            let mut sto = u64::from(std & STD_370_STO);
            let stl = std & STD_370_STL;
            sto += if seg_1m {
                (vaddr & 0x00F0_0000) >> 18
            } else {
                (vaddr & 0x00FF_0000) >> 14
            };
            if !seg_1m && ((vaddr << 4) as u32 & STD_370_STL) > stl {
                return Err(TranFault {
                    code: PGM_SEGMENT_TRANSLATION,
                    cc: Some(3),
                    entry: sto,
                });
            }
            if sto >= self.mainsize() {
                return Err(TranFault::hard(PGM_ADDRESSING));
            }
            let sto = apply_prefixing(sto, self.prefix);
            ste = self.sysblk.storage().fetch_fullword_absolute(sto);
            if ste & SEGTAB_370_INVL != 0 {
                return Err(TranFault {
                    code: PGM_SEGMENT_TRANSLATION,
                    cc: Some(1),
                    entry: sto,
                });
            }
            if ste & SEGTAB_370_RSV != 0 {
                return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
            }

            // Page-table lookup.
            let mut pto = u64::from(ste & SEGTAB_370_PTO);
            let ptl = (ste & SEGTAB_370_PTL) >> 28;
            pto += if seg_1m {
                if pagesz_4k {
                    (vaddr & 0x000F_F000) >> 11
                } else {
                    (vaddr & 0x000F_F800) >> 10
                }
            } else if pagesz_4k {
                (vaddr & 0x0000_F000) >> 11
            } else {
                (vaddr & 0x0000_F800) >> 10
            };
            let page_hi = if seg_1m {
                (vaddr & 0x000F_0000) >> 16
            } else {
                (vaddr & 0x0000_F000) >> 12
            } as u32;
            if page_hi > ptl {
                return Err(TranFault {
                    code: PGM_PAGE_TRANSLATION,
                    cc: Some(3),
                    entry: pto,
                });
            }
            if pto >= self.mainsize() {
                return Err(TranFault::hard(PGM_ADDRESSING));
            }
            let pto = apply_prefixing(pto, self.prefix);
            pte = self.sysblk.storage().fetch_halfword_absolute(pto);
            let invalid = if pagesz_4k {
                pte & PAGETAB_INV_4K != 0
            } else {
                pte & PAGETAB_INV_2K != 0
            };
            if invalid {
                return Err(TranFault {
                    code: PGM_PAGE_TRANSLATION,
                    cc: Some(2),
                    entry: pto,
                });
            }
            if !pagesz_4k && pte & PAGETAB_RSV_2K != 0 {
                return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
            }

            if use_tlb {
                self.tlb[tlbx] = TlbEntry {
                    std,
                    vaddr: vaddr & page_mask,
                    pte: u32::from(pte),
                    common: ste & SEGTAB_370_CMN != 0,
                    valid: true,
                };
            }
        }

        if ste & SEGTAB_370_PROT != 0 {
            *protect = true;
        }

        let raddr = if pagesz_4k {
            u64::from(pte & PAGETAB_PFRA_4K) << 8 | (vaddr & 0xFFF)
        } else {
            u64::from(pte & PAGETAB_PFRA_2K) << 8 | (vaddr & 0x7FF)
        };
        Ok((raddr, false))
    }

    /// ESA/390 walk: 1 MiB segments, 4 KiB pages.
    fn translate_esa390(
        &mut self,
        vaddr: u64,
        std: u32,
        acctype: AccType,
        protect: &mut bool,
    ) -> Result<(u64, bool), TranFault> {
        let private = std & STD_PRIVATE != 0;
        if self.regs.cr_l(0) & CR0_TRAN_FMT != CR0_TRAN_ESA390 {
            return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
        }

        let tlbx = (vaddr >> 12 & 0xFF) as usize;
        let use_tlb = acctype != AccType::Lra;
        let pte: u32;

        let hit = use_tlb && {
            let e = &self.tlb[tlbx];
            e.valid
                && vaddr & 0x7FFF_F000 == e.vaddr
                && (e.common || e.std == std)
                && !(e.common && private)
        };
        if hit {
            pte = self.tlb[tlbx].pte;
        } else {
            // Segment-table lookup.
            let mut sto = u64::from(std & STD_STO);
            let stl = std & STD_STL;
            sto += (vaddr & 0x7FF0_0000) >> 18;
            if sto >= self.mainsize() {
                return Err(TranFault::hard(PGM_ADDRESSING));
            }
            if (vaddr >> 24) as u32 > stl {
                return Err(TranFault {
                    code: PGM_SEGMENT_TRANSLATION,
                    cc: Some(3),
                    entry: sto,
                });
            }
            let sto = apply_prefixing(sto, self.prefix);
            let ste = self.sysblk.storage().fetch_fullword_absolute(sto);
            if ste & SEGTAB_INVALID != 0 {
                return Err(TranFault {
                    code: PGM_SEGMENT_TRANSLATION,
                    cc: Some(1),
                    entry: sto,
                });
            }
            if ste & SEGTAB_RESV != 0 {
                return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
            }
            if private && ste & SEGTAB_COMMON != 0 {
                return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
            }

            // Page-table lookup.
            let mut pto = u64::from(ste & SEGTAB_PTO);
            let ptl = ste & SEGTAB_PTL;
            pto += (vaddr & 0x000F_F000) >> 10;
            if pto >= self.mainsize() {
                return Err(TranFault::hard(PGM_ADDRESSING));
            }
            if ((vaddr & 0x000F_F000) >> 16) as u32 > ptl {
                return Err(TranFault {
                    code: PGM_PAGE_TRANSLATION,
                    cc: Some(3),
                    entry: pto,
                });
            }
            let pto = apply_prefixing(pto, self.prefix);
            pte = self.sysblk.storage().fetch_fullword_absolute(pto);
            if pte & PAGETAB_INVALID != 0 {
                // The expanded-storage hit (an MVPG-visible condition)
                // would be recognized here; no caller requests it.
                return Err(TranFault {
                    code: PGM_PAGE_TRANSLATION,
                    cc: Some(2),
                    entry: pto,
                });
            }
            if pte & PAGETAB_RESV != 0 {
                return Err(TranFault::hard(PGM_TRANSLATION_SPECIFICATION));
            }

            if use_tlb {
                self.tlb[tlbx] = TlbEntry {
                    std,
                    vaddr: vaddr & 0x7FFF_F000,
                    pte,
                    common: ste & SEGTAB_COMMON != 0,
                    valid: true,
                };
            }
        }

        if pte & PAGETAB_PROT != 0 {
            *protect = true;
        }

        Ok((u64::from(pte & PAGETAB_PFRA) | (vaddr & 0xFFF), private))
    }

    /// Form the translation-exception address for a reportable DAT fault.
    fn set_tran_exception_address(&mut self, vaddr: u64, std: u32, space: Space) {
        let mut tea = vaddr & TEA_EFFADDR;
        if std & STD_STO != self.regs.cr_l(1) & STD_STO {
            if std & STD_STO == self.regs.cr_l(7) & STD_STO {
                tea |= match self.psw.asmode {
                    AsMode::Primary | AsMode::Secondary => TEA_SECADDR | TEA_ST_SECNDRY,
                    _ => TEA_ST_SECNDRY,
                };
            } else if std & STD_STO == self.regs.cr_l(13) & STD_STO {
                tea |= TEA_ST_HOME;
            } else {
                tea |= TEA_ST_ARMODE;
            }
        }
        self.tea = tea;
        if self.psw.asmode == AsMode::AccessRegister {
            self.excarid = match space {
                Space::Ar(n) => n,
                _ => 0,
            };
        }
    }

    // === Protection ===

    /// Key-controlled and override-aware fetch-protection test.
    pub(crate) fn is_fetch_protected(&self, addr: u64, skey: u8, akey: u8, private: bool) -> bool {
        // Access key zero fetches anything.
        if akey == 0 {
            return false;
        }
        // Fetch-protection override: first 2 KiB of non-private spaces.
        if addr < 2048 && self.regs.cr_l(0) & CR0_FETCH_OVRD != 0 && !private {
            return false;
        }
        skey & STORKEY_FETCH != 0 && akey << 4 != skey & STORKEY_KEY
    }

    /// Store-protection test: low-address, ALE/page, then key-controlled.
    pub(crate) fn is_store_protected(
        &self,
        addr: u64,
        skey: u8,
        akey: u8,
        private: bool,
        protect: bool,
    ) -> bool {
        if addr < 512 && self.regs.cr_l(0) & CR0_LOW_PROT != 0 && !private {
            return true;
        }
        if protect {
            return true;
        }
        if akey == 0 {
            return false;
        }
        // Storage-protection override: key 9 accepts any store.
        if skey & STORKEY_KEY == 0x90 && self.regs.cr_l(0) & CR0_STORE_OVRD != 0 {
            return false;
        }
        akey << 4 != skey & STORKEY_KEY
    }

    // === Logical to absolute ===

    /// Route a logical access through DAT, prefixing and protection, and
    /// maintain the reference/change bits.
    ///
    /// `akey` is the 4-bit access key (normally the PSW key, an explicit
    /// key for the move-with-key family).
    pub fn logical_to_abs(
        &mut self,
        addr: u64,
        space: Space,
        acctype: AccType,
        akey: u8,
    ) -> Result<u64, Fault> {
        let (raddr, private, protect, stid) = if self.psw.real_mode() || space == Space::Real {
            (addr, false, false, TEA_ST_PRIMARY)
        } else {
            let t = self.translate_addr(addr, space, acctype)?;
            (t.raddr, t.private, t.protect, t.stid)
        };

        let aaddr = apply_prefixing(raddr, self.prefix);
        if aaddr >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }

        let stor = self.sysblk.storage();
        let skey = stor.key(aaddr);
        match acctype {
            AccType::Read | AccType::InstFetch => {
                if self.is_fetch_protected(addr, skey, akey, private) {
                    return Err(self.protection_exception(addr, space, stid, protect, false));
                }
                stor.or_key(aaddr, STORKEY_REF);
            }
            AccType::Write => {
                if self.is_store_protected(addr, skey, akey, private, protect) {
                    return Err(self.protection_exception(addr, space, stid, protect, true));
                }
                stor.or_key(aaddr, STORKEY_REF | STORKEY_CHANGE);
            }
            _ => {}
        }
        Ok(aaddr)
    }

    /// Record suppression-on-protection state and produce the fault.
    fn protection_exception(
        &mut self,
        addr: u64,
        space: Space,
        stid: u64,
        protect: bool,
        write: bool,
    ) -> Fault {
        self.tea = addr & TEA_PROTADDR | stid;
        if protect && write {
            self.tea |= TEA_PROT_AP;
        }
        self.excarid = match space {
            Space::Ar(n) => n,
            _ => 0,
        };
        Fault(PGM_PROTECTION)
    }

    // === Virtual-storage operand access ===

    /// Fetch one byte from a logical address.
    pub fn vfetchb(&mut self, addr: u64, space: Space) -> Result<u8, Fault> {
        let akey = self.psw.pkey;
        let abs = self.logical_to_abs(addr, space, AccType::Read, akey)?;
        Ok(self.sysblk.storage().fetch_byte_absolute(abs))
    }

    /// Fetch a halfword from a logical address, any alignment.
    pub fn vfetch2(&mut self, addr: u64, space: Space) -> Result<u16, Fault> {
        let mut b = [0u8; 2];
        self.vfetchc(&mut b, addr, space)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Fetch a fullword from a logical address, any alignment.
    pub fn vfetch4(&mut self, addr: u64, space: Space) -> Result<u32, Fault> {
        let mut b = [0u8; 4];
        self.vfetchc(&mut b, addr, space)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Fetch a doubleword from a logical address, any alignment.
    pub fn vfetch8(&mut self, addr: u64, space: Space) -> Result<u64, Fault> {
        let mut b = [0u8; 8];
        self.vfetchc(&mut b, addr, space)?;
        Ok(u64::from_be_bytes(b))
    }

    /// Store one byte at a logical address.
    pub fn vstoreb(&mut self, value: u8, addr: u64, space: Space) -> Result<(), Fault> {
        let akey = self.psw.pkey;
        let abs = self.logical_to_abs(addr, space, AccType::Write, akey)?;
        self.sysblk.storage().store_byte_absolute(value, abs);
        Ok(())
    }

    /// Store a halfword at a logical address, any alignment.
    pub fn vstore2(&mut self, value: u16, addr: u64, space: Space) -> Result<(), Fault> {
        self.vstorec(&value.to_be_bytes(), addr, space)
    }

    /// Store a fullword at a logical address, any alignment.
    pub fn vstore4(&mut self, value: u32, addr: u64, space: Space) -> Result<(), Fault> {
        self.vstorec(&value.to_be_bytes(), addr, space)
    }

    /// Store a doubleword at a logical address, any alignment.
    pub fn vstore8(&mut self, value: u64, addr: u64, space: Space) -> Result<(), Fault> {
        self.vstorec(&value.to_be_bytes(), addr, space)
    }

    /// Fetch 1-256 bytes from a logical operand, which may cross one
    /// 2 KiB protection frame.
    pub fn vfetchc(&mut self, dest: &mut [u8], addr: u64, space: Space) -> Result<(), Fault> {
        let akey = self.psw.pkey;
        let wrap = self.psw.address_wrap();
        let len = dest.len() as u64;
        let last = (addr + len - 1) & wrap;
        let abs1 = self.logical_to_abs(addr, space, AccType::Read, akey)?;
        let sysblk = Arc::clone(&self.sysblk);
        if addr & !0x7FF == last & !0x7FF {
            sysblk.storage().fetch_bytes_absolute(dest, abs1);
            return Ok(());
        }
        let len1 = (0x800 - (addr & 0x7FF)) as usize;
        let addr2 = (addr + len1 as u64) & wrap;
        let abs2 = self.logical_to_abs(addr2, space, AccType::Read, akey)?;
        sysblk
            .storage()
            .fetch_bytes_absolute(&mut dest[..len1], abs1);
        sysblk
            .storage()
            .fetch_bytes_absolute(&mut dest[len1..], abs2);
        Ok(())
    }

    /// Store 1-256 bytes at a logical operand. Both frames are access-
    /// checked before the first byte moves, so a faulting store updates
    /// nothing.
    pub fn vstorec(&mut self, src: &[u8], addr: u64, space: Space) -> Result<(), Fault> {
        let akey = self.psw.pkey;
        let wrap = self.psw.address_wrap();
        let len = src.len() as u64;
        let last = (addr + len - 1) & wrap;
        let abs1 = self.logical_to_abs(addr, space, AccType::Write, akey)?;
        let sysblk = Arc::clone(&self.sysblk);
        if addr & !0x7FF == last & !0x7FF {
            sysblk.storage().store_bytes_absolute(src, abs1);
            return Ok(());
        }
        let len1 = (0x800 - (addr & 0x7FF)) as usize;
        let addr2 = (addr + len1 as u64) & wrap;
        let abs2 = self.logical_to_abs(addr2, space, AccType::Write, akey)?;
        sysblk.storage().store_bytes_absolute(&src[..len1], abs1);
        sysblk.storage().store_bytes_absolute(&src[len1..], abs2);
        Ok(())
    }

    /// Fetch the next instruction (2, 4, or 6 bytes) from `addr`.
    pub fn instfetch(&mut self, dest: &mut [u8; 6], addr: u64) -> Result<(), Fault> {
        let wrap = self.psw.address_wrap();
        let addr = addr & wrap;
        if addr & 1 != 0 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let akey = self.psw.pkey;
        let abs = self.logical_to_abs(addr, Space::Ar(0), AccType::InstFetch, akey)?;
        let sysblk = Arc::clone(&self.sysblk);
        let first = ((0x800 - (addr & 0x7FF)) as usize).min(6);
        sysblk
            .storage()
            .fetch_bytes_absolute(&mut dest[..first], abs);
        let ilc = 2 * (1 + usize::from(dest[0] >= 0x40) + usize::from(dest[0] >= 0xC0));
        if ilc > first {
            let addr2 = (addr + first as u64) & wrap;
            let abs2 = self.logical_to_abs(addr2, Space::Ar(0), AccType::InstFetch, akey)?;
            sysblk
                .storage()
                .fetch_bytes_absolute(&mut dest[first..ilc], abs2);
        }
        Ok(())
    }

    /// Move `len` bytes between two logical operands with distinct spaces
    /// and access keys (the MVC/MVCP/MVCS/MVCK engine).
    ///
    /// Both operands are fully access-checked before any byte moves.
    pub fn move_chars(
        &mut self,
        addr1: u64,
        space1: Space,
        key1: u8,
        addr2: u64,
        space2: Space,
        key2: u8,
        len: usize,
    ) -> Result<(), Fault> {
        if len == 0 {
            return Ok(());
        }
        let wrap = self.psw.address_wrap();
        let mut buf = vec![0u8; len];

        // Source first; a fetch fault must precede any destination update.
        let last2 = (addr2 + len as u64 - 1) & wrap;
        let abs2 = self.logical_to_abs(addr2, space2, AccType::Read, key2)?;
        let sysblk = Arc::clone(&self.sysblk);
        if addr2 & !0x7FF == last2 & !0x7FF {
            sysblk.storage().fetch_bytes_absolute(&mut buf, abs2);
        } else {
            let len1 = (0x800 - (addr2 & 0x7FF)) as usize;
            let abs2b =
                self.logical_to_abs((addr2 + len1 as u64) & wrap, space2, AccType::Read, key2)?;
            sysblk
                .storage()
                .fetch_bytes_absolute(&mut buf[..len1], abs2);
            sysblk
                .storage()
                .fetch_bytes_absolute(&mut buf[len1..], abs2b);
        }

        let last1 = (addr1 + len as u64 - 1) & wrap;
        let abs1 = self.logical_to_abs(addr1, space1, AccType::Write, key1)?;
        if addr1 & !0x7FF == last1 & !0x7FF {
            sysblk.storage().store_bytes_absolute(&buf, abs1);
        } else {
            let len1 = (0x800 - (addr1 & 0x7FF)) as usize;
            let abs1b =
                self.logical_to_abs((addr1 + len1 as u64) & wrap, space1, AccType::Write, key1)?;
            sysblk.storage().store_bytes_absolute(&buf[..len1], abs1);
            sysblk.storage().store_bytes_absolute(&buf[len1..], abs1b);
        }
        Ok(())
    }

    /// Access-check a logical operand without transferring data.
    pub fn validate_operand(
        &mut self,
        addr: u64,
        space: Space,
        len: usize,
        acctype: AccType,
    ) -> Result<(), Fault> {
        let akey = self.psw.pkey;
        let wrap = self.psw.address_wrap();
        self.logical_to_abs(addr, space, acctype, akey)?;
        let last = (addr + len as u64 - 1) & wrap;
        if addr & !0x7FF != last & !0x7FF {
            self.logical_to_abs(last & !0x7FF, space, acctype, akey)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{esa_cpu_with_map, map_page};
    use s390_storage::STORKEY_FETCH;

    #[test]
    fn translates_mapped_page() {
        // 0x0010_0000 → 0x0020_0000 single-level ESA/390 tables.
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        let t = cpu
            .translate_addr(0x0010_0010, Space::Ar(0), AccType::Read)
            .expect("translation");
        assert_eq!(t.raddr, 0x0020_0010);
        assert!(!t.private);
        assert!(!t.protect);
    }

    #[test]
    fn translation_is_tlb_independent() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        let cold = cpu
            .translate_addr(0x0010_0123, Space::Ar(0), AccType::Read)
            .expect("cold translation")
            .raddr;
        assert!(cpu.tlb_entry_valid(0x0010_0123));
        let warm = cpu
            .translate_addr(0x0010_0123, Space::Ar(0), AccType::Read)
            .expect("warm translation")
            .raddr;
        assert_eq!(cold, warm);
    }

    #[test]
    fn lra_bypasses_tlb() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        let _ = cpu
            .translate_addr(0x0010_0000, Space::Ar(0), AccType::Lra)
            .expect("translation");
        assert!(!cpu.tlb_entry_valid(0x0010_0000));
    }

    #[test]
    fn invalid_segment_reports_cc1_and_tea() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        // Invalidate the STE for segment 1 (vaddr 0x0010_0000).
        let sto = u64::from(cpu.regs.cr_l(1) & STD_STO);
        let ste_addr = sto + 4;
        let ste = cpu.sysblk.storage().fetch_fullword_absolute(ste_addr);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(ste | SEGTAB_INVALID, ste_addr);
        cpu.purge_tlb();
        let err = cpu
            .translate_addr(0x0010_0000, Space::Ar(0), AccType::Read)
            .expect_err("segment fault");
        assert_eq!(err.code, PGM_SEGMENT_TRANSLATION);
        assert_eq!(err.cc, Some(1));
        assert_eq!(err.entry, ste_addr);
        assert_eq!(cpu.tea, 0x0010_0000);
    }

    #[test]
    fn invalid_page_reports_cc2() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        // Invalidate the PTE for the first page of segment 1.
        let sto = u64::from(cpu.regs.cr_l(1) & STD_STO);
        let ste = cpu.sysblk.storage().fetch_fullword_absolute(sto + 4);
        let pto = u64::from(ste & SEGTAB_PTO);
        let pte = cpu.sysblk.storage().fetch_fullword_absolute(pto);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(pte | PAGETAB_INVALID, pto);
        cpu.purge_tlb();
        let err = cpu
            .translate_addr(0x0010_0000, Space::Ar(0), AccType::Read)
            .expect_err("page fault");
        assert_eq!(err.code, PGM_PAGE_TRANSLATION);
        assert_eq!(err.cc, Some(2));
        assert_eq!(err.entry, pto);
    }

    #[test]
    fn page_protect_store_is_protection_exception() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        let sto = u64::from(cpu.regs.cr_l(1) & STD_STO);
        let ste = cpu.sysblk.storage().fetch_fullword_absolute(sto + 4);
        let pto = u64::from(ste & SEGTAB_PTO);
        let pte = cpu.sysblk.storage().fetch_fullword_absolute(pto);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(pte | PAGETAB_PROT, pto);
        let err = cpu
            .vstoreb(0xAA, 0x0010_0000, Space::Ar(0))
            .expect_err("protected");
        assert_eq!(err, Fault(PGM_PROTECTION));
        // Reads still work.
        assert!(cpu.vfetchb(0x0010_0000, Space::Ar(0)).is_ok());
    }

    #[test]
    fn store_sets_ref_and_change_through_dat() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        cpu.vstoreb(0xAA, 0x0010_0010, Space::Ar(0)).expect("store");
        assert_eq!(cpu.sysblk.storage().peek(0x0020_0010), 0xAA);
        let key = cpu.sysblk.storage().key(0x0020_0000);
        assert_eq!(key & (STORKEY_REF | STORKEY_CHANGE), STORKEY_REF | STORKEY_CHANGE);
    }

    #[test]
    fn fetch_protected_key_mismatch_faults() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        cpu.sysblk
            .storage()
            .set_key(0x0020_0000, 0x30 | STORKEY_FETCH);
        cpu.psw.pkey = 2;
        let err = cpu
            .vfetchb(0x0010_0000, Space::Ar(0))
            .expect_err("fetch protected");
        assert_eq!(err, Fault(PGM_PROTECTION));
        // Key zero overrides.
        cpu.psw.pkey = 0;
        assert!(cpu.vfetchb(0x0010_0000, Space::Ar(0)).is_ok());
    }

    #[test]
    fn low_address_protection_guards_first_512() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0, 0x0030_0000)]);
        cpu.regs.set_cr_l(0, cpu.regs.cr_l(0) | CR0_LOW_PROT);
        let err = cpu.vstoreb(1, 0x1FF, Space::Ar(0)).expect_err("LAP");
        assert_eq!(err, Fault(PGM_PROTECTION));
        // Above 512 the store goes through.
        assert!(cpu.vstoreb(1, 0x200, Space::Ar(0)).is_ok());
    }

    #[test]
    fn ptlb_empties_the_tlb() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        let _ = cpu.vfetchb(0x0010_0000, Space::Ar(0));
        assert!(cpu.tlb_valid_count() > 0);
        cpu.purge_tlb();
        assert_eq!(cpu.tlb_valid_count(), 0);
    }

    #[test]
    fn operand_crossing_frames_is_assembled() {
        let mut cpu = esa_cpu_with_map(
            0x0100_0000,
            &[(0x0010_0000, 0x0020_0000), (0x0010_1000, 0x0020_1000)],
        );
        // Write 8 bytes across the 2 KiB frame boundary inside a page.
        cpu.vstore8(0x0102_0304_0506_0708, 0x0010_07FC, Space::Ar(0))
            .expect("store across frames");
        assert_eq!(
            cpu.vfetch8(0x0010_07FC, Space::Ar(0)).expect("fetch back"),
            0x0102_0304_0506_0708
        );
        // And across the page boundary.
        cpu.vstore4(0xDEAD_BEEF, 0x0010_0FFE, Space::Ar(0))
            .expect("store across pages");
        assert_eq!(cpu.sysblk.storage().peek(0x0020_0FFE), 0xDE);
        assert_eq!(cpu.sysblk.storage().peek(0x0020_1001), 0xEF);
    }

    #[test]
    fn dat_off_uses_real_addresses() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[]);
        cpu.psw.sysmask = 0; // DAT off
        cpu.vstoreb(0x55, 0x4000, Space::Ar(0)).expect("real store");
        assert_eq!(cpu.sysblk.storage().peek(0x4000), 0x55);
    }

    #[test]
    fn s370_translation_64k_4k() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[]);
        cpu.arch = ArchMode::S370;
        cpu.psw.amode = false;
        cpu.regs.set_cr_l(0, CR0_PAGE_SZ_4K | CR0_SEG_SZ_64K);
        // Segment table at 0x1000: segment 0 → page table at 0x2000,
        // PTL covers all 16 pages of a 64 KiB segment.
        let stor = cpu.sysblk.storage();
        stor.store_fullword_absolute(0xF000_0000 | 0x2000, 0x1000);
        // Page 3 (virtual 0x3000) → PFRA 0x5000 << 8 = frame 0x0050_0000.
        stor.store_halfword_absolute(0x5000, 0x2000 + 3 * 2);
        cpu.regs.set_cr_l(1, 0x0000_1000);
        let t = cpu
            .translate_addr(0x3123, Space::Ar(0), AccType::Read)
            .expect("S/370 translation");
        assert_eq!(t.raddr, 0x0050_0123);
    }

    #[test]
    fn invalidate_by_pfra_clears_matching_entries() {
        let mut cpu = esa_cpu_with_map(
            0x0100_0000,
            &[(0x0010_0000, 0x0020_0000), (0x0010_1000, 0x0020_1000)],
        );
        let _ = cpu.vfetchb(0x0010_0000, Space::Ar(0));
        let _ = cpu.vfetchb(0x0010_1000, Space::Ar(0));
        assert_eq!(cpu.tlb_valid_count(), 2);
        cpu.invalidate_tlb_pfra(0x0020_0000);
        assert!(!cpu.tlb_entry_valid(0x0010_0000));
        assert!(cpu.tlb_entry_valid(0x0010_1000));
    }

    #[test]
    fn translation_format_check() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[(0x0010_0000, 0x0020_0000)]);
        cpu.regs.set_cr_l(0, 0); // invalid translation format
        let err = cpu
            .translate_addr(0x0010_0000, Space::Ar(0), AccType::Read)
            .expect_err("format");
        assert_eq!(err.code, PGM_TRANSLATION_SPECIFICATION);
        assert!(err.cc.is_none());
    }

    #[test]
    fn map_page_helper_round_trips() {
        let mut cpu = esa_cpu_with_map(0x0100_0000, &[]);
        map_page(&cpu.sysblk, cpu.regs.cr_l(1), 0x0040_0000, 0x0050_0000);
        let t = cpu
            .translate_addr(0x0040_0ABC, Space::Ar(0), AccType::Read)
            .expect("mapped");
        assert_eq!(t.raddr, 0x0050_0ABC);
    }
}
