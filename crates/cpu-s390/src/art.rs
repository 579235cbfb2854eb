//! Access-register translation: ALET → access list → ASTE.
//!
//! Ordinary ART (DAT in AR mode, TAR) checks the ALE sequence number and
//! authorizes the extended AX; special ART (BSG) skips both. The ALB
//! caches the `(ALET, EAX) → (ASTE origin, STD, fetch-only)` result of
//! ordinary ART for the DAT path; PALB and the broadcast purges clear it.

use s390_storage::apply_prefixing;

use crate::arch::{
    ALD_ALL, ALD_ALL_SHIFT, ALD_ALO, ALE0_ALEAX, ALE0_ALESN, ALE0_FETCHONLY, ALE0_INVALID,
    ALE0_PRIVATE, ALE2_ASTE, ALET_ALEN, ALET_ALESN, ALET_PRI_LIST, ALET_RESV, ASTE0_BASE,
    ASTE0_INVALID, ASTE0_RESV, ASTE1_RESV, ATE_SECONDARY, CR0_ASF, CR2_DUCTO, CR5_PASTEO,
};
use crate::cpu::{ALB_SIZE, Cpu};
use crate::dat::AccType;
use crate::fault::{
    PGM_ADDRESSING, PGM_ALE_SEQUENCE, PGM_ALEN_TRANSLATION, PGM_ALET_SPECIFICATION,
    PGM_ASN_TRANSLATION_SPECIFICATION, PGM_ASTE_SEQUENCE, PGM_ASTE_VALIDITY,
    PGM_EXTENDED_AUTHORITY, Xcode,
};

/// One ALB entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlbEntry {
    pub alet: u32,
    pub eax: u16,
    pub asteo: u32,
    pub std: u32,
    pub protect: bool,
    pub valid: bool,
}

/// Result of a successful ALET translation.
#[derive(Debug, Clone, Copy)]
pub struct ArtResult {
    /// Real address of the ASTE.
    pub asteo: u32,
    /// The 16-word ASTE image.
    pub aste: [u32; 16],
    /// ALE fetch-only protection applies.
    pub protect: bool,
}

impl Cpu {
    /// Invalidate every ALB entry of this CPU.
    pub fn purge_alb(&mut self) {
        self.alb = [AlbEntry::default(); ALB_SIZE];
    }

    /// Count of valid ALB entries (test visibility).
    #[must_use]
    pub fn alb_valid_count(&self) -> usize {
        self.alb.iter().filter(|e| e.valid).count()
    }

    /// ALET translation for the DAT path, through the ALB.
    ///
    /// Returns `(asteo, std, protect)`.
    pub(crate) fn translate_alet_cached(
        &mut self,
        alet: u32,
        eax: u16,
        acctype: AccType,
    ) -> Result<(u32, u32, bool), Xcode> {
        let idx = (alet as usize) & (ALB_SIZE - 1);
        let e = self.alb[idx];
        if e.valid && e.alet == alet && e.eax == eax {
            return Ok((e.asteo, e.std, e.protect));
        }
        let art = self.translate_alet(alet, eax, acctype)?;
        let std = art.aste[2];
        self.alb[idx] = AlbEntry {
            alet,
            eax,
            asteo: art.asteo,
            std,
            protect: art.protect,
            valid: true,
        };
        Ok((art.asteo, std, art.protect))
    }

    /// Translate an ALET to its ASTE.
    ///
    /// ALET values 0 and 1 are the caller's business (their meaning is
    /// caller-specific); this performs the table walk for everything else.
    pub fn translate_alet(
        &mut self,
        alet: u32,
        eax: u16,
        acctype: AccType,
    ) -> Result<ArtResult, Xcode> {
        let stor = self.sysblk.storage();
        let mainsize = self.mainsize();

        // Reserved ALET bits.
        if alet & ALET_RESV != 0 {
            return Err(Xcode::soft(PGM_ALET_SPECIFICATION));
        }

        // Effective access-list designation: PASTE word 4 or DUCT word 4.
        let cb = if alet & ALET_PRI_LIST != 0 {
            self.regs.cr_l(5) & CR5_PASTEO
        } else {
            self.regs.cr_l(2) & CR2_DUCTO
        };
        if u64::from(cb) >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let cb = apply_prefixing(u64::from(cb), self.prefix);
        let ald = stor.fetch_fullword_absolute(cb + 16);

        // Access-list lookup.
        let alo = ald & ALD_ALO;
        let all = ald & ALD_ALL;
        if (alet & ALET_ALEN) >> ALD_ALL_SHIFT > all {
            return Err(Xcode::soft(PGM_ALEN_TRANSLATION));
        }
        let ale_addr = u64::from(alo) + u64::from((alet & ALET_ALEN) << 4);
        if ale_addr >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let ale_addr = apply_prefixing(ale_addr, self.prefix);
        let mut ale = [0u32; 4];
        for (i, word) in ale.iter_mut().enumerate() {
            *word = stor.fetch_fullword_absolute(ale_addr + i as u64 * 4);
        }

        if ale[0] & ALE0_INVALID != 0 {
            return Err(Xcode::soft(PGM_ALEN_TRANSLATION));
        }
        // Ordinary ART compares the ALE sequence number with the ALET.
        if acctype != AccType::Bsg && (ale[0] & ALE0_ALESN) != (alet & ALET_ALESN) {
            return Err(Xcode::soft(PGM_ALE_SEQUENCE));
        }

        // Locate and fetch the 64-byte ASTE.
        let asteo = ale[2] & ALE2_ASTE;
        let abs = apply_prefixing(u64::from(asteo), self.prefix);
        if abs >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let mut aste = [0u32; 16];
        for (i, word) in aste.iter_mut().enumerate() {
            *word = stor.fetch_fullword_absolute(abs + i as u64 * 4);
        }

        if aste[0] & ASTE0_INVALID != 0 {
            return Err(Xcode::soft(PGM_ASTE_VALIDITY));
        }
        if aste[5] != ale[3] {
            return Err(Xcode::soft(PGM_ASTE_SEQUENCE));
        }

        // Authorize the ALE: private entries with a foreign ALEAX go
        // through the extended-authorization process.
        if acctype != AccType::Bsg
            && ale[0] & ALE0_PRIVATE != 0
            && (ale[0] & ALE0_ALEAX) as u16 != eax
        {
            if aste[0] & ASTE0_RESV != 0
                || aste[1] & ASTE1_RESV != 0
                || (aste[0] & ASTE0_BASE != 0 && self.regs.cr_l(0) & CR0_ASF == 0)
            {
                return Err(Xcode::hard(PGM_ASN_TRANSLATION_SPECIFICATION));
            }
            if !self.authorize_asn(eax, &aste, ATE_SECONDARY).map_err(|f| Xcode::hard(f.0))? {
                return Err(Xcode::soft(PGM_EXTENDED_AUTHORITY));
            }
        }

        Ok(ArtResult {
            asteo,
            aste,
            protect: ale[0] & ALE0_FETCHONLY != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ASTE1_ATL;
    use crate::testutil::real_cpu;

    /// Build a DUCT at 0x2000 with an access list at 0x3000, one ALE at
    /// index 2 pointing to an ASTE at 0x4000 whose STD is `std`.
    fn setup_art(cpu: &mut crate::cpu::Cpu, std: u32) -> u32 {
        let stor = cpu.sysblk.storage();
        cpu.regs.set_cr_l(2, 0x2000);
        // ALD at DUCT+16: ALO = 0x3000, ALL = max.
        stor.store_fullword_absolute(0x3000 | ALD_ALL, 0x2000 + 16);
        // ALE 2 at 0x3020: valid, ALESN 0x5A, ASTE at 0x4000.
        let ale_addr = 0x3000 + 2 * 16;
        stor.store_fullword_absolute(0x005A_0000, ale_addr);
        stor.store_fullword_absolute(0, ale_addr + 4);
        stor.store_fullword_absolute(0x4000, ale_addr + 8);
        stor.store_fullword_absolute(0x0000_1234, ale_addr + 12); // ASTESN
        // ASTE at 0x4000: valid, ATL max, STD in word 2, ASTESN in word 5.
        stor.store_fullword_absolute(0x5000 & !3, 0x4000); // ATO = 0x5000
        stor.store_fullword_absolute(ASTE1_ATL, 0x4004);
        stor.store_fullword_absolute(std, 0x4008);
        stor.store_fullword_absolute(0, 0x400C);
        stor.store_fullword_absolute(0x0000_1234, 0x4014);
        // ALET: ALESN 0x5A, ALEN 2.
        0x005A_0002
    }

    #[test]
    fn translates_valid_alet() {
        let mut cpu = real_cpu(0x10_0000);
        let alet = setup_art(&mut cpu, 0x7654_3000);
        let art = cpu
            .translate_alet(alet, 0, AccType::Read)
            .expect("ART succeeds");
        assert_eq!(art.asteo, 0x4000);
        assert_eq!(art.aste[2], 0x7654_3000);
        assert!(!art.protect);
    }

    #[test]
    fn reserved_alet_bits_are_specification() {
        let mut cpu = real_cpu(0x10_0000);
        let err = cpu
            .translate_alet(0x8000_0000, 0, AccType::Read)
            .expect_err("reserved bits");
        assert_eq!(err, Xcode::soft(PGM_ALET_SPECIFICATION));
    }

    #[test]
    fn alen_beyond_list_length_fails() {
        let mut cpu = real_cpu(0x10_0000);
        let _ = setup_art(&mut cpu, 0);
        // Shrink the ALL to zero (8 entries); ALEN 9 is out of reach.
        cpu.sysblk
            .storage()
            .store_fullword_absolute(0x3000, 0x2000 + 16);
        let err = cpu
            .translate_alet(0x005A_0009, 0, AccType::Read)
            .expect_err("ALEN too big");
        assert_eq!(err.code, PGM_ALEN_TRANSLATION);
    }

    #[test]
    fn alesn_mismatch_is_sequence_exception() {
        let mut cpu = real_cpu(0x10_0000);
        let alet = setup_art(&mut cpu, 0);
        let err = cpu
            .translate_alet(alet ^ 0x0001_0000, 0, AccType::Read)
            .expect_err("ALESN mismatch");
        assert_eq!(err.code, PGM_ALE_SEQUENCE);
        // Special ART (BSG) skips the sequence check.
        assert!(cpu.translate_alet(alet ^ 0x0001_0000, 0, AccType::Bsg).is_ok());
    }

    #[test]
    fn astesn_mismatch_is_aste_sequence() {
        let mut cpu = real_cpu(0x10_0000);
        let alet = setup_art(&mut cpu, 0);
        cpu.sysblk.storage().store_fullword_absolute(0x9999, 0x4014);
        let err = cpu
            .translate_alet(alet, 0, AccType::Read)
            .expect_err("ASTESN mismatch");
        assert_eq!(err.code, PGM_ASTE_SEQUENCE);
    }

    #[test]
    fn fetch_only_ale_sets_protect() {
        let mut cpu = real_cpu(0x10_0000);
        let alet = setup_art(&mut cpu, 0);
        let ale_addr = 0x3000 + 2 * 16;
        cpu.sysblk
            .storage()
            .store_fullword_absolute(0x005A_0000 | ALE0_FETCHONLY, ale_addr);
        let art = cpu.translate_alet(alet, 0, AccType::Read).expect("ART");
        assert!(art.protect);
    }

    #[test]
    fn alb_caches_and_palb_purges() {
        let mut cpu = real_cpu(0x10_0000);
        let alet = setup_art(&mut cpu, 0x7654_3000);
        let first = cpu
            .translate_alet_cached(alet, 0, AccType::Read)
            .expect("ART");
        assert_eq!(first.1, 0x7654_3000);
        assert_eq!(cpu.alb_valid_count(), 1);
        // A cached probe does not re-walk: clobber the ALE and still hit.
        cpu.sysblk
            .storage()
            .store_fullword_absolute(ALE0_INVALID, 0x3000 + 2 * 16);
        assert!(cpu.translate_alet_cached(alet, 0, AccType::Read).is_ok());
        cpu.purge_alb();
        assert_eq!(cpu.alb_valid_count(), 0);
        assert!(cpu.translate_alet_cached(alet, 0, AccType::Read).is_err());
    }
}
