//! ASN translation and authorization, and subspace replacement.

use s390_storage::apply_prefixing;

use crate::arch::{
    AFTE_ASTO_0, AFTE_ASTO_1, AFTE_INVALID, AFTE_RESV_0, AFTE_RESV_1, ASN_AFX, ASN_ASX, ASTE0_ATO,
    ASTE0_BASE, ASTE0_INVALID, ASTE0_RESV, ASTE1_ATL, ASTE1_RESV, CR0_ASF, CR2_DUCTO, CR14_AFTO,
    DUCT0_BASTEO, DUCT1_SA, DUCT1_SSASTEO, STD_GROUP, STD_SAEVENT, STD_SSEVENT,
};
use crate::cpu::Cpu;
use crate::fault::{
    Fault, PGM_ADDRESSING, PGM_AFX_TRANSLATION, PGM_ASN_TRANSLATION_SPECIFICATION,
    PGM_ASTE_SEQUENCE, PGM_ASTE_VALIDITY, PGM_ASX_TRANSLATION, Xcode,
};

impl Cpu {
    /// Two-level ASN translation: AFT → AST.
    ///
    /// Returns the real ASTE origin and the 16-word ASTE image (zero-
    /// padded when the ASF control selects 4-word ASTEs).
    pub fn translate_asn(&mut self, asn: u16) -> Result<(u32, [u32; 16]), Xcode> {
        let stor = self.sysblk.storage();
        let mainsize = self.mainsize();
        let asf = self.regs.cr_l(0) & CR0_ASF != 0;

        // AFX indexes the ASN first table.
        let mut afte_addr = u64::from(self.regs.cr_l(14) & CR14_AFTO) << 12;
        afte_addr += u64::from(asn & ASN_AFX) >> 4;
        if afte_addr >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let afte_addr = apply_prefixing(afte_addr, self.prefix);
        let afte = stor.fetch_fullword_absolute(afte_addr);

        if afte & AFTE_INVALID != 0 {
            self.tea = u64::from(asn);
            return Err(Xcode::soft(PGM_AFX_TRANSLATION));
        }
        let resv = if asf { AFTE_RESV_1 } else { AFTE_RESV_0 };
        if afte & resv != 0 {
            return Err(Xcode::hard(PGM_ASN_TRANSLATION_SPECIFICATION));
        }

        // ASX indexes the ASN second table; ASTEs are 16 bytes without
        // the ASF control, 64 bytes with it.
        let (mut aste_addr, numwords) = if asf {
            (
                u64::from(afte & AFTE_ASTO_1) + (u64::from(asn & ASN_ASX) << 6),
                16,
            )
        } else {
            (
                u64::from(afte & AFTE_ASTO_0) + (u64::from(asn & ASN_ASX) << 4),
                4,
            )
        };
        aste_addr &= 0x7FFF_FFFF;
        if aste_addr >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let asteo = aste_addr as u32;

        let abs = apply_prefixing(aste_addr, self.prefix);
        let mut aste = [0u32; 16];
        for (i, word) in aste.iter_mut().enumerate().take(numwords) {
            *word = stor.fetch_fullword_absolute(abs + i as u64 * 4);
        }

        if aste[0] & ASTE0_INVALID != 0 {
            self.tea = u64::from(asn);
            return Err(Xcode::soft(PGM_ASX_TRANSLATION));
        }
        if aste[0] & ASTE0_RESV != 0
            || aste[1] & ASTE1_RESV != 0
            || (aste[0] & ASTE0_BASE != 0 && !asf)
        {
            return Err(Xcode::hard(PGM_ASN_TRANSLATION_SPECIFICATION));
        }

        Ok((asteo, aste))
    }

    /// Authorize `ax` against the authority table of `aste`.
    ///
    /// `atemask` selects the primary (`0x80`) or secondary (`0x40`) bit.
    /// Returns `Ok(true)` when authorized; addressing faults propagate.
    pub fn authorize_asn(&mut self, ax: u16, aste: &[u32; 16], atemask: u8) -> Result<bool, Fault> {
        let ato = aste[0] & ASTE0_ATO;
        let atl = aste[1] & ASTE1_ATL;

        // AX beyond the table length fails without any access.
        if u32::from(ax & 0xFFF0) > atl {
            return Ok(false);
        }

        let mut ate_addr = u64::from(ato) + u64::from(ax >> 2);
        ate_addr &= 0x7FFF_FFFF;
        if ate_addr >= self.mainsize() {
            return Err(Fault(PGM_ADDRESSING));
        }
        let ate_addr = apply_prefixing(ate_addr, self.prefix);

        // The fetch sets the reference bit of the ATE frame.
        let ate = self.sysblk.storage().fetch_byte_absolute(ate_addr) << ((ax & 3) * 2);

        Ok(ate & atemask != 0)
    }

    /// Subspace replacement: swap the STD for the subspace the
    /// dispatchable unit last had control in, when applicable.
    ///
    /// Applicable when the ASF control is on, the STD belongs to a
    /// subspace group, the dispatchable unit is subspace active, and
    /// `asteo` is the DU's base-space ASTE. Otherwise the STD is returned
    /// unchanged.
    pub fn subspace_replace(&mut self, std: u32, asteo: u32) -> Result<u32, Xcode> {
        if self.regs.cr_l(0) & CR0_ASF == 0 || std & STD_GROUP == 0 {
            return Ok(std);
        }

        let stor = self.sysblk.storage();
        let mainsize = self.mainsize();
        let ducto = u64::from(self.regs.cr_l(2) & CR2_DUCTO);
        if ducto >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let ducto = apply_prefixing(ducto, self.prefix);
        // The DUCT cannot cross a page boundary.
        let duct0 = stor.fetch_fullword_absolute(ducto);
        let duct1 = stor.fetch_fullword_absolute(ducto + 4);
        let duct3 = stor.fetch_fullword_absolute(ducto + 12);

        if duct1 & DUCT1_SA == 0 || asteo != duct0 & DUCT0_BASTEO {
            return Ok(std);
        }

        let ssasteo = u64::from(duct1 & DUCT1_SSASTEO);
        if ssasteo >= mainsize {
            return Err(Xcode::hard(PGM_ADDRESSING));
        }
        let ssasteo = apply_prefixing(ssasteo, self.prefix);
        let ssaste0 = stor.fetch_fullword_absolute(ssasteo);
        let ssaste2 = stor.fetch_fullword_absolute(ssasteo + 8);
        let ssaste5 = stor.fetch_fullword_absolute(ssasteo + 20);

        if ssaste0 & ASTE0_INVALID != 0 {
            return Err(Xcode::soft(PGM_ASTE_VALIDITY));
        }
        if ssaste5 != duct3 {
            return Err(Xcode::soft(PGM_ASTE_SEQUENCE));
        }

        // Bits 1-23 and 25-31 come from the subspace STD; the event bits
        // stay with the original.
        Ok(std & (STD_SSEVENT | STD_SAEVENT) | (ssaste2 & !(STD_SSEVENT | STD_SAEVENT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ATE_PRIMARY, ATE_SECONDARY};
    use crate::testutil::real_cpu;
    use s390_storage::STORKEY_REF;

    /// AFT at 0x1000, AST at 0x5000 (64-byte ASTEs, ASF on), authority
    /// table at 0x6000. Returns the ASN whose ASTE is valid.
    fn setup_asn(cpu: &mut Cpu) -> u16 {
        cpu.regs.set_cr_l(0, cpu.regs.cr_l(0) | CR0_ASF);
        cpu.regs.set_cr_l(14, 0x1000 >> 12); // AFTO
        let stor = cpu.sysblk.storage();
        // ASN 0x0041: AFX = 1, ASX = 1.
        stor.store_fullword_absolute(0x5000, 0x1000 + 4);
        let aste_addr = 0x5000 + (1 << 6);
        stor.store_fullword_absolute(0x6000, aste_addr); // ATO
        stor.store_fullword_absolute(ASTE1_ATL, aste_addr + 4); // ATL max
        stor.store_fullword_absolute(0x0076_5000, aste_addr + 8); // STD
        0x0041
    }

    #[test]
    fn translates_valid_asn() {
        let mut cpu = real_cpu(0x10_0000);
        let asn = setup_asn(&mut cpu);
        let (asteo, aste) = cpu.translate_asn(asn).expect("ASN translation");
        assert_eq!(asteo, 0x5040);
        assert_eq!(aste[2], 0x0076_5000);
    }

    #[test]
    fn invalid_afte_is_afx_translation() {
        let mut cpu = real_cpu(0x10_0000);
        let asn = setup_asn(&mut cpu);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(AFTE_INVALID, 0x1000 + 4);
        let err = cpu.translate_asn(asn).expect_err("AFX");
        assert_eq!(err, Xcode::soft(PGM_AFX_TRANSLATION));
        assert_eq!(cpu.tea, u64::from(asn));
    }

    #[test]
    fn invalid_aste_is_asx_translation() {
        let mut cpu = real_cpu(0x10_0000);
        let asn = setup_asn(&mut cpu);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(ASTE0_INVALID, 0x5040);
        let err = cpu.translate_asn(asn).expect_err("ASX");
        assert_eq!(err, Xcode::soft(PGM_ASX_TRANSLATION));
    }

    #[test]
    fn authorization_tests_the_selected_bit() {
        let mut cpu = real_cpu(0x10_0000);
        let asn = setup_asn(&mut cpu);
        let (_, aste) = cpu.translate_asn(asn).expect("translation");
        // ATE byte for AX 0: set primary+secondary for AX 0, nothing for
        // AX 1 (bits 2-3 of the same byte).
        cpu.sysblk.storage().store_byte_absolute(0xC0, 0x6000);
        assert!(cpu.authorize_asn(0, &aste, ATE_PRIMARY).expect("auth"));
        assert!(cpu.authorize_asn(0, &aste, ATE_SECONDARY).expect("auth"));
        assert!(!cpu.authorize_asn(1, &aste, ATE_PRIMARY).expect("auth"));
        // The lookup set the reference bit of the ATE frame.
        assert_ne!(cpu.sysblk.storage().key(0x6000) & STORKEY_REF, 0);
    }

    #[test]
    fn authorization_fails_beyond_table_length() {
        let mut cpu = real_cpu(0x10_0000);
        let asn = setup_asn(&mut cpu);
        let (_, mut aste) = cpu.translate_asn(asn).expect("translation");
        aste[1] = 0; // ATL = 0: only AX 0-15 are inside
        assert!(!cpu.authorize_asn(16, &aste, ATE_PRIMARY).expect("auth"));
    }

    #[test]
    fn subspace_replace_swaps_std_bits() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.regs.set_cr_l(0, cpu.regs.cr_l(0) | CR0_ASF);
        cpu.regs.set_cr_l(2, 0x2000);
        let stor = cpu.sysblk.storage();
        // DUCT: base ASTE 0x4000, subspace active, subspace ASTE 0x7000,
        // SSASTESN 0x77.
        stor.store_fullword_absolute(0x4000, 0x2000);
        stor.store_fullword_absolute(DUCT1_SA | 0x7000, 0x2004);
        stor.store_fullword_absolute(0x77, 0x200C);
        // Subspace ASTE: valid, STD 0x0012_3000, ASTESN 0x77.
        stor.store_fullword_absolute(0, 0x7000);
        stor.store_fullword_absolute(0x0012_3000, 0x7008);
        stor.store_fullword_absolute(0x77, 0x7014);

        let std = STD_SSEVENT | STD_GROUP | 0x0099_9000;
        let out = cpu.subspace_replace(std, 0x4000).expect("replace");
        // Event bit kept, rest replaced by the subspace STD.
        assert_eq!(out, STD_SSEVENT | 0x0012_3000);

        // Different ASTE origin: no replacement.
        let out = cpu.subspace_replace(std, 0x4040).expect("no replace");
        assert_eq!(out, std);
    }

    #[test]
    fn subspace_sequence_mismatch_reports() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.regs.set_cr_l(0, cpu.regs.cr_l(0) | CR0_ASF);
        cpu.regs.set_cr_l(2, 0x2000);
        let stor = cpu.sysblk.storage();
        stor.store_fullword_absolute(0x4000, 0x2000);
        stor.store_fullword_absolute(DUCT1_SA | 0x7000, 0x2004);
        stor.store_fullword_absolute(0x78, 0x200C); // DUCT SSASTESN
        stor.store_fullword_absolute(0, 0x7000);
        stor.store_fullword_absolute(0x77, 0x7014); // ASTE ASTESN differs
        let err = cpu
            .subspace_replace(STD_GROUP, 0x4000)
            .expect_err("sequence");
        assert_eq!(err, Xcode::soft(PGM_ASTE_SEQUENCE));
    }
}
