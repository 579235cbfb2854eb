//! ESAME 64-bit extensions: long register arithmetic, the extended PSW,
//! addressing-mode switches, byte-reversed loads and stores, and the
//! 64-bit interlocked updates.

use crate::cpu::Cpu;
use crate::dat::Space;
use crate::decode::{rre, rse, rxe, s};
use crate::fault::{Fault, PGM_FIXED_POINT_OVERFLOW, PGM_SPECIAL_OPERATION, PGM_SPECIFICATION};
use crate::general::cmp_cc;
use crate::regs::Psw;

/// Condition code for a signed 64-bit addition, with the sum.
pub fn add_signed_long(op1: u64, op2: u64) -> (u64, u8) {
    let (x, overflow) = (op1 as i64).overflowing_add(op2 as i64);
    let cc = if overflow {
        3
    } else if x == 0 {
        0
    } else if x < 0 {
        1
    } else {
        2
    };
    (x as u64, cc)
}

/// Condition code for a signed 64-bit subtraction, with the difference.
pub fn sub_signed_long(op1: u64, op2: u64) -> (u64, u8) {
    let (x, overflow) = (op1 as i64).overflowing_sub(op2 as i64);
    let cc = if overflow {
        3
    } else if x == 0 {
        0
    } else if x < 0 {
        1
    } else {
        2
    };
    (x as u64, cc)
}

/// Condition code for an unsigned 64-bit addition, with the sum.
pub fn add_logical_long(op1: u64, op2: u64) -> (u64, u8) {
    let (x, carry) = op1.overflowing_add(op2);
    let cc = match (carry, x == 0) {
        (false, true) => 0,
        (false, false) => 1,
        (true, true) => 2,
        (true, false) => 3,
    };
    (x, cc)
}

/// Condition code for an unsigned 64-bit subtraction, with the difference.
pub fn sub_logical_long(op1: u64, op2: u64) -> (u64, u8) {
    let (x, borrow) = op1.overflowing_sub(op2);
    let cc = if x == 0 {
        2
    } else if borrow {
        1
    } else {
        3
    };
    (x, cc)
}

impl Cpu {
    fn esame_check(&self) -> Result<(), Fault> {
        if self.arch != crate::cpu::ArchMode::Esame {
            return Err(Fault(crate::fault::PGM_OPERATION));
        }
        Ok(())
    }

    // === PSW and addressing modes ===

    /// B2B2: LPSWE - Load PSW Extended.
    pub fn exec_lpswe(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (addr, b2) = s(self, inst);
        self.priv_check()?;
        Self::dw_check(addr)?;
        self.perform_serialization();
        self.perform_chkpt_sync();
        let mut img = [0u8; 16];
        self.vfetchc(&mut img, addr, Space::Ar(b2 as u8))?;
        self.psw = Psw::from_esame_bytes(img)?;
        self.recheck_interrupts();
        self.perform_serialization();
        self.perform_chkpt_sync();
        Ok(())
    }

    /// 010C/010D/010E: SAM24/SAM31/SAM64 - Set Addressing Mode.
    ///
    /// Switching below the current instruction address is a specification
    /// exception: the next instruction would be unfetchable.
    pub fn exec_sam(&mut self, mode: u8) -> Result<(), Fault> {
        match mode {
            24 => {
                if self.psw.ia >= 1 << 24 {
                    return Err(Fault(PGM_SPECIFICATION));
                }
                self.psw.amode = false;
                self.psw.amode64 = false;
            }
            31 => {
                if self.psw.ia >= 1 << 31 {
                    return Err(Fault(PGM_SPECIFICATION));
                }
                self.psw.amode = true;
                self.psw.amode64 = false;
            }
            _ => {
                self.esame_check()
                    .map_err(|_| Fault(PGM_SPECIAL_OPERATION))?;
                self.psw.amode = true;
                self.psw.amode64 = true;
            }
        }
        Ok(())
    }

    // === Long register operations ===

    /// B904: LGR - Load Long Register.
    pub fn exec_lgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        self.regs.set_gr_g(r1, self.regs.gr_g(r2));
        Ok(())
    }

    /// B902: LTGR - Load and Test Long Register.
    pub fn exec_ltgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        let value = self.regs.gr_g(r2);
        self.regs.set_gr_g(r1, value);
        self.psw.cc = cmp_cc(value as i64, 0);
        Ok(())
    }

    /// B914: LGFR - Load Long Fullword Register (sign-extend).
    pub fn exec_lgfr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        self.regs
            .set_gr_g(r1, self.regs.gr_l(r2) as i32 as i64 as u64);
        Ok(())
    }

    /// B908: AGR - Add Long Register.
    pub fn exec_agr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        let (sum, cc) = add_signed_long(self.regs.gr_g(r1), self.regs.gr_g(r2));
        self.regs.set_gr_g(r1, sum);
        self.psw.cc = cc;
        if cc == 3 && self.psw.fomask() {
            return Err(Fault(PGM_FIXED_POINT_OVERFLOW));
        }
        Ok(())
    }

    /// B909: SGR - Subtract Long Register.
    pub fn exec_sgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        let (diff, cc) = sub_signed_long(self.regs.gr_g(r1), self.regs.gr_g(r2));
        self.regs.set_gr_g(r1, diff);
        self.psw.cc = cc;
        if cc == 3 && self.psw.fomask() {
            return Err(Fault(PGM_FIXED_POINT_OVERFLOW));
        }
        Ok(())
    }

    /// B90A: ALGR - Add Logical Long Register.
    pub fn exec_algr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        let (sum, cc) = add_logical_long(self.regs.gr_g(r1), self.regs.gr_g(r2));
        self.regs.set_gr_g(r1, sum);
        self.psw.cc = cc;
        Ok(())
    }

    /// B90B: SLGR - Subtract Logical Long Register.
    pub fn exec_slgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        let (diff, cc) = sub_logical_long(self.regs.gr_g(r1), self.regs.gr_g(r2));
        self.regs.set_gr_g(r1, diff);
        self.psw.cc = cc;
        Ok(())
    }

    /// B920: CGR - Compare Long Register.
    pub fn exec_cgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        self.psw.cc = cmp_cc(self.regs.gr_g(r1) as i64, self.regs.gr_g(r2) as i64);
        Ok(())
    }

    /// B921: CLGR - Compare Logical Long Register.
    pub fn exec_clgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        self.psw.cc = cmp_cc(self.regs.gr_g(r1), self.regs.gr_g(r2));
        Ok(())
    }

    // === Long storage operands ===

    /// E304: LG - Load Long.
    pub fn exec_lg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, addr, b2) = rxe(self, inst);
        let value = self.vfetch8(addr, Space::Ar(b2 as u8))?;
        self.regs.set_gr_g(r1, value);
        Ok(())
    }

    /// E324: STG - Store Long.
    pub fn exec_stg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, addr, b2) = rxe(self, inst);
        self.vstore8(self.regs.gr_g(r1), addr, Space::Ar(b2 as u8))
    }

    // === Byte reversal ===

    /// B91F: LRVR - Load Reversed Register (32-bit).
    pub fn exec_lrvr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rre(inst);
        self.regs.set_gr_l(r1, self.regs.gr_l(r2).swap_bytes());
        Ok(())
    }

    /// B90F: LRVGR - Load Reversed Long Register.
    pub fn exec_lrvgr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r2) = rre(inst);
        self.regs.set_gr_g(r1, self.regs.gr_g(r2).swap_bytes());
        Ok(())
    }

    /// E31E: LRV - Load Reversed (32-bit).
    pub fn exec_lrv(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rxe(self, inst);
        let value = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        self.regs.set_gr_l(r1, value.swap_bytes());
        Ok(())
    }

    /// E31F: LRVH - Load Reversed Halfword.
    pub fn exec_lrvh(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rxe(self, inst);
        let value = self.vfetch2(addr, Space::Ar(b2 as u8))?;
        let old = self.regs.gr_l(r1);
        self.regs
            .set_gr_l(r1, old & 0xFFFF_0000 | u32::from(value.swap_bytes()));
        Ok(())
    }

    /// E30F: LRVG - Load Reversed Long.
    pub fn exec_lrvg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, addr, b2) = rxe(self, inst);
        let value = self.vfetch8(addr, Space::Ar(b2 as u8))?;
        self.regs.set_gr_g(r1, value.swap_bytes());
        Ok(())
    }

    /// E33E: STRV - Store Reversed (32-bit).
    pub fn exec_strv(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rxe(self, inst);
        self.vstore4(self.regs.gr_l(r1).swap_bytes(), addr, Space::Ar(b2 as u8))
    }

    /// E33F: STRVH - Store Reversed Halfword.
    pub fn exec_strvh(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rxe(self, inst);
        self.vstore2(
            (self.regs.gr_l(r1) as u16).swap_bytes(),
            addr,
            Space::Ar(b2 as u8),
        )
    }

    /// E32E: STRVG - Store Reversed Long.
    pub fn exec_strvg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, addr, b2) = rxe(self, inst);
        self.vstore8(self.regs.gr_g(r1).swap_bytes(), addr, Space::Ar(b2 as u8))
    }

    // === 64-bit interlocked updates ===

    /// EB30: CSG - Compare and Swap Long.
    pub fn exec_csg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r3, addr, b2) = rse(self, inst);
        Self::dw_check(addr)?;
        self.perform_serialization();
        let result = {
            let sysblk = self.sysblk.clone();
            let _mainlock = sysblk.mainlock();
            let current = self.vfetch8(addr, Space::Ar(b2 as u8))?;
            if current == self.regs.gr_g(r1) {
                self.vstore8(self.regs.gr_g(r3), addr, Space::Ar(b2 as u8))?;
                None
            } else {
                Some(current)
            }
        };
        match result {
            None => self.psw.cc = 0,
            Some(current) => {
                self.regs.set_gr_g(r1, current);
                self.psw.cc = 1;
            }
        }
        self.perform_serialization();
        Ok(())
    }

    /// EB3E: CDSG - Compare Double and Swap Long (128-bit).
    pub fn exec_cdsg(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.esame_check()?;
        let (r1, r3, addr, b2) = rse(self, inst);
        Self::even_check(r1)?;
        Self::even_check(r3)?;
        if addr & 15 != 0 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        self.perform_serialization();
        let result = {
            let sysblk = self.sysblk.clone();
            let _mainlock = sysblk.mainlock();
            let hi = self.vfetch8(addr, Space::Ar(b2 as u8))?;
            let lo = self.vfetch8(addr + 8, Space::Ar(b2 as u8))?;
            if hi == self.regs.gr_g(r1) && lo == self.regs.gr_g(r1 + 1) {
                self.vstore8(self.regs.gr_g(r3), addr, Space::Ar(b2 as u8))?;
                self.vstore8(self.regs.gr_g(r3 + 1), addr + 8, Space::Ar(b2 as u8))?;
                None
            } else {
                Some((hi, lo))
            }
        };
        match result {
            None => self.psw.cc = 0,
            Some((hi, lo)) => {
                self.regs.set_gr_g(r1, hi);
                self.regs.set_gr_g(r1 + 1, lo);
                self.psw.cc = 1;
            }
        }
        self.perform_serialization();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::ArchMode;
    use crate::testutil::real_cpu;

    fn esame_cpu() -> Cpu {
        let mut cpu = real_cpu(0x10_0000);
        cpu.arch = ArchMode::Esame;
        cpu.psw.amode = true;
        cpu.psw.amode64 = true;
        cpu
    }

    #[test]
    fn long_add_condition_codes() {
        assert_eq!(add_signed_long(1, 2), (3, 2));
        assert_eq!(add_signed_long(0, 0).1, 0);
        assert_eq!(add_signed_long(u64::MAX, 2).1, 2); // -1 + 2
        assert_eq!(add_signed_long(i64::MAX as u64, 1).1, 3);
        assert_eq!(add_logical_long(u64::MAX, 1), (0, 2));
        assert_eq!(sub_logical_long(5, 5).1, 2);
        assert_eq!(sub_logical_long(4, 5).1, 1);
        assert_eq!(sub_logical_long(6, 5).1, 3);
    }

    #[test]
    fn agr_adds_full_width() {
        let mut cpu = esame_cpu();
        cpu.regs.set_gr_g(1, 0x1_0000_0000);
        cpu.regs.set_gr_g(2, 0x2_0000_0005);
        let inst = [0xB9, 0x08, 0x00, 0x12, 0, 0];
        cpu.exec_agr(&inst).expect("AGR");
        assert_eq!(cpu.regs.gr_g(1), 0x3_0000_0005);
        assert_eq!(cpu.psw.cc, 2);
    }

    #[test]
    fn esame_only_ops_reject_esa_mode() {
        let mut cpu = real_cpu(0x10_0000);
        let inst = [0xB9, 0x08, 0x00, 0x12, 0, 0];
        assert!(cpu.exec_agr(&inst).is_err());
    }

    #[test]
    fn sam_switches_modes_with_reach_check() {
        let mut cpu = esame_cpu();
        cpu.psw.ia = 0x0080_0000;
        cpu.exec_sam(31).expect("SAM31");
        assert!(cpu.psw.amode && !cpu.psw.amode64);
        cpu.exec_sam(24).expect_err("IA beyond 24-bit reach");
        cpu.psw.ia = 0x1000;
        cpu.exec_sam(24).expect("SAM24");
        assert!(!cpu.psw.amode);
        cpu.exec_sam(64).expect("SAM64");
        assert!(cpu.psw.amode64);
    }

    #[test]
    fn load_reversed_swaps_bytes() {
        let mut cpu = esame_cpu();
        cpu.regs.set_gr_g(3, 0x0102_0304_0506_0708);
        let inst = [0xB9, 0x0F, 0x00, 0x13, 0, 0];
        cpu.exec_lrvgr(&inst).expect("LRVGR");
        assert_eq!(cpu.regs.gr_g(1), 0x0807_0605_0403_0201);

        cpu.sysblk
            .storage()
            .store_fullword_absolute(0x1122_3344, 0x800);
        // LRV r2, 0x800
        let inst = [0xE3, 0x20, 0x08, 0x00, 0x00, 0x1E];
        cpu.exec_lrv(&inst).expect("LRV");
        assert_eq!(cpu.regs.gr_l(2), 0x4433_2211);
    }

    #[test]
    fn store_reversed_round_trips() {
        let mut cpu = esame_cpu();
        cpu.regs.set_gr_g(5, 0xDEAD_BEEF_CAFE_F00D);
        let strvg = [0xE3, 0x50, 0x09, 0x00, 0x00, 0x2E];
        cpu.exec_strvg(&strvg).expect("STRVG");
        let lrvg = [0xE3, 0x60, 0x09, 0x00, 0x00, 0x0F];
        cpu.exec_lrvg(&lrvg).expect("LRVG");
        assert_eq!(cpu.regs.gr_g(6), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn csg_compare_and_swap_64() {
        let mut cpu = esame_cpu();
        cpu.sysblk
            .storage()
            .store_doubleword_absolute(0x1111_2222_3333_4444, 0x800);
        cpu.regs.set_gr_g(1, 0x1111_2222_3333_4444);
        cpu.regs.set_gr_g(3, 0x5555_6666_7777_8888);
        // CSG 1,3,0x800
        let inst = [0xEB, 0x13, 0x08, 0x00, 0x00, 0x30];
        cpu.exec_csg(&inst).expect("CSG");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(
            cpu.sysblk.storage().fetch_doubleword_absolute(0x800),
            0x5555_6666_7777_8888
        );
        // Mismatch path reloads R1.
        cpu.regs.set_gr_g(1, 0);
        cpu.exec_csg(&inst).expect("CSG fail");
        assert_eq!(cpu.psw.cc, 1);
        assert_eq!(cpu.regs.gr_g(1), 0x5555_6666_7777_8888);
    }

    #[test]
    fn cdsg_swaps_128_bits() {
        let mut cpu = esame_cpu();
        let stor = cpu.sysblk.storage();
        stor.store_doubleword_absolute(0xAAAA, 0x800);
        stor.store_doubleword_absolute(0xBBBB, 0x808);
        cpu.regs.set_gr_g(2, 0xAAAA);
        cpu.regs.set_gr_g(3, 0xBBBB);
        cpu.regs.set_gr_g(6, 0x1);
        cpu.regs.set_gr_g(7, 0x2);
        let inst = [0xEB, 0x26, 0x08, 0x00, 0x00, 0x3E];
        cpu.exec_cdsg(&inst).expect("CDSG");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(cpu.sysblk.storage().fetch_doubleword_absolute(0x800), 1);
        assert_eq!(cpu.sysblk.storage().fetch_doubleword_absolute(0x808), 2);
    }

    #[test]
    fn lpswe_loads_16_byte_psw() {
        let mut cpu = esame_cpu();
        let mut img = [0u8; 16];
        img[1] = 0x50; // key 5
        img[3] = 0x01; // EA
        img[4] = 0x80; // BA
        img[8..16].copy_from_slice(&0x0000_0000_0040_2000u64.to_be_bytes());
        cpu.sysblk.storage().store_bytes_absolute(&img, 0x900);
        let inst = [0xB2, 0xB2, 0x09, 0x00, 0, 0];
        cpu.exec_lpswe(&inst).expect("LPSWE");
        assert_eq!(cpu.psw.pkey, 5);
        assert!(cpu.psw.amode64);
        assert_eq!(cpu.psw.ia, 0x0040_2000);
    }
}
