//! General instructions: loads, stores, branches, fullword arithmetic,
//! and the interlocked compare-and-swap family.
//!
//! CS/CDS run under the main-storage lock; the lock is released before
//! any wait, and a contended loser yields the thread so two CPUs spinning
//! on the same word cannot livelock each other.

use crate::cpu::Cpu;
use crate::dat::Space;
use crate::decode::{rr, rs, rx, ss_l};
use crate::fault::{Fault, PGM_SPECIFICATION};
use s390_system::BroadcastKind;

/// Condition code for a signed 32-bit addition, with the sum.
pub fn add_signed(op1: u32, op2: u32) -> (u32, u8) {
    let r = u64::from(op1) + u64::from(op2);
    let x = r as u32;
    let carry_in = ((op1 & 0x7FFF_FFFF) + (op2 & 0x7FFF_FFFF)) >> 31;
    let carry_out = (r >> 32) as u32;
    let cc = if carry_out != carry_in {
        3
    } else if x == 0 {
        0
    } else if (x as i32) < 0 {
        1
    } else {
        2
    };
    (x, cc)
}

/// Condition code for a signed 32-bit subtraction, with the difference.
pub fn sub_signed(op1: u32, op2: u32) -> (u32, u8) {
    let r = u64::from(op1) + u64::from(!op2) + 1;
    let x = r as u32;
    let carry_in = ((op1 & 0x7FFF_FFFF) + (!op2 & 0x7FFF_FFFF) + 1) >> 31;
    let carry_out = (r >> 32) as u32;
    let cc = if carry_out != carry_in {
        3
    } else if x == 0 {
        0
    } else if (x as i32) < 0 {
        1
    } else {
        2
    };
    (x, cc)
}

/// Comparison condition code: 0 equal, 1 low, 2 high.
pub fn cmp_cc<T: Ord>(a: T, b: T) -> u8 {
    match a.cmp(&b) {
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Less => 1,
        std::cmp::Ordering::Greater => 2,
    }
}

impl Cpu {
    fn branch_to(&mut self, target: u64) {
        self.psw.ia = target & self.psw.address_wrap();
    }

    /// Record a branch trace entry when branch tracing is on.
    fn branch_trace(&mut self, target: u32) -> Result<(), Fault> {
        if self.regs.cr_l(12) & crate::arch::CR12_BRTRACE != 0 {
            let newcr12 = self.trace_br(self.psw.amode, target)?;
            self.regs.set_cr_l(12, newcr12);
        }
        Ok(())
    }

    fn link_register(&self) -> u32 {
        let mut link = self.psw.ia as u32;
        if self.psw.amode {
            link |= 0x8000_0000;
        } else {
            link |= u32::from(self.psw.ilc / 2) << 30 | u32::from(self.psw.cc) << 28
                | u32::from(self.psw.progmask) << 24;
        }
        link
    }

    // === Branches ===

    /// 05: BALR - Branch and Link Register.
    pub fn exec_balr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        let target = self.regs.gr_l(r2);
        let link = self.link_register();
        self.regs.set_gr_l(r1, link);
        if r2 != 0 {
            self.branch_trace(target)?;
            self.branch_to(u64::from(target));
        }
        Ok(())
    }

    /// 0D: BASR - Branch and Save Register.
    pub fn exec_basr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        let target = self.regs.gr_l(r2);
        let mut link = self.psw.ia as u32;
        if self.psw.amode {
            link |= 0x8000_0000;
        }
        self.regs.set_gr_l(r1, link);
        if r2 != 0 {
            self.branch_trace(target)?;
            self.branch_to(u64::from(target));
        }
        Ok(())
    }

    /// 45: BAL - Branch and Link.
    pub fn exec_bal(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, _) = rx(self, inst);
        let link = self.link_register();
        self.regs.set_gr_l(r1, link);
        self.branch_trace(addr as u32)?;
        self.branch_to(addr);
        Ok(())
    }

    /// 07: BCR - Branch on Condition Register.
    pub fn exec_bcr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (m1, r2) = rr(inst);
        if r2 != 0 && (m1 as u8) & (0x8 >> self.psw.cc) != 0 {
            self.branch_to(u64::from(self.regs.gr_l(r2)));
        } else if m1 == 15 && r2 == 0 {
            // BCR 15,0 is a serialization point.
            self.perform_serialization();
        }
        Ok(())
    }

    /// 47: BC - Branch on Condition.
    pub fn exec_bc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (m1, addr, _) = rx(self, inst);
        if (m1 as u8) & (0x8 >> self.psw.cc) != 0 {
            self.branch_to(addr);
        }
        Ok(())
    }

    // === Loads and stores ===

    /// 18: LR - Load Register.
    pub fn exec_lr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        self.regs.set_gr_l(r1, self.regs.gr_l(r2));
        Ok(())
    }

    /// 12: LTR - Load and Test Register.
    pub fn exec_ltr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        let value = self.regs.gr_l(r2);
        self.regs.set_gr_l(r1, value);
        self.psw.cc = cmp_cc(value as i32, 0);
        Ok(())
    }

    /// 58: L - Load.
    pub fn exec_l(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let value = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        self.regs.set_gr_l(r1, value);
        Ok(())
    }

    /// 48: LH - Load Halfword.
    pub fn exec_lh(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let value = self.vfetch2(addr, Space::Ar(b2 as u8))? as i16;
        self.regs.set_gr_l(r1, value as i32 as u32);
        Ok(())
    }

    /// 43: IC - Insert Character.
    pub fn exec_ic(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let byte = self.vfetchb(addr, Space::Ar(b2 as u8))?;
        let value = self.regs.gr_l(r1) & 0xFFFF_FF00 | u32::from(byte);
        self.regs.set_gr_l(r1, value);
        Ok(())
    }

    /// 41: LA - Load Address.
    pub fn exec_la(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, _) = rx(self, inst);
        self.regs.set_gr_l(r1, addr as u32);
        Ok(())
    }

    /// 50: ST - Store.
    pub fn exec_st(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        self.vstore4(self.regs.gr_l(r1), addr, Space::Ar(b2 as u8))
    }

    /// 40: STH - Store Halfword.
    pub fn exec_sth(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        self.vstore2(self.regs.gr_l(r1) as u16, addr, Space::Ar(b2 as u8))
    }

    /// 42: STC - Store Character.
    pub fn exec_stc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        self.vstoreb(self.regs.gr_l(r1) as u8, addr, Space::Ar(b2 as u8))
    }

    /// 98: LM - Load Multiple.
    pub fn exec_lm(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        let mut a = addr;
        let mut r = r1;
        loop {
            let value = self.vfetch4(a, Space::Ar(b2 as u8))?;
            self.regs.set_gr_l(r, value);
            if r == r3 {
                break;
            }
            r = (r + 1) & 15;
            a += 4;
        }
        Ok(())
    }

    /// 90: STM - Store Multiple.
    pub fn exec_stm(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        let mut a = addr;
        let mut r = r1;
        loop {
            self.vstore4(self.regs.gr_l(r), a, Space::Ar(b2 as u8))?;
            if r == r3 {
                break;
            }
            r = (r + 1) & 15;
            a += 4;
        }
        Ok(())
    }

    // === Arithmetic and comparison ===

    /// 1A: AR - Add Register.
    pub fn exec_ar(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        let (sum, cc) = add_signed(self.regs.gr_l(r1), self.regs.gr_l(r2));
        self.regs.set_gr_l(r1, sum);
        self.psw.cc = cc;
        self.fixed_overflow_check()
    }

    /// 1B: SR - Subtract Register.
    pub fn exec_sr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        let (diff, cc) = sub_signed(self.regs.gr_l(r1), self.regs.gr_l(r2));
        self.regs.set_gr_l(r1, diff);
        self.psw.cc = cc;
        self.fixed_overflow_check()
    }

    /// 5A: A - Add.
    pub fn exec_a(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let op2 = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        let (sum, cc) = add_signed(self.regs.gr_l(r1), op2);
        self.regs.set_gr_l(r1, sum);
        self.psw.cc = cc;
        self.fixed_overflow_check()
    }

    /// 5B: S - Subtract.
    pub fn exec_s(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let op2 = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        let (diff, cc) = sub_signed(self.regs.gr_l(r1), op2);
        self.regs.set_gr_l(r1, diff);
        self.psw.cc = cc;
        self.fixed_overflow_check()
    }

    fn fixed_overflow_check(&self) -> Result<(), Fault> {
        if self.psw.cc == 3 && self.psw.fomask() {
            return Err(Fault(crate::fault::PGM_FIXED_POINT_OVERFLOW));
        }
        Ok(())
    }

    /// 19: CR - Compare Register.
    pub fn exec_cr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        self.psw.cc = cmp_cc(self.regs.gr_l(r1) as i32, self.regs.gr_l(r2) as i32);
        Ok(())
    }

    /// 59: C - Compare.
    pub fn exec_c(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let op2 = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        self.psw.cc = cmp_cc(self.regs.gr_l(r1) as i32, op2 as i32);
        Ok(())
    }

    /// 15: CLR - Compare Logical Register.
    pub fn exec_clr(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = rr(inst);
        self.psw.cc = cmp_cc(self.regs.gr_l(r1), self.regs.gr_l(r2));
        Ok(())
    }

    /// 55: CL - Compare Logical.
    pub fn exec_cl(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, addr, b2) = rx(self, inst);
        let op2 = self.vfetch4(addr, Space::Ar(b2 as u8))?;
        self.psw.cc = cmp_cc(self.regs.gr_l(r1), op2);
        Ok(())
    }

    // === Character operations ===

    /// D2: MVC - Move Characters.
    pub fn exec_mvc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l, addr1, b1, addr2, b2) = ss_l(self, inst);
        // Overlapping operands move one byte at a time; the buffered
        // engine reproduces that only when the destination is below the
        // source or they are disjoint, so propagate bytes explicitly.
        let len = l + 1;
        if addr2 < addr1 && addr1 < addr2 + len as u64 {
            for i in 0..len as u64 {
                let byte = self.vfetchb(addr2 + i, Space::Ar(b2 as u8))?;
                self.vstoreb(byte, addr1 + i, Space::Ar(b1 as u8))?;
            }
            return Ok(());
        }
        self.move_chars(
            addr1,
            Space::Ar(b1 as u8),
            self.psw.pkey,
            addr2,
            Space::Ar(b2 as u8),
            self.psw.pkey,
            len,
        )
    }

    /// D5: CLC - Compare Logical Characters.
    pub fn exec_clc(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l, addr1, b1, addr2, b2) = ss_l(self, inst);
        let mut op1 = [0u8; 256];
        let mut op2 = [0u8; 256];
        let len = l + 1;
        self.vfetchc(&mut op1[..len], addr1, Space::Ar(b1 as u8))?;
        self.vfetchc(&mut op2[..len], addr2, Space::Ar(b2 as u8))?;
        self.psw.cc = cmp_cc(&op1[..len], &op2[..len]);
        Ok(())
    }

    // === Interlocked updates ===

    /// BA: CS - Compare and Swap.
    pub fn exec_cs(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        Self::fw_check(addr)?;
        self.perform_serialization();
        let result = {
            let sysblk = self.sysblk.clone();
            let _mainlock = sysblk.mainlock();
            let current = self.vfetch4(addr, Space::Ar(b2 as u8))?;
            if current == self.regs.gr_l(r1) {
                self.vstore4(self.regs.gr_l(r3), addr, Space::Ar(b2 as u8))?;
                None
            } else {
                Some(current)
            }
        };
        match result {
            None => self.psw.cc = 0,
            Some(current) => {
                self.regs.set_gr_l(r1, current);
                self.psw.cc = 1;
                self.contention_yield();
            }
        }
        self.perform_serialization();
        Ok(())
    }

    /// BB: CDS - Compare Double and Swap.
    pub fn exec_cds(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, b2) = rs(self, inst);
        Self::even_check(r1)?;
        Self::even_check(r3)?;
        Self::dw_check(addr)?;
        self.perform_serialization();
        let result = {
            let sysblk = self.sysblk.clone();
            let _mainlock = sysblk.mainlock();
            let current = self.vfetch8(addr, Space::Ar(b2 as u8))?;
            if current == self.regs.gr_pair(r1) {
                self.vstore8(self.regs.gr_pair(r3), addr, Space::Ar(b2 as u8))?;
                None
            } else {
                Some(current)
            }
        };
        match result {
            None => self.psw.cc = 0,
            Some(current) => {
                self.regs.set_gr_pair(r1, current);
                self.psw.cc = 1;
                self.contention_yield();
            }
        }
        self.perform_serialization();
        Ok(())
    }

    /// B250: CSP - Compare and Swap and Purge.
    pub fn exec_csp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r2) = crate::decode::rre(inst);
        self.priv_check()?;
        Self::even_check(r1)?;
        self.perform_serialization();

        let addr = u64::from(self.regs.gr_l(r2) & 0x7FFF_FFFC) & self.psw.address_wrap();
        let swapped = {
            // Released before any broadcast wait: holding it across the
            // quiescence wait deadlocks against CS on a peer.
            let sysblk = self.sysblk.clone();
            let _mainlock = sysblk.mainlock();
            let current = self.vfetch4(addr, Space::Ar(r2 as u8))?;
            if current == self.regs.gr_l(r1) {
                self.vstore4(self.regs.gr_l(r1 + 1), addr, Space::Ar(r2 as u8))?;
                true
            } else {
                self.regs.set_gr_l(r1, current);
                false
            }
        };

        if swapped {
            self.psw.cc = 0;
            if self.regs.gr_l(r2) & 0x1 != 0 {
                self.purge_tlb();
                if self.sysblk.numcpu() > 1 {
                    self.sysblk
                        .synchronize_broadcast(self.cpuad, BroadcastKind::Ptlb);
                }
            }
            if self.regs.gr_l(r2) & 0x2 != 0 {
                self.purge_alb();
                if self.sysblk.numcpu() > 1 {
                    self.sysblk
                        .synchronize_broadcast(self.cpuad, BroadcastKind::Palb);
                }
            }
        } else {
            self.psw.cc = 1;
        }
        self.perform_serialization();
        Ok(())
    }

    /// Losing a contended interlocked update yields a scheduling slice so
    /// the holder can make progress.
    fn contention_yield(&self) {
        if self.sysblk.numcpu() > 1 {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::real_cpu;

    #[test]
    fn add_signed_condition_codes() {
        assert_eq!(add_signed(1, 2), (3, 2));
        assert_eq!(add_signed(0, 0), (0, 0));
        assert_eq!(add_signed(0xFFFF_FFFF, 1), (0, 0));
        assert_eq!(add_signed(1, 0xFFFF_FFFE), (0xFFFF_FFFF, 1));
        assert_eq!(add_signed(0x7FFF_FFFF, 1).1, 3); // overflow
    }

    #[test]
    fn sub_signed_condition_codes() {
        assert_eq!(sub_signed(5, 3), (2, 2));
        assert_eq!(sub_signed(3, 3).1, 0);
        assert_eq!(sub_signed(3, 5).1, 1);
        assert_eq!(sub_signed(0x8000_0000, 1).1, 3); // overflow
    }

    #[test]
    fn cs_success_stores_and_cc0() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.sysblk.storage().store_fullword_absolute(0, 0x1000);
        cpu.regs.set_gr_l(4, 0);
        cpu.regs.set_gr_l(5, 1);
        cpu.regs.set_gr_l(1, 0x1000);
        // CS 4,5,0(1)
        let inst = [0xBA, 0x45, 0x10, 0x00, 0, 0];
        cpu.exec_cs(&inst).expect("CS");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(cpu.sysblk.storage().fetch_fullword_absolute(0x1000), 1);
        assert_eq!(cpu.regs.gr_l(4), 0);
    }

    #[test]
    fn cs_failure_reloads_and_cc1() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.sysblk
            .storage()
            .store_fullword_absolute(0xBEEF, 0x1000);
        cpu.regs.set_gr_l(4, 0);
        cpu.regs.set_gr_l(5, 1);
        cpu.regs.set_gr_l(1, 0x1000);
        let inst = [0xBA, 0x45, 0x10, 0x00, 0, 0];
        cpu.exec_cs(&inst).expect("CS");
        assert_eq!(cpu.psw.cc, 1);
        assert_eq!(cpu.regs.gr_l(4), 0xBEEF);
        // Storage unchanged on failure.
        assert_eq!(cpu.sysblk.storage().fetch_fullword_absolute(0x1000), 0xBEEF);
    }

    #[test]
    fn cs_misaligned_is_specification() {
        let mut cpu = real_cpu(0x10_0000);
        let inst = [0xBA, 0x45, 0x01, 0x02, 0, 0];
        assert_eq!(
            cpu.exec_cs(&inst).expect_err("misaligned"),
            Fault(PGM_SPECIFICATION)
        );
    }

    #[test]
    fn cds_swaps_register_pair() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.sysblk
            .storage()
            .store_doubleword_absolute(0x0102_0304_0506_0708, 0x2000);
        cpu.regs.set_gr_pair(4, 0x0102_0304_0506_0708);
        cpu.regs.set_gr_pair(6, 0xAAAA_AAAA_BBBB_BBBB);
        cpu.regs.set_gr_l(1, 0x2000);
        let inst = [0xBB, 0x46, 0x10, 0x00, 0, 0];
        cpu.exec_cds(&inst).expect("CDS");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(
            cpu.sysblk.storage().fetch_doubleword_absolute(0x2000),
            0xAAAA_AAAA_BBBB_BBBB
        );
    }

    #[test]
    fn csp_swaps_and_purges_tlb() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.sysblk.storage().store_fullword_absolute(7, 0x3000);
        cpu.regs.set_gr_l(4, 7);
        cpu.regs.set_gr_l(5, 8);
        cpu.regs.set_gr_l(6, 0x3000 | 1); // purge-TLB bit
        let inst = [0xB2, 0x50, 0x00, 0x46, 0, 0];
        cpu.exec_csp(&inst).expect("CSP");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(cpu.sysblk.storage().fetch_fullword_absolute(0x3000), 8);
        assert_eq!(cpu.tlb_valid_count(), 0);
    }

    #[test]
    fn mvc_copies_and_propagates() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.sysblk.storage().store_bytes_absolute(b"abcdef", 0x4000);
        cpu.regs.set_gr_l(1, 0x5000);
        cpu.regs.set_gr_l(2, 0x4000);
        // MVC 0(6,1),0(2)
        let inst = [0xD2, 0x05, 0x10, 0x00, 0x20, 0x00];
        cpu.exec_mvc(&inst).expect("MVC");
        let mut out = [0u8; 6];
        cpu.sysblk.storage().fetch_bytes_absolute(&mut out, 0x5000);
        assert_eq!(&out, b"abcdef");
        // Overlap by one byte propagates the first byte (storage fill).
        cpu.sysblk.storage().store_bytes_absolute(&[0x41], 0x6000);
        cpu.regs.set_gr_l(1, 0x6001);
        cpu.regs.set_gr_l(2, 0x6000);
        let inst = [0xD2, 0x04, 0x10, 0x00, 0x20, 0x00];
        cpu.exec_mvc(&inst).expect("MVC overlap");
        let mut out = [0u8; 6];
        cpu.sysblk.storage().fetch_bytes_absolute(&mut out, 0x6000);
        assert_eq!(&out, &[0x41; 6]);
    }

    #[test]
    fn branch_on_condition_masks() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.psw.ia = 0x1000;
        cpu.psw.cc = 2;
        cpu.regs.set_gr_l(9, 0x2000);
        // BCR 2,9 — mask bit for cc 2 set.
        let inst = [0x07, 0x29, 0, 0, 0, 0];
        cpu.exec_bcr(&inst).expect("BCR");
        assert_eq!(cpu.psw.ia, 0x2000);
        // Mask that misses: no branch.
        cpu.psw.cc = 0;
        cpu.psw.ia = 0x1000;
        let inst = [0x07, 0x29, 0, 0, 0, 0];
        cpu.exec_bcr(&inst).expect("BCR");
        assert_eq!(cpu.psw.ia, 0x1000);
    }

    #[test]
    fn balr_links_and_branches() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.psw.ia = 0x1234;
        cpu.psw.amode = true;
        cpu.regs.set_gr_l(15, 0x8000);
        let inst = [0x05, 0xEF, 0, 0, 0, 0];
        cpu.exec_balr(&inst).expect("BALR");
        assert_eq!(cpu.regs.gr_l(14), 0x8000_1234);
        assert_eq!(cpu.psw.ia, 0x8000);
    }

    #[test]
    fn balr_traces_branches_when_enabled() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.regs
            .set_cr_l(12, crate::arch::CR12_BRTRACE | 0x7000);
        cpu.psw.amode = true;
        cpu.regs.set_gr_l(9, 0x0040_2000);
        let inst = [0x05, 0x89, 0, 0, 0, 0];
        cpu.exec_balr(&inst).expect("BALR");
        assert_eq!(
            cpu.sysblk.storage().fetch_fullword_absolute(0x7000),
            0x8040_2000
        );
        assert_eq!(cpu.regs.cr_l(12) & crate::arch::CR12_TRACEEA, 0x7004);
    }

    #[test]
    fn load_store_multiple_wraps_registers() {
        let mut cpu = real_cpu(0x10_0000);
        cpu.regs.set_gr_l(14, 0xE);
        cpu.regs.set_gr_l(15, 0xF);
        cpu.regs.set_gr_l(0, 0x10);
        // STM 14,0,0x800
        let inst = [0x90, 0xE0, 0x08, 0x00, 0, 0];
        cpu.exec_stm(&inst).expect("STM");
        let stor = cpu.sysblk.storage();
        assert_eq!(stor.fetch_fullword_absolute(0x800), 0xE);
        assert_eq!(stor.fetch_fullword_absolute(0x804), 0xF);
        assert_eq!(stor.fetch_fullword_absolute(0x808), 0x10);
        // LM back into 2,3,4.
        cpu.regs.set_gr_l(2, 0);
        let inst = [0x98, 0x24, 0x08, 0x00, 0, 0];
        cpu.exec_lm(&inst).expect("LM");
        assert_eq!(cpu.regs.gr_l(2), 0xE);
        assert_eq!(cpu.regs.gr_l(4), 0x10);
    }
}
