//! SIGP issuer-side order processing.
//!
//! The signaling facility is exclusive: a busy facility answers condition
//! code 2. Orders act on the target's shared signaling block under the
//! interrupt lock; effects that need the target's own thread (stop,
//! store-status at stop, resets) are flagged there and completed by the
//! target at its next instruction boundary.

use s390_system::{
    CpuState, SIGP_EMERGENCY, SIGP_EXTCALL, SIGP_INITRESET, SIGP_RESET, SIGP_RESTART, SIGP_SENSE,
    SIGP_SETPREFIX, SIGP_START, SIGP_STOP, SIGP_STOPSTORE, SIGP_STORE, STATUS_EXTERNAL_CALL_PENDING,
    STATUS_INCORRECT_STATE, STATUS_INVALID_ORDER, STATUS_INVALID_PARAMETER,
    STATUS_OPERATOR_INTERVENING, STATUS_STOPPED,
};

use crate::cpu::Cpu;
use crate::decode::rs;
use crate::fault::Fault;

impl Cpu {
    /// AE: SIGP - Signal Processor.
    pub fn exec_sigp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (r1, r3, addr, _) = rs(self, inst);
        self.priv_check()?;
        self.perform_serialization();

        let cpad = (self.regs.gr_l(r3) & 0xFFFF) as usize;
        let order = addr as u8;
        // Parameter from R1 if odd, else R1+1.
        let parm = if r1 & 1 != 0 {
            self.regs.gr_l(r1)
        } else {
            self.regs.gr_l(r1 + 1)
        };

        if cpad >= self.sysblk.numcpu() {
            self.psw.cc = 3;
            return Ok(());
        }

        if !self.sysblk.sigp_claim() {
            self.psw.cc = 2;
            return Ok(());
        }

        let mut status: u32 = 0;
        let mut store_at: Option<u64> = None;
        {
            let mut s = self.sysblk.intlock();

            if order != SIGP_INITRESET && !s.cpus[cpad].online {
                drop(s);
                self.sysblk.sigp_release();
                self.psw.cc = 3;
                return Ok(());
            }

            // A target mid-transition rejects everything except resets.
            if order != SIGP_RESET
                && order != SIGP_INITRESET
                && (s.cpus[cpad].state == CpuState::Stopping || s.cpus[cpad].restart)
            {
                drop(s);
                self.sysblk.sigp_release();
                self.psw.cc = 2;
                return Ok(());
            }

            if s.cpus[cpad].state == CpuState::Starting {
                status |= STATUS_OPERATOR_INTERVENING;
            } else {
                match order {
                    SIGP_SENSE => {
                        if s.cpus[cpad].extcall {
                            status |= STATUS_EXTERNAL_CALL_PENDING;
                        }
                        if s.cpus[cpad].state != CpuState::Started {
                            status |= STATUS_STOPPED;
                        }
                    }
                    SIGP_EXTCALL => {
                        if s.cpus[cpad].extcall {
                            status |= STATUS_EXTERNAL_CALL_PENDING;
                        } else {
                            s.cpus[cpad].extcall = true;
                            s.cpus[cpad].extccpu = self.cpuad as u16;
                            self.sysblk.set_cpuint(cpad);
                        }
                    }
                    SIGP_EMERGENCY => {
                        s.cpus[cpad].emersig = true;
                        s.cpus[cpad].emercpu |= 1 << self.cpuad;
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_START => {
                        s.cpus[cpad].state = CpuState::Started;
                    }
                    SIGP_STOP => {
                        s.cpus[cpad].state = CpuState::Stopping;
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_RESTART => {
                        s.cpus[cpad].restart = true;
                        if s.cpus[cpad].state == CpuState::Stopped {
                            s.cpus[cpad].state = CpuState::Stopping;
                        }
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_STOPSTORE => {
                        s.cpus[cpad].storstat = true;
                        s.cpus[cpad].state = CpuState::Stopping;
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_INITRESET => {
                        s.cpus[cpad].online = true;
                        s.cpus[cpad].sigp_initial_reset = true;
                        s.cpus[cpad].state = CpuState::Stopping;
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_RESET => {
                        s.cpus[cpad].sigp_reset = true;
                        s.cpus[cpad].state = CpuState::Stopping;
                        self.sysblk.set_cpuint(cpad);
                    }
                    SIGP_SETPREFIX => {
                        if s.cpus[cpad].state != CpuState::Stopped {
                            status |= STATUS_INCORRECT_STATE;
                        } else {
                            let abs = u64::from(parm & 0x7FFF_F000);
                            if abs >= self.sysblk.storage().size() {
                                status |= STATUS_INVALID_PARAMETER;
                            } else {
                                self.sysblk.set_prefix(cpad, abs);
                                // The stopped target purges on its way out
                                // of the stopped state.
                                s.cpus[cpad].purge_tlb = true;
                                s.cpus[cpad].purge_alb = true;
                            }
                        }
                    }
                    SIGP_STORE => {
                        if s.cpus[cpad].state != CpuState::Stopped {
                            status |= STATUS_INCORRECT_STATE;
                        } else {
                            let abs = u64::from(parm & 0x7FFF_FE00);
                            if abs >= self.sysblk.storage().size() {
                                status |= STATUS_INVALID_PARAMETER;
                            } else {
                                store_at = Some(abs);
                            }
                        }
                    }
                    _ => status = STATUS_INVALID_ORDER,
                }
            }
        }

        // The target published its status block when it stopped.
        if let Some(abs) = store_at {
            self.sysblk.store_status_at(cpad, abs);
        }

        self.sysblk.sigp_release();
        self.sysblk.wake_all();

        if status != 0 {
            self.regs.set_gr_l(r1, status);
            self.psw.cc = 1;
        } else {
            self.psw.cc = 0;
        }
        self.perform_serialization();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s390_storage::MainStorage;
    use s390_system::SysBlk;
    use std::sync::Arc;

    fn two_cpu_fixture() -> (Cpu, Arc<SysBlk>) {
        let sysblk = Arc::new(SysBlk::new(MainStorage::new(0x10_0000), 2));
        {
            let mut s = sysblk.intlock();
            for c in &mut s.cpus {
                c.online = true;
                c.state = CpuState::Started;
            }
        }
        let cpu = Cpu::new(Arc::clone(&sysblk), 0);
        (cpu, sysblk)
    }

    fn sigp_inst(order: u8) -> [u8; 6] {
        // SIGP r1=2, r3=4, d2 = order (base 0).
        [0xAE, 0x24, 0x00, order, 0, 0]
    }

    #[test]
    fn sigp_nonexistent_cpu_is_cc3() {
        let (mut cpu, _blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 7); // beyond the two configured engines
        cpu.exec_sigp(&sigp_inst(SIGP_STOP)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 3);
    }

    #[test]
    fn sigp_busy_facility_is_cc2() {
        let (mut cpu, blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 1);
        assert!(blk.sigp_claim());
        cpu.exec_sigp(&sigp_inst(SIGP_SENSE)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 2);
        blk.sigp_release();
    }

    #[test]
    fn sigp_stop_marks_target_stopping() {
        let (mut cpu, blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 1);
        cpu.exec_sigp(&sigp_inst(SIGP_STOP)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(blk.intlock().cpus[1].state, CpuState::Stopping);
        // A second stop while stopping: busy, cc 2.
        cpu.exec_sigp(&sigp_inst(SIGP_STOP)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 2);
    }

    #[test]
    fn sigp_external_call_records_originator() {
        let (mut cpu, blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 1);
        cpu.exec_sigp(&sigp_inst(SIGP_EXTCALL)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 0);
        {
            let s = blk.intlock();
            assert!(s.cpus[1].extcall);
            assert_eq!(s.cpus[1].extccpu, 0);
        }
        // A second call finds the first still pending.
        cpu.exec_sigp(&sigp_inst(SIGP_EXTCALL)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 1);
        assert_ne!(cpu.regs.gr_l(2) & STATUS_EXTERNAL_CALL_PENDING, 0);
    }

    #[test]
    fn sigp_sense_reports_stopped() {
        let (mut cpu, blk) = two_cpu_fixture();
        {
            let mut s = blk.intlock();
            s.cpus[1].state = CpuState::Stopped;
        }
        cpu.regs.set_gr_l(4, 1);
        cpu.exec_sigp(&sigp_inst(SIGP_SENSE)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 1);
        assert_ne!(cpu.regs.gr_l(2) & STATUS_STOPPED, 0);
    }

    #[test]
    fn sigp_set_prefix_requires_stopped_target() {
        let (mut cpu, blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 1);
        cpu.regs.set_gr_l(3, 0x4000); // parameter (r1 even → r1+1)
        cpu.exec_sigp(&sigp_inst(SIGP_SETPREFIX)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 1);
        assert_ne!(cpu.regs.gr_l(2) & STATUS_INCORRECT_STATE, 0);

        {
            let mut s = blk.intlock();
            s.cpus[1].state = CpuState::Stopped;
        }
        cpu.regs.set_gr_l(2, 0);
        cpu.exec_sigp(&sigp_inst(SIGP_SETPREFIX)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 0);
        assert_eq!(blk.prefix(1), 0x4000);
        assert!(blk.intlock().cpus[1].purge_tlb);

        // Out-of-storage parameter: invalid parameter status.
        cpu.regs.set_gr_l(3, 0x7FFF_F000);
        cpu.exec_sigp(&sigp_inst(SIGP_SETPREFIX)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 1);
        assert_ne!(cpu.regs.gr_l(2) & STATUS_INVALID_PARAMETER, 0);
    }

    #[test]
    fn sigp_unknown_order_is_invalid() {
        let (mut cpu, _blk) = two_cpu_fixture();
        cpu.regs.set_gr_l(4, 1);
        cpu.exec_sigp(&sigp_inst(0x1F)).expect("SIGP");
        assert_eq!(cpu.psw.cc, 1);
        assert_ne!(cpu.regs.gr_l(2) & STATUS_INVALID_ORDER, 0);
    }
}
