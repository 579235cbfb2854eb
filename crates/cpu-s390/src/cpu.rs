//! The per-CPU execution context and dispatch loop.
//!
//! The context owns everything thread-local: PSW, register files, TLB and
//! ALB, prefix, the translation-exception scratch fields. Cross-CPU state
//! is reached through the shared system block, addressed by this CPU's
//! ordinal — CPUs never hold references to each other's contexts.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use s390_storage::apply_prefixing;
use s390_system::{CpuState, STATUS_BLOCK_LEN, SysBlk};

use crate::arch::{
    CR0_XM_CLKC, CR0_XM_EMERSIG, CR0_XM_EXTCALL, CR0_XM_ITIMER, CR0_XM_PTIMER,
    CR0_XM_SERVSIG, EXT_CLOCK_COMPARATOR, EXT_CPU_TIMER, EXT_EMERGENCY_SIGNAL, EXT_EXTERNAL_CALL,
    EXT_INTERVAL_TIMER, EXT_SERVICE_SIGNAL, PSA_EXTCPAD, PSA_EXTCODE,
    PSA_EXTERNAL_NEW, PSA_EXTERNAL_OLD, PSA_EXCARID, PSA_PGMCODE, PSA_PGMILC, PSA_PROGRAM_NEW,
    PSA_PROGRAM_OLD, PSA_RESTART_NEW, PSA_RESTART_OLD, PSA_TEA,
};
use crate::art::AlbEntry;
use crate::dat::TlbEntry;
use crate::fault::Fault;
use crate::regs::{PSW_EXTMASK, Psw, Registers};

/// Architecture personality of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchMode {
    /// System/370: 24-bit, 2 KiB/4 KiB pages, 64 KiB/1 MiB segments.
    S370,
    /// ESA/390: the default personality.
    #[default]
    Esa390,
    /// ESAME (z/Architecture): 64-bit registers and PSW.
    Esame,
}

/// Number of TLB entries; the probe key is virtual-address bits 12-19.
pub const TLB_SIZE: usize = 256;
/// Number of ALB entries.
pub const ALB_SIZE: usize = 16;

/// Offsets within the 512-byte store-status block.
mod status {
    pub const CPU_TIMER: usize = 216;
    pub const CLOCK_COMP: usize = 224;
    pub const PSW: usize = 256;
    pub const PREFIX: usize = 264;
    pub const ACCESS_REGS: usize = 288;
    pub const GEN_REGS: usize = 384;
    pub const CTL_REGS: usize = 448;
}

/// Host hook for DIAGNOSE subcodes (MSSF call, DIAG 204, ...).
///
/// The core hands over the subcode and the operand registers; the
/// handler reaches guest storage through the system block and may leave
/// a service-signal external interruption pending there.
pub trait DiagnoseHandler: Send {
    fn diagnose(&self, sysblk: &SysBlk, code: u32, r1: u32, r3: u32);
}

/// A CPU engine.
pub struct Cpu {
    /// Shared system block.
    pub sysblk: Arc<SysBlk>,
    /// This CPU's ordinal, which is also its CPU address.
    pub cpuad: usize,
    /// Architecture personality.
    pub arch: ArchMode,
    /// Program status word.
    pub psw: Psw,
    /// Register files.
    pub regs: Registers,
    /// Prefix register.
    pub prefix: u64,
    /// Translation lookaside buffer.
    pub(crate) tlb: [TlbEntry; TLB_SIZE],
    /// ART lookaside buffer.
    pub(crate) alb: [AlbEntry; ALB_SIZE],
    /// Translation-exception address for the next program interruption.
    pub tea: u64,
    /// Exception access identification (AR number).
    pub excarid: u8,
    /// Instructions executed since reset.
    pub instcount: u64,
    /// Broadcast sequence numbers already honored.
    seen_ptlb: u64,
    seen_palb: u64,
    /// Host DIAGNOSE hook, when one is attached.
    pub diag: Option<Box<dyn DiagnoseHandler>>,
}

impl Cpu {
    /// Create a CPU bound to ordinal `cpuad` of `sysblk`.
    #[must_use]
    pub fn new(sysblk: Arc<SysBlk>, cpuad: usize) -> Self {
        let (seen_ptlb, seen_palb) = {
            let s = sysblk.intlock();
            (s.brdcstptlb, s.brdcstpalb)
        };
        Self {
            sysblk,
            cpuad,
            arch: ArchMode::Esa390,
            psw: Psw::default(),
            regs: Registers::default(),
            prefix: 0,
            tlb: [TlbEntry::default(); TLB_SIZE],
            alb: [AlbEntry::default(); ALB_SIZE],
            tea: 0,
            excarid: 0,
            instcount: 0,
            seen_ptlb,
            seen_palb,
            diag: None,
        }
    }

    /// Main-storage size, as this CPU sees it.
    #[must_use]
    pub fn mainsize(&self) -> u64 {
        self.sysblk.storage().size()
    }

    /// Architectural serialization: a full fence.
    pub fn perform_serialization(&self) {
        fence(Ordering::SeqCst);
    }

    /// Checkpoint synchronization; pending interruptions are recognized at
    /// the next instruction boundary.
    pub fn perform_chkpt_sync(&self) {
        fence(Ordering::SeqCst);
    }

    // === Reset ===

    /// CPU reset: clears pending interruptions and the lookaside buffers;
    /// registers and storage survive.
    pub fn reset(&mut self) {
        self.purge_tlb();
        self.purge_alb();
        let mut s = self.sysblk.intlock();
        s.cpus[self.cpuad].clear_for_reset();
    }

    /// Initial CPU reset: a CPU reset plus cleared PSW, prefix, and
    /// control-register reset state.
    pub fn initial_reset(&mut self) {
        self.reset();
        self.psw = Psw::default();
        self.psw.ecmode = true;
        self.prefix = 0;
        self.sysblk.set_prefix(self.cpuad, 0);
        self.regs = Registers::default();
        // CR0 and CR14 have non-zero reset values.
        self.regs.set_cr_l(0, 0xB0E0_0000);
        self.regs.set_cr_l(14, 0xC200_0000);
        self.sysblk.set_cpu_timer(self.cpuad, 0);
        self.sysblk.set_clock_comparator(self.cpuad, 0);
    }

    // === Program interruptions ===

    /// Perform the program-interruption PSW swap for `fault`.
    ///
    /// The old PSW goes to the PSA program-old slot together with the
    /// interruption code, ILC, and the translation-exception fields; the
    /// new PSW is loaded from the program-new slot. An invalid new PSW
    /// leaves the CPU in a disabled wait.
    pub fn take_program_interrupt(&mut self, fault: Fault) {
        self.perform_serialization();
        let stor = self.sysblk.storage();
        let psa = apply_prefixing(0, self.prefix);
        stor.store_byte_absolute(self.psw.ilc, psa + PSA_PGMILC);
        stor.store_halfword_absolute(fault.code(), psa + PSA_PGMCODE);
        stor.store_fullword_absolute(self.tea as u32, psa + PSA_TEA);
        stor.store_byte_absolute(self.excarid, psa + PSA_EXCARID);
        self.tea = 0;
        self.excarid = 0;
        self.psw_swap(PSA_PROGRAM_OLD, PSA_PROGRAM_NEW);
    }

    /// Take the restart interruption.
    pub fn take_restart_interrupt(&mut self) {
        self.psw_swap(PSA_RESTART_OLD, PSA_RESTART_NEW);
    }

    fn take_external_interrupt(&mut self, code: u16, cpuad: Option<u16>) {
        let stor = self.sysblk.storage();
        let psa = apply_prefixing(0, self.prefix);
        stor.store_halfword_absolute(code, psa + PSA_EXTCODE);
        stor.store_halfword_absolute(cpuad.unwrap_or(0), psa + PSA_EXTCPAD);
        self.psw_swap(PSA_EXTERNAL_OLD, PSA_EXTERNAL_NEW);
    }

    fn psw_swap(&mut self, old_off: u64, new_off: u64) {
        let psa = apply_prefixing(0, self.prefix);
        let stor = self.sysblk.storage();
        match self.arch {
            ArchMode::Esame => {
                // ESAME PSA: 16-byte old PSWs at 0x120-0x150, new PSWs at
                // 0x1A0-0x1D0, in restart/external/SVC/program order.
                let old = match old_off {
                    PSA_RESTART_OLD => 0x120,
                    PSA_EXTERNAL_OLD => 0x130,
                    crate::arch::PSA_SVC_OLD => 0x140,
                    _ => 0x150,
                };
                let new = match new_off {
                    PSA_RESTART_NEW => 0x1A0,
                    PSA_EXTERNAL_NEW => 0x1B0,
                    crate::arch::PSA_SVC_NEW => 0x1C0,
                    _ => 0x1D0,
                };
                let bytes = self.psw.to_esame_bytes();
                stor.store_bytes_absolute(&bytes, psa + old);
                let mut img = [0u8; 16];
                stor.fetch_bytes_absolute(&mut img, psa + new);
                match Psw::from_esame_bytes(img) {
                    Ok(psw) => self.psw = psw,
                    Err(_) => self.disabled_wait(),
                }
            }
            _ => {
                let bytes = self.psw.to_esa_bytes();
                stor.store_bytes_absolute(&bytes, psa + old_off);
                let mut img = [0u8; 8];
                stor.fetch_bytes_absolute(&mut img, psa + new_off);
                match Psw::from_esa_bytes(img) {
                    Ok(psw) => self.psw = psw,
                    Err(_) => self.disabled_wait(),
                }
            }
        }
    }

    /// Enter the disabled wait state (all interruption classes masked).
    pub fn disabled_wait(&mut self) {
        self.psw.sysmask = 0;
        self.psw.wait = true;
    }

    // === Store status ===

    /// Build the architectural 512-byte status block.
    #[must_use]
    pub fn status_block(&self) -> [u8; STATUS_BLOCK_LEN] {
        let mut b = [0u8; STATUS_BLOCK_LEN];
        let timer = self.sysblk.cpu_timer(self.cpuad) as u64;
        b[status::CPU_TIMER..status::CPU_TIMER + 8].copy_from_slice(&timer.to_be_bytes());
        let clkc = self.sysblk.clock_comparator(self.cpuad);
        b[status::CLOCK_COMP..status::CLOCK_COMP + 8].copy_from_slice(&clkc.to_be_bytes());
        b[status::PSW..status::PSW + 8].copy_from_slice(&self.psw.to_esa_bytes());
        b[status::PREFIX..status::PREFIX + 4].copy_from_slice(&(self.prefix as u32).to_be_bytes());
        for n in 0..16 {
            let off = status::ACCESS_REGS + n * 4;
            b[off..off + 4].copy_from_slice(&self.regs.ar[n].to_be_bytes());
            let off = status::GEN_REGS + n * 4;
            b[off..off + 4].copy_from_slice(&self.regs.gr_l(n).to_be_bytes());
            let off = status::CTL_REGS + n * 4;
            b[off..off + 4].copy_from_slice(&self.regs.cr_l(n).to_be_bytes());
        }
        b
    }

    /// Store this CPU's status at the save area based at absolute `abs`.
    ///
    /// Only the architected 216-511 range is stored; the first 216 bytes
    /// of the target are left alone (stop-and-store targets the PSA).
    pub fn store_status(&self, abs: u64) {
        let block = self.status_block();
        self.sysblk
            .storage()
            .store_bytes_absolute(&block[216..], abs + 216);
    }

    /// Publish the status block for SIGP Store Status to copy later.
    pub fn publish_status(&self) {
        self.sysblk.publish_status(self.cpuad, &self.status_block());
    }

    // === Instruction boundary ===

    /// Bring this CPU online in the stopped state.
    pub fn configure_online(&mut self) {
        let mut s = self.sysblk.intlock();
        s.cpus[self.cpuad].online = true;
        s.cpus[self.cpuad].state = CpuState::Stopped;
        drop(s);
        self.sysblk.set_prefix(self.cpuad, self.prefix);
        self.publish_status();
        self.sysblk.wake_all();
    }

    /// Run the dispatch loop until shutdown.
    pub fn run(&mut self) {
        self.configure_online();
        while self.step() {}
        let mut s = self.sysblk.intlock();
        s.cpus[self.cpuad].online = false;
        drop(s);
        self.sysblk.wake_all();
    }

    /// One dispatch iteration: boundary work, then at most one
    /// instruction. Returns false when the configuration is shutting down.
    pub fn step(&mut self) -> bool {
        if self.sysblk.is_shutdown() {
            return false;
        }
        if self.sysblk.cpuint(self.cpuad) && !self.boundary_work() {
            return false;
        }
        {
            // A stop request takes effect here, at the boundary.
            let state = self.sysblk.intlock().cpus[self.cpuad].state;
            match state {
                CpuState::Started => {}
                _ => return self.stopped_wait(),
            }
        }
        if self.psw.wait {
            return self.psw_wait();
        }
        self.instcount += 1;
        if let Err(fault) = self.execute_next() {
            self.take_program_interrupt(fault);
        }
        true
    }

    fn execute_next(&mut self) -> Result<(), Fault> {
        let mut inst = [0u8; 6];
        self.instfetch(&mut inst, self.psw.ia)?;
        let ilc = 2 * (1 + u8::from(inst[0] >= 0x40) + u8::from(inst[0] >= 0xC0));
        self.psw.ilc = ilc;
        self.psw.ia = (self.psw.ia + u64::from(ilc)) & self.psw.address_wrap();
        crate::decode::dispatch(self, &inst)
    }

    /// Handle everything flagged at the instruction boundary: broadcasts,
    /// resets, restart, and enabled external interruptions. Returns false
    /// on shutdown.
    fn boundary_work(&mut self) -> bool {
        let sysblk = self.sysblk.clone();
        let mut s = sysblk.intlock();

        // Broadcast purges first: the originator is waiting on us.
        if s.brdcstptlb > self.seen_ptlb {
            self.seen_ptlb = s.brdcstptlb;
            self.tlb = [TlbEntry::default(); TLB_SIZE];
            self.sysblk.broadcast_done(&mut s);
        }
        if s.brdcstpalb > self.seen_palb {
            self.seen_palb = s.brdcstpalb;
            self.alb = [AlbEntry::default(); ALB_SIZE];
            self.sysblk.broadcast_done(&mut s);
        }

        // Reset orders.
        if s.cpus[self.cpuad].sigp_initial_reset {
            s.cpus[self.cpuad].sigp_initial_reset = false;
            s.cpus[self.cpuad].state = CpuState::Stopped;
            drop(s);
            self.initial_reset();
            self.publish_status();
            return true;
        }
        if s.cpus[self.cpuad].sigp_reset {
            s.cpus[self.cpuad].sigp_reset = false;
            s.cpus[self.cpuad].state = CpuState::Stopped;
            drop(s);
            self.reset();
            self.publish_status();
            return true;
        }

        // Restart: PSW swap through PSA 0/8, then the started state.
        if s.cpus[self.cpuad].restart {
            s.cpus[self.cpuad].restart = false;
            s.cpus[self.cpuad].state = CpuState::Started;
            drop(s);
            self.take_restart_interrupt();
            return true;
        }

        // External interruptions while enabled for them.
        if self.psw.sysmask & PSW_EXTMASK != 0 {
            if let Some((code, addr)) = self.next_external(&mut s) {
                drop(s);
                self.take_external_interrupt(code, addr);
                return true;
            }
        }

        // Nothing deliverable right now. Clear the fast flag; instructions
        // that open the masks (SSM, STOSM, LPSW, LCTL) re-arm it.
        self.sysblk.clear_cpuint(self.cpuad);
        true
    }

    /// Re-arm the fast pending flag if any raw pending condition exists.
    /// Called after instructions that may open interruption masks.
    pub fn recheck_interrupts(&mut self) {
        let s = self.sysblk.intlock();
        let sig = &s.cpus[self.cpuad];
        if sig.extcall
            || sig.emersig
            || sig.ckpend
            || sig.ptpend
            || sig.itimer_pend
            || sig.restart
            || s.servsig
        {
            self.sysblk.set_cpuint(self.cpuad);
        }
    }

    /// Pick the next enabled external-interruption source, consuming its
    /// pending state. Call with the interrupt lock held.
    fn next_external(
        &mut self,
        s: &mut std::sync::MutexGuard<'_, s390_system::IntState>,
    ) -> Option<(u16, Option<u16>)> {
        let cr0 = self.regs.cr_l(0);
        let sig = &mut s.cpus[self.cpuad];

        if sig.emersig && cr0 & CR0_XM_EMERSIG != 0 {
            // Deliver one originator per interruption, lowest address first.
            let origin = sig.emercpu.trailing_zeros() as u16;
            sig.emercpu &= sig.emercpu.wrapping_sub(1);
            if sig.emercpu == 0 {
                sig.emersig = false;
            }
            return Some((EXT_EMERGENCY_SIGNAL, Some(origin)));
        }
        if sig.extcall && cr0 & CR0_XM_EXTCALL != 0 {
            sig.extcall = false;
            return Some((EXT_EXTERNAL_CALL, Some(sig.extccpu)));
        }
        if sig.ckpend && cr0 & CR0_XM_CLKC != 0 {
            sig.ckpend = false;
            return Some((EXT_CLOCK_COMPARATOR, None));
        }
        if sig.ptpend && cr0 & CR0_XM_PTIMER != 0 {
            sig.ptpend = false;
            return Some((EXT_CPU_TIMER, None));
        }
        if sig.itimer_pend && cr0 & CR0_XM_ITIMER != 0 {
            sig.itimer_pend = false;
            return Some((EXT_INTERVAL_TIMER, None));
        }
        if s.servsig && cr0 & CR0_XM_SERVSIG != 0 {
            s.servsig = false;
            let parm = s.servparm;
            let psa = apply_prefixing(0, self.prefix);
            self.sysblk
                .storage()
                .store_fullword_absolute(parm, psa + crate::arch::PSA_EXTPARM);
            return Some((EXT_SERVICE_SIGNAL, None));
        }
        None
    }

    /// Park in the stopped state until started, reset, or shut down.
    fn stopped_wait(&mut self) -> bool {
        {
            let mut s = self.sysblk.intlock();
            if s.cpus[self.cpuad].state == CpuState::Stopping {
                let storstat = s.cpus[self.cpuad].storstat;
                s.cpus[self.cpuad].storstat = false;
                s.cpus[self.cpuad].state = CpuState::Stopped;
                drop(s);
                if storstat {
                    // Stop-and-store: status goes to the absolute-zero block.
                    self.store_status(0);
                }
                self.publish_status();
                self.sysblk.wake_all();
            }
        }
        loop {
            if self.sysblk.is_shutdown() {
                return false;
            }
            let mut s = self.sysblk.intlock();
            // Serve broadcasts and resets even while stopped.
            if s.brdcstptlb > self.seen_ptlb
                || s.brdcstpalb > self.seen_palb
                || s.cpus[self.cpuad].sigp_reset
                || s.cpus[self.cpuad].sigp_initial_reset
                || s.cpus[self.cpuad].restart
            {
                drop(s);
                return self.boundary_work();
            }
            if s.cpus[self.cpuad].state != CpuState::Stopped {
                // Honor purges requested while we were stopped (Set Prefix).
                let purge_tlb = s.cpus[self.cpuad].purge_tlb;
                let purge_alb = s.cpus[self.cpuad].purge_alb;
                s.cpus[self.cpuad].purge_tlb = false;
                s.cpus[self.cpuad].purge_alb = false;
                drop(s);
                if purge_tlb {
                    self.prefix = self.sysblk.prefix(self.cpuad);
                    self.purge_tlb();
                }
                if purge_alb {
                    self.purge_alb();
                }
                return true;
            }
            let _unused = self.sysblk.intwait_timeout(s, Duration::from_millis(50));
        }
    }

    /// Enabled-wait: block until an interrupt may be pending.
    fn psw_wait(&mut self) -> bool {
        loop {
            if self.sysblk.is_shutdown() {
                return false;
            }
            if self.sysblk.cpuint(self.cpuad) {
                return true;
            }
            {
                let s = self.sysblk.intlock();
                if s.cpus[self.cpuad].state != CpuState::Started {
                    return true;
                }
                let _unused = self.sysblk.intwait_timeout(s, Duration::from_millis(50));
            }
        }
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("cpuad", &self.cpuad)
            .field("arch", &self.arch)
            .field("psw", &self.psw)
            .field("prefix", &self.prefix)
            .field("instcount", &self.instcount)
            .finish_non_exhaustive()
    }
}
