//! The system block proper.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use s390_storage::MainStorage;

use crate::tod::TodState;

/// Size of the architectural store-status save area.
pub const STATUS_BLOCK_LEN: usize = 512;

/// CPU state machine driven by SIGP orders and the dispatch loop.
///
/// `Stopping` is the transient state between a Stop-class order and the
/// next instruction boundary, where the CPU thread itself completes the
/// transition to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    /// Thread exists but has not finished coming online.
    Starting,
    /// Instruction dispatch in progress.
    Started,
    /// Stop requested; takes effect at the next instruction boundary.
    Stopping,
    /// Halted; leaves only via SIGP Start/Restart/reset orders.
    Stopped,
}

/// Per-CPU signaling state. Every field is protected by the interrupt lock.
#[derive(Debug)]
pub struct CpuSignals {
    /// CPU is part of the configuration.
    pub online: bool,
    pub state: CpuState,
    /// External-call interrupt pending.
    pub extcall: bool,
    /// CPU address of the external-call originator.
    pub extccpu: u16,
    /// Emergency-signal interrupt pending.
    pub emersig: bool,
    /// Bit mask of CPU addresses with an emergency signal outstanding.
    pub emercpu: u64,
    /// Restart interrupt pending.
    pub restart: bool,
    /// Store status when the stop completes.
    pub storstat: bool,
    /// CPU-reset order pending.
    pub sigp_reset: bool,
    /// Initial-CPU-reset order pending.
    pub sigp_initial_reset: bool,
    /// Clock-comparator interrupt pending.
    pub ckpend: bool,
    /// CPU-timer interrupt pending.
    pub ptpend: bool,
    /// Interval-timer interrupt pending (S/370).
    pub itimer_pend: bool,
    /// TLB purge requested while the CPU was stopped (SIGP Set Prefix).
    pub purge_tlb: bool,
    /// ALB purge requested while the CPU was stopped.
    pub purge_alb: bool,
}

impl CpuSignals {
    fn offline() -> Self {
        Self {
            online: false,
            state: CpuState::Stopped,
            extcall: false,
            extccpu: 0,
            emersig: false,
            emercpu: 0,
            restart: false,
            storstat: false,
            sigp_reset: false,
            sigp_initial_reset: false,
            ckpend: false,
            ptpend: false,
            itimer_pend: false,
            purge_tlb: false,
            purge_alb: false,
        }
    }

    /// Clear everything a CPU reset clears.
    pub fn clear_for_reset(&mut self) {
        let online = self.online;
        let state = self.state;
        *self = Self::offline();
        self.online = online;
        self.state = state;
    }
}

/// Broadcast-purge classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// Purge the translation-lookaside buffer.
    Ptlb,
    /// Purge the ART-lookaside buffer.
    Palb,
}

/// State behind the interrupt lock.
#[derive(Debug)]
pub struct IntState {
    pub cpus: Vec<CpuSignals>,
    /// Sequence number of the latest TLB-purge broadcast.
    pub brdcstptlb: u64,
    /// Sequence number of the latest ALB-purge broadcast.
    pub brdcstpalb: u64,
    /// CPUs that have still to respond to the current broadcast.
    pub brdcstncpu: usize,
    /// Service-signal external interrupt pending.
    pub servsig: bool,
    /// Service-signal parameter.
    pub servparm: u32,
}

/// Process-wide shared state: storage, locks, clocks, signaling.
#[derive(Debug)]
pub struct SysBlk {
    storage: MainStorage,
    numcpu: usize,
    /// CPU identification number reported by STIDP.
    pub cpuid: u64,
    /// Load parameter (operator-set, reported in the SPCCB).
    pub loadparm: [u8; 8],

    intlock: Mutex<IntState>,
    intcond: Condvar,
    mainlock: Mutex<()>,
    sigpbusy: Mutex<bool>,
    todlock: Mutex<TodState>,

    /// Configuration is shutting down; CPU threads exit at the next
    /// instruction boundary.
    shutdown: AtomicBool,
    /// Per-CPU fast flag: some interrupt may be pending. Set under the
    /// interrupt lock, cleared only by the owning CPU.
    cpuint: Vec<AtomicBool>,
    /// Per-CPU prefix mirror so the timer thread can reach each PSA.
    prefix: Vec<AtomicU64>,
    /// Published store-status block per CPU, refreshed at every stop.
    status: Vec<Mutex<[u8; STATUS_BLOCK_LEN]>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SysBlk {
    /// Build a system block for `numcpu` engines over `storage`.
    ///
    /// Every CPU starts offline and stopped; configuration happens when the
    /// CPU thread comes up.
    #[must_use]
    pub fn new(storage: MainStorage, numcpu: usize) -> Self {
        let mut cpus = Vec::with_capacity(numcpu);
        let mut cpuint = Vec::with_capacity(numcpu);
        let mut prefix = Vec::with_capacity(numcpu);
        let mut status = Vec::with_capacity(numcpu);
        for _ in 0..numcpu {
            cpus.push(CpuSignals::offline());
            cpuint.push(AtomicBool::new(false));
            prefix.push(AtomicU64::new(0));
            status.push(Mutex::new([0; STATUS_BLOCK_LEN]));
        }
        Self {
            storage,
            numcpu,
            cpuid: 0x0000_0001_3090_0000,
            loadparm: *b"        ",
            intlock: Mutex::new(IntState {
                cpus,
                brdcstptlb: 0,
                brdcstpalb: 0,
                brdcstncpu: 0,
                servsig: false,
                servparm: 0,
            }),
            intcond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            mainlock: Mutex::new(()),
            sigpbusy: Mutex::new(false),
            todlock: Mutex::new(TodState::new(numcpu)),
            cpuint,
            prefix,
            status,
        }
    }

    /// Absolute main storage.
    #[must_use]
    pub const fn storage(&self) -> &MainStorage {
        &self.storage
    }

    /// Number of configured engines.
    #[must_use]
    pub const fn numcpu(&self) -> usize {
        self.numcpu
    }

    /// Ask every CPU thread to exit at its next instruction boundary.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake_all();
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Interrupt lock ===

    /// Take the interrupt lock.
    pub fn intlock(&self) -> MutexGuard<'_, IntState> {
        relock(&self.intlock)
    }

    /// Wake every thread waiting on the interrupt condition.
    pub fn wake_all(&self) {
        self.intcond.notify_all();
    }

    /// Wait on the interrupt condition, consuming and returning the guard.
    pub fn intwait<'a>(&'a self, guard: MutexGuard<'a, IntState>) -> MutexGuard<'a, IntState> {
        self.intcond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait on the interrupt condition with a timeout.
    pub fn intwait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, IntState>,
        timeout: Duration,
    ) -> MutexGuard<'a, IntState> {
        self.intcond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    /// Fast per-CPU "interrupt may be pending" flag.
    #[must_use]
    pub fn cpuint(&self, cpu: usize) -> bool {
        self.cpuint[cpu].load(Ordering::Acquire)
    }

    /// Raise the fast pending flag. Call with the interrupt lock held.
    pub fn set_cpuint(&self, cpu: usize) {
        self.cpuint[cpu].store(true, Ordering::Release);
    }

    /// Clear the fast pending flag. Only the owning CPU does this, under
    /// the interrupt lock, after re-checking the real pending bits.
    pub fn clear_cpuint(&self, cpu: usize) {
        self.cpuint[cpu].store(false, Ordering::Release);
    }

    // === Main-storage lock (interlocked-update sequences) ===

    /// Take the main-storage lock bracketing an interlocked update.
    pub fn mainlock(&self) -> MutexGuard<'_, ()> {
        relock(&self.mainlock)
    }

    // === SIGP facility ===

    /// Claim the signaling facility. Returns false if it is busy.
    pub fn sigp_claim(&self) -> bool {
        let mut busy = relock(&self.sigpbusy);
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    /// Release the signaling facility.
    pub fn sigp_release(&self) {
        *relock(&self.sigpbusy) = false;
    }

    // === Prefix mirror ===

    /// Prefix register of `cpu` as last published.
    #[must_use]
    pub fn prefix(&self, cpu: usize) -> u64 {
        self.prefix[cpu].load(Ordering::Acquire)
    }

    /// Publish a new prefix value for `cpu`.
    pub fn set_prefix(&self, cpu: usize, prefix: u64) {
        self.prefix[cpu].store(prefix, Ordering::Release);
    }

    // === Store-status snapshots ===

    /// Publish the architectural status block for `cpu`.
    pub fn publish_status(&self, cpu: usize, block: &[u8; STATUS_BLOCK_LEN]) {
        *relock(&self.status[cpu]) = *block;
    }

    /// Copy the architected 216-511 range of the last published status
    /// block of `cpu` to the save area based at absolute `abs`.
    pub fn store_status_at(&self, cpu: usize, abs: u64) {
        let block = *relock(&self.status[cpu]);
        self.storage.store_bytes_absolute(&block[216..], abs + 216);
    }

    // === Broadcast purges ===

    /// Ask every online peer of `origin` to perform a purge, then wait for
    /// quiescence. The caller must have already purged locally and must
    /// *not* hold the main-storage lock.
    pub fn synchronize_broadcast(&self, origin: usize, kind: BroadcastKind) {
        let mut s = self.intlock();
        match kind {
            BroadcastKind::Ptlb => s.brdcstptlb += 1,
            BroadcastKind::Palb => s.brdcstpalb += 1,
        }
        let peers = s
            .cpus
            .iter()
            .enumerate()
            .filter(|(n, c)| *n != origin && c.online)
            .count();
        s.brdcstncpu = peers;
        if peers == 0 {
            return;
        }
        for n in 0..self.numcpu {
            if n != origin && s.cpus[n].online {
                self.set_cpuint(n);
            }
        }
        self.wake_all();
        while s.brdcstncpu > 0 {
            s = self.intwait(s);
        }
    }

    /// A peer reports its purge complete. Call with the interrupt lock held.
    pub fn broadcast_done(&self, s: &mut IntState) {
        if s.brdcstncpu > 0 {
            s.brdcstncpu -= 1;
            if s.brdcstncpu == 0 {
                self.wake_all();
            }
        }
    }

    // === TOD clock and timers ===

    /// Read the TOD clock; strictly increasing across successive reads.
    pub fn read_tod(&self) -> u64 {
        relock(&self.todlock).read()
    }

    /// Set the TOD clock so subsequent reads report `value` onward.
    pub fn set_tod(&self, value: u64) {
        relock(&self.todlock).set(value);
    }

    /// Clock comparator of `cpu`.
    #[must_use]
    pub fn clock_comparator(&self, cpu: usize) -> u64 {
        relock(&self.todlock).clkc(cpu)
    }

    /// Set the clock comparator of `cpu`, refreshing its pending state.
    pub fn set_clock_comparator(&self, cpu: usize, value: u64) {
        let expired = {
            let mut tod = relock(&self.todlock);
            tod.set_clkc(cpu, value);
            tod.clkc_expired(cpu)
        };
        self.set_timer_pending(cpu, expired, None);
    }

    /// CPU timer of `cpu`.
    #[must_use]
    pub fn cpu_timer(&self, cpu: usize) -> i64 {
        relock(&self.todlock).ptimer(cpu)
    }

    /// Set the CPU timer of `cpu`, refreshing its pending state.
    pub fn set_cpu_timer(&self, cpu: usize, value: i64) {
        relock(&self.todlock).set_ptimer(cpu, value);
        self.set_timer_pending(cpu, None, Some(value < 0));
    }

    fn set_timer_pending(&self, cpu: usize, ck: Option<bool>, pt: Option<bool>) {
        let mut s = self.intlock();
        if let Some(ck) = ck {
            s.cpus[cpu].ckpend = ck;
        }
        if let Some(pt) = pt {
            s.cpus[cpu].ptpend = pt;
        }
        if s.cpus[cpu].ckpend || s.cpus[cpu].ptpend {
            self.set_cpuint(cpu);
            self.wake_all();
        }
    }

    /// One timer-thread tick: advance the TOD, decrement CPU timers, and
    /// raise clock-comparator / CPU-timer pendings on every online CPU.
    ///
    /// Returns the TOD value after the update.
    pub fn tod_tick(&self) -> u64 {
        let (now, results) = {
            let mut tod = relock(&self.todlock);
            tod.tick()
        };
        let mut s = self.intlock();
        let mut wake = false;
        for (cpu, (ck, pt)) in results.iter().enumerate() {
            if !s.cpus[cpu].online {
                continue;
            }
            if *ck && !s.cpus[cpu].ckpend {
                s.cpus[cpu].ckpend = true;
                self.set_cpuint(cpu);
                wake = true;
            }
            if *pt && !s.cpus[cpu].ptpend {
                s.cpus[cpu].ptpend = true;
                self.set_cpuint(cpu);
                wake = true;
            }
        }
        drop(s);
        if wake {
            self.wake_all();
        }
        now
    }

    /// Raise the service-signal external interrupt with `parm`.
    pub fn raise_service_signal(&self, parm: u32) {
        let mut s = self.intlock();
        s.servsig = true;
        s.servparm = parm;
        for n in 0..self.numcpu {
            if s.cpus[n].online {
                self.set_cpuint(n);
            }
        }
        drop(s);
        self.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sysblk(ncpu: usize) -> SysBlk {
        SysBlk::new(MainStorage::new(0x10000), ncpu)
    }

    #[test]
    fn sigp_facility_is_exclusive() {
        let blk = sysblk(2);
        assert!(blk.sigp_claim());
        assert!(!blk.sigp_claim());
        blk.sigp_release();
        assert!(blk.sigp_claim());
    }

    #[test]
    fn tod_reads_are_strictly_increasing() {
        let blk = sysblk(1);
        let a = blk.read_tod();
        let b = blk.read_tod();
        let c = blk.read_tod();
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn set_tod_moves_reported_time() {
        let blk = sysblk(1);
        let target = 0x8000_0000_0000_0000;
        blk.set_tod(target);
        let v = blk.read_tod();
        assert!(v >= target);
        // Not wildly past it either: well under a second of drift.
        assert!(v - target < 0x1_0000_0000_0000);
    }

    #[test]
    fn broadcast_without_peers_returns_immediately() {
        let blk = sysblk(1);
        {
            let mut s = blk.intlock();
            s.cpus[0].online = true;
            s.cpus[0].state = CpuState::Started;
        }
        blk.synchronize_broadcast(0, BroadcastKind::Ptlb);
        assert_eq!(blk.intlock().brdcstptlb, 1);
        assert_eq!(blk.intlock().brdcstncpu, 0);
    }

    #[test]
    fn broadcast_waits_for_peer() {
        use std::sync::Arc;
        let blk = Arc::new(sysblk(2));
        {
            let mut s = blk.intlock();
            s.cpus[0].online = true;
            s.cpus[1].online = true;
        }
        let peer = Arc::clone(&blk);
        let handle = std::thread::spawn(move || {
            // Emulate the peer's instruction-boundary check.
            loop {
                let mut s = peer.intlock();
                if s.brdcstncpu > 0 {
                    peer.broadcast_done(&mut s);
                    return;
                }
                drop(s);
                std::thread::yield_now();
            }
        });
        blk.synchronize_broadcast(0, BroadcastKind::Ptlb);
        assert_eq!(blk.intlock().brdcstncpu, 0);
        handle.join().expect("peer thread");
    }

    #[test]
    fn cpu_timer_negative_raises_pending() {
        let blk = sysblk(1);
        {
            let mut s = blk.intlock();
            s.cpus[0].online = true;
        }
        blk.set_cpu_timer(0, -1);
        assert!(blk.intlock().cpus[0].ptpend);
        assert!(blk.cpuint(0));
    }

    #[test]
    fn clock_comparator_in_past_raises_pending() {
        let blk = sysblk(1);
        {
            let mut s = blk.intlock();
            s.cpus[0].online = true;
        }
        blk.set_clock_comparator(0, 1);
        assert!(blk.intlock().cpus[0].ckpend);
    }

    #[test]
    fn service_signal_flags_every_online_cpu() {
        let blk = sysblk(2);
        {
            let mut s = blk.intlock();
            s.cpus[0].online = true;
            s.cpus[1].online = true;
        }
        blk.raise_service_signal(0x1234_5678);
        let s = blk.intlock();
        assert!(s.servsig);
        assert_eq!(s.servparm, 0x1234_5678);
        assert!(blk.cpuint(0) && blk.cpuint(1));
    }
}
