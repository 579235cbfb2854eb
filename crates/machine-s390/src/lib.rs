//! Machine assembly: absolute storage, the shared system block, one
//! dispatch thread per configured CPU, and the timer thread.
//!
//! The machine owns the threads; CPU execution state lives inside each
//! thread's `Cpu` and comes back to the caller at power-off. Operator
//! actions (start, stop, restart) manipulate the shared signaling state
//! exactly as SIGP orders do.

mod config;
mod timer;

pub use config::MachineConfig;

use std::sync::Arc;
use std::thread::JoinHandle;

use cpu_s390::Cpu;
use s390_storage::MainStorage;
use s390_system::{CpuState, SysBlk};

/// A powered-on machine.
pub struct Machine {
    sysblk: Arc<SysBlk>,
    cpus: Vec<JoinHandle<Cpu>>,
    timer: Option<JoinHandle<()>>,
}

impl Machine {
    /// Allocate storage, bring every CPU online (stopped), and start the
    /// timer thread.
    #[must_use]
    pub fn power_on(config: &MachineConfig) -> Self {
        Self::power_on_with(config, |_| {})
    }

    /// Power on, running `setup` on each CPU context before its dispatch
    /// loop starts. Tests use this to preload registers and PSWs.
    pub fn power_on_with<F>(config: &MachineConfig, setup: F) -> Self
    where
        F: Fn(&mut Cpu) + Send + Sync + 'static,
    {
        let storage = MainStorage::new(config.mainsize);
        let mut sysblk = SysBlk::new(storage, config.numcpu);
        sysblk.cpuid = config.cpuid;
        let sysblk = Arc::new(sysblk);

        let setup = Arc::new(setup);
        let mut cpus = Vec::with_capacity(config.numcpu);
        for n in 0..config.numcpu {
            let blk = Arc::clone(&sysblk);
            let setup = Arc::clone(&setup);
            let arch = config.arch;
            cpus.push(std::thread::spawn(move || {
                let mut cpu = Cpu::new(blk, n);
                cpu.arch = arch;
                setup(&mut cpu);
                cpu.run();
                cpu
            }));
        }

        let timer = Some(timer::spawn(
            Arc::clone(&sysblk),
            config.arch,
            config.timer_interval_ms,
        ));

        Self {
            sysblk,
            cpus,
            timer,
        }
    }

    /// The shared system block.
    #[must_use]
    pub fn sysblk(&self) -> &Arc<SysBlk> {
        &self.sysblk
    }

    /// Operator start: put a stopped CPU into the started state.
    pub fn start_cpu(&self, n: usize) {
        let mut s = self.sysblk.intlock();
        if s.cpus[n].state == CpuState::Stopped {
            s.cpus[n].state = CpuState::Started;
        }
        drop(s);
        self.sysblk.wake_all();
    }

    /// Operator stop: request a stop at the next instruction boundary.
    pub fn stop_cpu(&self, n: usize) {
        let mut s = self.sysblk.intlock();
        if s.cpus[n].state == CpuState::Started {
            s.cpus[n].state = CpuState::Stopping;
        }
        drop(s);
        self.sysblk.set_cpuint(n);
        self.sysblk.wake_all();
    }

    /// Operator restart: deliver a restart interruption.
    pub fn restart_cpu(&self, n: usize) {
        let mut s = self.sysblk.intlock();
        s.cpus[n].restart = true;
        if s.cpus[n].state == CpuState::Stopped {
            s.cpus[n].state = CpuState::Stopping;
        }
        drop(s);
        self.sysblk.set_cpuint(n);
        self.sysblk.wake_all();
    }

    /// Current state of CPU `n`.
    #[must_use]
    pub fn cpu_state(&self, n: usize) -> CpuState {
        self.sysblk.intlock().cpus[n].state
    }

    /// Wait until CPU `n` reaches `state` or the timeout expires.
    /// Returns true when the state was reached.
    pub fn wait_for_state(&self, n: usize, state: CpuState, timeout_ms: u64) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            if self.cpu_state(n) == state {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Shut down: every CPU thread exits at its next boundary, the timer
    /// thread stops, and the CPU contexts come back for inspection.
    pub fn power_off(mut self) -> Vec<Cpu> {
        self.sysblk.request_shutdown();
        let mut contexts = Vec::with_capacity(self.cpus.len());
        for handle in self.cpus.drain(..) {
            if let Ok(cpu) = handle.join() {
                contexts.push(cpu);
            }
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpus_come_online_stopped() {
        let machine = Machine::power_on(&MachineConfig::new(0x10_0000, 2));
        assert!(machine.wait_for_state(0, CpuState::Stopped, 1000));
        assert!(machine.wait_for_state(1, CpuState::Stopped, 1000));
        {
            let s = machine.sysblk().intlock();
            assert!(s.cpus[0].online && s.cpus[1].online);
        }
        let contexts = machine.power_off();
        assert_eq!(contexts.len(), 2);
    }

    #[test]
    fn operator_start_and_stop() {
        let machine = Machine::power_on_with(&MachineConfig::new(0x10_0000, 1), |cpu| {
            // An enabled wait keeps the dispatch loop at the boundary.
            cpu.psw.wait = true;
            cpu.psw.sysmask = cpu_s390::regs::PSW_EXTMASK;
        });
        assert!(machine.wait_for_state(0, CpuState::Stopped, 1000));
        machine.start_cpu(0);
        assert!(machine.wait_for_state(0, CpuState::Started, 1000));
        machine.stop_cpu(0);
        assert!(machine.wait_for_state(0, CpuState::Stopped, 1000));
        machine.power_off();
    }

    #[test]
    fn stopped_cpu_publishes_status() {
        let machine = Machine::power_on_with(&MachineConfig::new(0x10_0000, 1), |cpu| {
            cpu.regs.set_gr_l(5, 0xAABB_CCDD);
            cpu.psw.wait = true;
        });
        assert!(machine.wait_for_state(0, CpuState::Stopped, 1000));
        // SIGP Store Status copies the published block.
        machine.sysblk().store_status_at(0, 0x2000);
        // GR5 lives at offset 384 + 5*4 of the status block.
        let word = machine
            .sysblk()
            .storage()
            .fetch_fullword_absolute(0x2000 + 384 + 20);
        assert_eq!(word, 0xAABB_CCDD);
        machine.power_off();
    }
}
