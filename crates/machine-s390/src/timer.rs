//! The timer thread: TOD advance, clock comparator and CPU timer
//! pendings, and the S/370 interval timer at real location 80.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpu_s390::ArchMode;
use s390_storage::apply_prefixing;
use s390_system::SysBlk;

/// Interval-timer units per microsecond, scaled by 2²⁰: bit 23 counts
/// at 300 Hz, so the timer decrements 76 800 units per second.
const ITIMER_UNITS_PER_US_SHIFTED: u64 = (76_800 << 20) / 1_000_000;

/// PSA offset of the interval timer.
const PSA_INTTIMER: u64 = 80;

pub(crate) fn spawn(sysblk: Arc<SysBlk>, arch: ArchMode, interval_ms: u64) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last = sysblk.read_tod();
        let mut itimer_frac: u64 = 0;
        while !sysblk.is_shutdown() {
            std::thread::sleep(Duration::from_millis(interval_ms.max(1)));
            let now = sysblk.tod_tick();
            if arch == ArchMode::S370 {
                // Elapsed microseconds since the previous tick.
                let elapsed_us = now.saturating_sub(last) >> 12;
                itimer_frac += elapsed_us * ITIMER_UNITS_PER_US_SHIFTED;
                let dec = (itimer_frac >> 20) as i32;
                itimer_frac &= (1 << 20) - 1;
                if dec > 0 {
                    update_interval_timers(&sysblk, dec);
                }
            }
            last = now;
        }
    })
}

/// Decrement the interval timer of every online CPU; a positive-to-
/// negative transition raises the interval-timer external interruption.
fn update_interval_timers(sysblk: &Arc<SysBlk>, dec: i32) {
    let numcpu = sysblk.numcpu();
    for n in 0..numcpu {
        let psa = apply_prefixing(PSA_INTTIMER, sysblk.prefix(n));
        if !sysblk.storage().contains(psa, 4) {
            continue;
        }
        let (old, new) = {
            // The interval timer is updated under the TOD-class locking
            // discipline; the interrupt lock serves here since the flag
            // update needs it anyway.
            let mut s = sysblk.intlock();
            if !s.cpus[n].online {
                continue;
            }
            let old = sysblk.storage().fetch_fullword_absolute(psa) as i32;
            let new = old.wrapping_sub(dec);
            sysblk.storage().store_fullword_absolute(new as u32, psa);
            if new < 0 && old >= 0 {
                s.cpus[n].itimer_pend = true;
                sysblk.set_cpuint(n);
            }
            (old, new)
        };
        if new < 0 && old >= 0 {
            sysblk.wake_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s390_storage::MainStorage;

    #[test]
    fn interval_timer_sign_flip_raises_pending() {
        let sysblk = Arc::new(SysBlk::new(MainStorage::new(0x10_0000), 1));
        {
            let mut s = sysblk.intlock();
            s.cpus[0].online = true;
        }
        sysblk.storage().store_fullword_absolute(5, PSA_INTTIMER);
        update_interval_timers(&sysblk, 10);
        let s = sysblk.intlock();
        assert!(s.cpus[0].itimer_pend);
        drop(s);
        assert!(sysblk.cpuint(0));
        let value = sysblk.storage().fetch_fullword_absolute(PSA_INTTIMER) as i32;
        assert_eq!(value, -5);
    }

    #[test]
    fn interval_timer_no_flip_no_pending() {
        let sysblk = Arc::new(SysBlk::new(MainStorage::new(0x10_0000), 1));
        {
            let mut s = sysblk.intlock();
            s.cpus[0].online = true;
        }
        sysblk
            .storage()
            .store_fullword_absolute(100_000, PSA_INTTIMER);
        update_interval_timers(&sysblk, 10);
        assert!(!sysblk.intlock().cpus[0].itimer_pend);
    }
}
