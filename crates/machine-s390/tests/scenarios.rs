//! End-to-end scenarios over the assembled machine: translation and
//! protection through real page tables, multi-CPU TLB coherence,
//! interlocked updates under contention, SIGP, and decimal arithmetic.

use std::sync::Arc;

use cpu_s390::arch::{CR0_ASF, CR0_TRAN_ESA390, SEGTAB_INVALID, SEGTAB_PTL, STD_STL};
use cpu_s390::fault::{PGM_PRIVILEGED_OPERATION, PGM_SEGMENT_TRANSLATION};
use cpu_s390::regs::{PSW_DATMODE, PSW_EXTMASK};
use cpu_s390::{Cpu, Fault, Space};
use s390_storage::{MainStorage, STORKEY_CHANGE, STORKEY_REF};
use s390_system::{CpuState, SysBlk};

const STO: u64 = 0x1000;
const PT_BASE: u64 = 0x8000;

/// Map one 4 KiB page in the segment table at `STO`.
fn map_page(sysblk: &SysBlk, vaddr: u64, raddr: u64) {
    let stor = sysblk.storage();
    let seg = vaddr >> 20;
    let pto = PT_BASE + seg * 0x400;
    stor.store_fullword_absolute(pto as u32 | SEGTAB_PTL, STO + seg * 4);
    let px = (vaddr >> 12) & 0xFF;
    stor.store_fullword_absolute((raddr & 0x7FFF_F000) as u32, pto + px * 4);
}

/// A sysblk with `ncpu` online, started engines over 16 MiB.
fn sysblk(ncpu: usize) -> Arc<SysBlk> {
    let blk = Arc::new(SysBlk::new(MainStorage::new(0x0100_0000), ncpu));
    {
        let mut s = blk.intlock();
        for c in &mut s.cpus {
            c.online = true;
            c.state = CpuState::Started;
        }
    }
    blk
}

/// A CPU with DAT on through the test segment table.
fn dat_cpu(blk: &Arc<SysBlk>, n: usize) -> Cpu {
    let mut cpu = Cpu::new(Arc::clone(blk), n);
    cpu.regs.set_cr_l(0, CR0_TRAN_ESA390 | CR0_ASF);
    cpu.regs.set_cr_l(1, STO as u32 | STD_STL);
    cpu.regs.set_cr_l(13, STO as u32 | STD_STL);
    cpu.psw.ecmode = true;
    cpu.psw.amode = true;
    cpu.psw.sysmask = PSW_DATMODE | PSW_EXTMASK;
    cpu
}

// S1: a mapped store lands in the right absolute frame and flips the
// reference and change bits of that frame's key.
#[test]
fn mapped_store_updates_frame_and_key() {
    let blk = sysblk(1);
    map_page(&blk, 0x0010_0000, 0x0020_0000);
    let mut cpu = dat_cpu(&blk, 0);
    cpu.vstoreb(0xAA, 0x0010_0010, Space::Ar(0)).expect("store");
    assert_eq!(blk.storage().peek(0x0020_0010), 0xAA);
    let key = blk.storage().key(0x0020_0000);
    assert_eq!(key & (STORKEY_REF | STORKEY_CHANGE), STORKEY_REF | STORKEY_CHANGE);
}

// S2: an invalid segment raises 0x0010 with the TEA set to the failing
// page address.
#[test]
fn invalid_segment_raises_translation_exception() {
    let blk = sysblk(1);
    map_page(&blk, 0x0010_0000, 0x0020_0000);
    let ste_addr = STO + (0x0010_0000u64 >> 20) * 4;
    let ste = blk.storage().fetch_fullword_absolute(ste_addr);
    blk.storage()
        .store_fullword_absolute(ste | SEGTAB_INVALID, ste_addr);
    let mut cpu = dat_cpu(&blk, 0);
    let err = cpu.vfetchb(0x0010_0000, Space::Ar(0)).expect_err("fault");
    assert_eq!(err, Fault(PGM_SEGMENT_TRANSLATION));
    assert_eq!(cpu.tea, 0x0010_0000);
}

// S3: IPTE on one CPU invalidates the matching TLB entry on a peer
// before the instruction completes.
#[test]
fn ipte_purges_peer_tlb_before_completing() {
    let blk = sysblk(2);
    map_page(&blk, 0x0000_1000, 0x000F_0000);
    let mut cpu0 = dat_cpu(&blk, 0);
    let mut cpu1 = dat_cpu(&blk, 1);

    // CPU1 warms its TLB for the page, then sits in an enabled wait
    // where it still honors broadcasts at each boundary.
    cpu1.vfetchb(0x0000_1000, Space::Ar(0)).expect("warm TLB");
    assert!(cpu1.tlb_entry_valid(0x0000_1000));
    cpu1.psw.wait = true;
    let peer = std::thread::spawn(move || {
        cpu1.run();
        cpu1
    });

    // CPU0 invalidates the PTE: R1 = page-table origin, R2 = page index.
    let pto = PT_BASE as u32;
    cpu0.regs.set_gr_l(1, pto);
    cpu0.regs.set_gr_l(2, 0x0000_1000);
    let ipte = [0xB2, 0x21, 0x00, 0x12, 0, 0];
    cpu0.exec_ipte(&ipte).expect("IPTE");

    // The instruction has completed, so the peer's TLB entry is gone.
    blk.request_shutdown();
    let cpu1 = peer.join().expect("peer thread");
    assert!(!cpu1.tlb_entry_valid(0x0000_1000));

    // And the PTE in storage now carries the invalid bit.
    let pte = blk.storage().fetch_fullword_absolute(PT_BASE + 4);
    assert_ne!(pte & cpu_s390::arch::PAGETAB_INVALID, 0);
}

// S4/S5: SPKA honors the PSW-key mask in problem state.
#[test]
fn spka_key_mask_gates_problem_state() {
    let blk = sysblk(1);
    let mut cpu = dat_cpu(&blk, 0);
    cpu.psw.prob = true;
    cpu.regs.set_cr_l(3, 0x0100_0000); // PKM allows key 7 only
    let spka7 = [0xB2, 0x0A, 0x00, 0x70, 0, 0];
    cpu.exec_spka(&spka7).expect("SPKA 7");
    assert_eq!(cpu.psw.pkey, 7);
    let spka3 = [0xB2, 0x0A, 0x00, 0x30, 0, 0];
    let err = cpu.exec_spka(&spka3).expect_err("SPKA 3 denied");
    assert_eq!(err, Fault(PGM_PRIVILEGED_OPERATION));
}

// S6: CS succeeds uncontended, and under two-CPU contention every
// increment lands exactly once.
#[test]
fn compare_and_swap_under_contention() {
    let blk = sysblk(2);
    blk.storage().store_fullword_absolute(0, 0x1000);

    let mut workers = Vec::new();
    for n in 0..2 {
        let blk = Arc::clone(&blk);
        workers.push(std::thread::spawn(move || {
            let mut cpu = Cpu::new(blk, n);
            cpu.psw.ecmode = true;
            cpu.psw.amode = true;
            cpu.regs.set_gr_l(1, 0x1000);
            let inst = [0xBA, 0x45, 0x10, 0x00, 0, 0];
            for _ in 0..500 {
                loop {
                    let current = cpu.vfetch4(0x1000, Space::Ar(0)).expect("fetch");
                    cpu.regs.set_gr_l(4, current);
                    cpu.regs.set_gr_l(5, current + 1);
                    cpu.exec_cs(&inst).expect("CS");
                    if cpu.psw.cc == 0 {
                        break;
                    }
                }
            }
        }));
    }
    for w in workers {
        w.join().expect("worker");
    }
    assert_eq!(blk.storage().fetch_fullword_absolute(0x1000), 1000);
}

// S7: AP on packed operands: 12345C + 00001C = 12346C with cc 2.
#[test]
fn add_decimal_positive() {
    let blk = sysblk(1);
    let mut cpu = Cpu::new(Arc::clone(&blk), 0);
    cpu.psw.ecmode = true;
    cpu.psw.amode = true;
    blk.storage().store_bytes_absolute(&[0x12, 0x34, 0x5C], 0x2000);
    blk.storage().store_bytes_absolute(&[0x00, 0x00, 0x1C], 0x3000);
    cpu.regs.set_gr_l(1, 0x2000);
    cpu.regs.set_gr_l(2, 0x3000);
    let ap = [0xFA, 0x22, 0x10, 0x00, 0x20, 0x00];
    cpu.exec_ap(&ap).expect("AP");
    let mut out = [0u8; 3];
    blk.storage().fetch_bytes_absolute(&mut out, 0x2000);
    assert_eq!(out, [0x12, 0x34, 0x6C]);
    assert_eq!(cpu.psw.cc, 2);
}

// S8: SIGP against an ordinal beyond the configuration answers cc 3.
#[test]
fn sigp_beyond_configuration_is_cc3() {
    let blk = sysblk(2);
    let mut cpu = Cpu::new(Arc::clone(&blk), 0);
    cpu.regs.set_gr_l(4, 5);
    let sigp = [0xAE, 0x24, 0x00, 0x05, 0, 0]; // order: stop
    cpu.exec_sigp(&sigp).expect("SIGP");
    assert_eq!(cpu.psw.cc, 3);
    assert_eq!(blk.intlock().cpus[1].state, CpuState::Started);
}

// Property 10: a CSP broadcast does not return until every peer has
// drained the purge request.
#[test]
fn csp_broadcast_waits_for_quiescence() {
    let blk = sysblk(2);
    map_page(&blk, 0x0000_1000, 0x000F_0000);
    let mut cpu0 = dat_cpu(&blk, 0);
    let mut cpu1 = dat_cpu(&blk, 1);
    cpu1.vfetchb(0x0000_1000, Space::Ar(0)).expect("warm TLB");
    cpu1.psw.wait = true;
    let peer = std::thread::spawn(move || {
        cpu1.run();
        cpu1
    });

    blk.storage().store_fullword_absolute(7, 0x3000);
    cpu0.psw.sysmask = 0; // DAT off for the swap itself
    cpu0.regs.set_gr_l(4, 7);
    cpu0.regs.set_gr_l(5, 8);
    cpu0.regs.set_gr_l(6, 0x3000 | 1); // purge-TLB request
    let csp = [0xB2, 0x50, 0x00, 0x46, 0, 0];
    cpu0.exec_csp(&csp).expect("CSP");
    assert_eq!(cpu0.psw.cc, 0);
    // Quiescence reached: the counter is back to zero.
    assert_eq!(blk.intlock().brdcstncpu, 0);

    blk.request_shutdown();
    let cpu1 = peer.join().expect("peer thread");
    assert_eq!(cpu1.tlb_valid_count(), 0);
    assert_eq!(blk.storage().fetch_fullword_absolute(0x3000), 8);
}

// Instruction fetch, decode and PSW swap end to end: a started CPU runs
// a small program out of real storage, then loads a wait PSW.
#[test]
fn dispatch_runs_a_program() {
    let blk = sysblk(1);
    let stor = blk.storage();
    // At 0x200: LA 1,0x456 ; ST 1,0x300 ; LPSW 0x2A0 (wait PSW).
    stor.store_bytes_absolute(&[0x41, 0x10, 0x04, 0x56], 0x200);
    stor.store_bytes_absolute(&[0x50, 0x10, 0x03, 0x00], 0x204);
    stor.store_bytes_absolute(&[0x82, 0x00, 0x02, 0xA0], 0x208);
    // Wait PSW: enabled wait, 31-bit, IA 0.
    stor.store_bytes_absolute(&[0x01, 0x0A, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00], 0x2A0);

    let mut cpu = Cpu::new(Arc::clone(&blk), 0);
    cpu.psw.ecmode = true;
    cpu.psw.amode = true;
    cpu.psw.ia = 0x200;
    for _ in 0..3 {
        assert!(cpu.step());
    }
    assert_eq!(blk.storage().fetch_fullword_absolute(0x300), 0x456);
    assert!(cpu.psw.wait);
    assert_eq!(cpu.instcount, 3);
}
