//! Shared test fixtures: a wired-up CPU over fresh storage, and ESA/390
//! page-table construction helpers.

use std::sync::Arc;

use s390_storage::MainStorage;
use s390_system::{CpuState, SysBlk};

use crate::arch::{CR0_ASF, CR0_TRAN_ESA390, SEGTAB_PTL, STD_STL, STD_STO};
use crate::cpu::Cpu;
use crate::regs::{AsMode, PSW_DATMODE, PSW_EXTMASK};

/// Segment table origin used by the fixtures.
pub const TEST_STO: u32 = 0x1000;
/// First page-table frame; one 1 KiB table per segment, in segment order.
const PT_BASE: u64 = 0x8000;

/// Map one 4 KiB virtual page to a real frame in the table rooted at
/// `std`. Tables live at fixed frames so mappings can be added on the fly.
pub fn map_page(sysblk: &Arc<SysBlk>, std: u32, vaddr: u64, raddr: u64) {
    let stor = sysblk.storage();
    let sto = u64::from(std & STD_STO);
    let seg = vaddr >> 20;
    let pto = PT_BASE + seg * 0x400;
    stor.store_fullword_absolute(pto as u32 | SEGTAB_PTL, sto + seg * 4);
    let px = (vaddr >> 12) & 0xFF;
    stor.store_fullword_absolute((raddr & 0x7FFF_F000) as u32, pto + px * 4);
}

/// A CPU in ESA/390 mode, DAT on, primary-space, with `mainsize` bytes of
/// storage and the given pages mapped in the primary segment table.
pub fn esa_cpu_with_map(mainsize: u64, pages: &[(u64, u64)]) -> Cpu {
    let sysblk = Arc::new(SysBlk::new(MainStorage::new(mainsize), 1));
    {
        let mut s = sysblk.intlock();
        s.cpus[0].online = true;
        s.cpus[0].state = CpuState::Started;
    }
    let mut cpu = Cpu::new(Arc::clone(&sysblk), 0);
    cpu.regs.set_cr_l(0, CR0_TRAN_ESA390 | CR0_ASF);
    cpu.regs.set_cr_l(1, TEST_STO | STD_STL);
    cpu.regs.set_cr_l(13, TEST_STO | STD_STL);
    cpu.psw.ecmode = true;
    cpu.psw.amode = true;
    cpu.psw.sysmask = PSW_DATMODE | PSW_EXTMASK;
    cpu.psw.asmode = AsMode::Primary;
    for &(vaddr, raddr) in pages {
        map_page(&sysblk, cpu.regs.cr_l(1), vaddr, raddr);
    }
    cpu
}

/// A CPU with DAT off over `mainsize` bytes (real-mode fixtures).
pub fn real_cpu(mainsize: u64) -> Cpu {
    let sysblk = Arc::new(SysBlk::new(MainStorage::new(mainsize), 1));
    {
        let mut s = sysblk.intlock();
        s.cpus[0].online = true;
        s.cpus[0].state = CpuState::Started;
    }
    let mut cpu = Cpu::new(sysblk, 0);
    cpu.psw.ecmode = true;
    cpu.psw.amode = true;
    cpu
}
