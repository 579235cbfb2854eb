//! Architectural bit layouts: control registers, translation tables,
//! access lists, the DUCT, TEA formation and PSA offsets.
//!
//! Everything here is a 32-bit big-endian word layout; bit 0 is the
//! leftmost bit as the Principles of Operation numbers them.

// === CR0 ===

/// SSM-suppression control (bit 1).
pub const CR0_SSM_SUPP: u32 = 0x4000_0000;
/// Low-address protection (bit 3).
pub const CR0_LOW_PROT: u32 = 0x1000_0000;
/// Extraction-authority control (bit 4).
pub const CR0_EXT_AUTH: u32 = 0x0800_0000;
/// Secondary-space control (bit 5).
pub const CR0_SEC_SPACE: u32 = 0x0400_0000;
/// Fetch-protection override (bit 6).
pub const CR0_FETCH_OVRD: u32 = 0x0200_0000;
/// Storage-protection override (bit 7).
pub const CR0_STORE_OVRD: u32 = 0x0100_0000;
/// Translation-format bits (bits 8-12).
pub const CR0_TRAN_FMT: u32 = 0x00F8_0000;
/// The only valid ESA/390 translation format: 1 MiB segments, 4 KiB pages.
pub const CR0_TRAN_ESA390: u32 = 0x00B0_0000;
/// Address-space-function control (bit 15).
pub const CR0_ASF: u32 = 0x0001_0000;

/// S/370 page-size field (bits 8-9).
pub const CR0_PAGE_SIZE: u32 = 0x00C0_0000;
/// S/370 2 KiB pages.
pub const CR0_PAGE_SZ_2K: u32 = 0x0040_0000;
/// S/370 4 KiB pages.
pub const CR0_PAGE_SZ_4K: u32 = 0x0080_0000;
/// S/370 segment-size field (bits 11-12).
pub const CR0_SEG_SIZE: u32 = 0x0018_0000;
/// S/370 64 KiB segments.
pub const CR0_SEG_SZ_64K: u32 = 0x0000_0000;
/// S/370 1 MiB segments.
pub const CR0_SEG_SZ_1M: u32 = 0x0010_0000;

/// External-subclass mask: emergency signal (bit 17).
pub const CR0_XM_EMERSIG: u32 = 0x0000_4000;
/// External-subclass mask: external call (bit 18).
pub const CR0_XM_EXTCALL: u32 = 0x0000_2000;
/// External-subclass mask: clock comparator (bit 20).
pub const CR0_XM_CLKC: u32 = 0x0000_0800;
/// External-subclass mask: CPU timer (bit 21).
pub const CR0_XM_PTIMER: u32 = 0x0000_0400;
/// External-subclass mask: service signal (bit 22).
pub const CR0_XM_SERVSIG: u32 = 0x0000_0200;
/// External-subclass mask: interval timer (bit 24, S/370).
pub const CR0_XM_ITIMER: u32 = 0x0000_0080;
/// External-subclass mask: interrupt key (bit 25).
pub const CR0_XM_INTKEY: u32 = 0x0000_0040;

// === Segment-table designations ===

/// Space-switch-event control (bit 0 of CR1/CR13).
pub const STD_SSEVENT: u32 = 0x8000_0000;
/// Segment-table origin, ESA/390.
pub const STD_STO: u32 = 0x7FFF_F000;
/// Storage-alteration-event control (bit 20).
pub const STD_SAEVENT: u32 = 0x0000_0800;
/// Subspace-group control (bit 22).
pub const STD_GROUP: u32 = 0x0000_0200;
/// Private-space control (bit 23).
pub const STD_PRIVATE: u32 = 0x0000_0100;
/// Segment-table length, ESA/390 (units of 64 entries).
pub const STD_STL: u32 = 0x0000_007F;

/// Segment-table length, S/370 (bits 0-7, units of 16 entries).
pub const STD_370_STL: u32 = 0xFF00_0000;
/// Segment-table origin, S/370.
pub const STD_370_STO: u32 = 0x00FF_FFC0;

// === Segment-table entries ===

/// ESA/390 STE: page-table origin.
pub const SEGTAB_PTO: u32 = 0x7FFF_FFC0;
/// ESA/390 STE: segment-invalid bit.
pub const SEGTAB_INVALID: u32 = 0x0000_0020;
/// ESA/390 STE: common-segment bit.
pub const SEGTAB_COMMON: u32 = 0x0000_0010;
/// ESA/390 STE: page-table length.
pub const SEGTAB_PTL: u32 = 0x0000_000F;
/// ESA/390 STE: reserved bits.
pub const SEGTAB_RESV: u32 = 0x8000_0000;

/// S/370 STE: page-table length (bits 0-3).
pub const SEGTAB_370_PTL: u32 = 0xF000_0000;
/// S/370 STE: page-table origin.
pub const SEGTAB_370_PTO: u32 = 0x00FF_FFF8;
/// S/370 STE: common-segment bit.
pub const SEGTAB_370_CMN: u32 = 0x0000_0002;
/// S/370 STE: segment-invalid bit.
pub const SEGTAB_370_INVL: u32 = 0x0000_0001;
/// S/370 STE: segment-protection bit.
pub const SEGTAB_370_PROT: u32 = 0x0000_0004;
/// S/370 STE: reserved bits.
pub const SEGTAB_370_RSV: u32 = 0x0F00_0000;

// === Page-table entries ===

/// ESA/390 PTE: page-frame real address.
pub const PAGETAB_PFRA: u32 = 0x7FFF_F000;
/// ESA/390 PTE: page-invalid bit.
pub const PAGETAB_INVALID: u32 = 0x0000_0400;
/// ESA/390 PTE: page-protection bit.
pub const PAGETAB_PROT: u32 = 0x0000_0200;
/// ESA/390 PTE: page valid in expanded storage.
pub const PAGETAB_ESVALID: u32 = 0x0000_0100;
/// ESA/390 PTE: reserved bits.
pub const PAGETAB_RESV: u32 = 0x8000_0800;

/// S/370 PTE, 4 KiB pages: page-frame real address (halfword).
pub const PAGETAB_PFRA_4K: u16 = 0xFFF0;
/// S/370 PTE, 4 KiB pages: invalid bit.
pub const PAGETAB_INV_4K: u16 = 0x0008;
/// S/370 PTE, 2 KiB pages: page-frame real address.
pub const PAGETAB_PFRA_2K: u16 = 0xFFF8;
/// S/370 PTE, 2 KiB pages: invalid bit.
pub const PAGETAB_INV_2K: u16 = 0x0004;
/// S/370 PTE, 2 KiB pages: reserved bits.
pub const PAGETAB_RSV_2K: u16 = 0x0002;

// === ASN translation ===

/// ASN first index (bits 0-9 of the ASN).
pub const ASN_AFX: u16 = 0xFFC0;
/// ASN second index (bits 10-15 of the ASN).
pub const ASN_ASX: u16 = 0x003F;

/// CR14: ASN-first-table origin.
pub const CR14_AFTO: u32 = 0x000F_FFFF;
/// CR14: ASN-translation control (bit 12).
pub const CR14_ASN_TRAN: u32 = 0x0008_0000;

/// AFTE: invalid bit.
pub const AFTE_INVALID: u32 = 0x8000_0000;
/// AFTE: AST origin, 16-byte ASTEs (ASF=0).
pub const AFTE_ASTO_0: u32 = 0x7FFF_FFF0;
/// AFTE: reserved bits, ASF=0.
pub const AFTE_RESV_0: u32 = 0x0000_000F;
/// AFTE: AST origin, 64-byte ASTEs (ASF=1).
pub const AFTE_ASTO_1: u32 = 0x7FFF_FFC0;
/// AFTE: reserved bits, ASF=1.
pub const AFTE_RESV_1: u32 = 0x0000_003F;

/// ASTE word 0: invalid bit.
pub const ASTE0_INVALID: u32 = 0x8000_0000;
/// ASTE word 0: authority-table origin.
pub const ASTE0_ATO: u32 = 0x7FFF_FFFC;
/// ASTE word 0: base-space bit.
pub const ASTE0_BASE: u32 = 0x0000_0002;
/// ASTE word 0: reserved bits.
pub const ASTE0_RESV: u32 = 0x0000_0001;
/// ASTE word 1: authorization index.
pub const ASTE1_AX: u32 = 0xFFFF_0000;
/// ASTE word 1: authority-table length (units of 16 AX values).
pub const ASTE1_ATL: u32 = 0x0000_FFF0;
/// ASTE word 1: reserved bits.
pub const ASTE1_RESV: u32 = 0x0000_000F;

/// Authority-table entry: primary-authority bit.
pub const ATE_PRIMARY: u8 = 0x80;
/// Authority-table entry: secondary-authority bit.
pub const ATE_SECONDARY: u8 = 0x40;

// === Access-list translation ===

/// ALET: reserved bits 0-6.
pub const ALET_RESV: u32 = 0xFE00_0000;
/// ALET: primary-list bit.
pub const ALET_PRI_LIST: u32 = 0x0100_0000;
/// ALET: access-list-entry sequence number.
pub const ALET_ALESN: u32 = 0x00FF_0000;
/// ALET: access-list-entry number.
pub const ALET_ALEN: u32 = 0x0000_FFFF;
/// ALET value designating the primary space.
pub const ALET_PRIMARY: u32 = 0;
/// ALET value designating the secondary space.
pub const ALET_SECONDARY: u32 = 1;

/// ALD: access-list origin.
pub const ALD_ALO: u32 = 0x7FFF_FF80;
/// ALD: access-list length (units of 8 entries).
pub const ALD_ALL: u32 = 0x0000_007F;
/// Shift aligning an ALEN with the ALL for the bounds check.
pub const ALD_ALL_SHIFT: u32 = 3;

/// ALE word 0: invalid bit.
pub const ALE0_INVALID: u32 = 0x8000_0000;
/// ALE word 0: fetch-only bit.
pub const ALE0_FETCHONLY: u32 = 0x0200_0000;
/// ALE word 0: private bit.
pub const ALE0_PRIVATE: u32 = 0x0100_0000;
/// ALE word 0: sequence number.
pub const ALE0_ALESN: u32 = 0x00FF_0000;
/// ALE word 0: access-list-entry authorization index.
pub const ALE0_ALEAX: u32 = 0x0000_FFFF;
/// ALE word 2: ASTE address.
pub const ALE2_ASTE: u32 = 0x7FFF_FFC0;

// === Other control registers ===

/// CR2: DUCT origin.
pub const CR2_DUCTO: u32 = 0x7FFF_FFC0;
/// CR5: linkage-table designation, subsystem-linkage control (ASF=0).
pub const CR5_SSLINK: u32 = 0x8000_0000;
/// CR5: linkage-table origin (ASF=0).
pub const CR5_LTO: u32 = 0x7FFF_FF80;
/// CR5: linkage-table length (ASF=0).
pub const CR5_LTL: u32 = 0x0000_007F;
/// CR5: primary-ASTE origin (ASF=1).
pub const CR5_PASTEO: u32 = 0x7FFF_FFC0;
/// CR8: extended authorization index.
pub const CR8_EAX: u32 = 0xFFFF_0000;

/// CR12: branch-trace control (bit 0).
pub const CR12_BRTRACE: u32 = 0x8000_0000;
/// CR12: trace-entry address.
pub const CR12_TRACEEA: u32 = 0x7FFF_FFFC;
/// CR12: ASN-trace control (bit 30).
pub const CR12_ASNTRACE: u32 = 0x0000_0002;
/// CR12: explicit-trace control (bit 31).
pub const CR12_EXTRACE: u32 = 0x0000_0001;

// === DUCT ===

/// DUCT word 0: base-space ASTE origin.
pub const DUCT0_BASTEO: u32 = 0x7FFF_FFC0;
/// DUCT word 1: subspace-active bit.
pub const DUCT1_SA: u32 = 0x8000_0000;
/// DUCT word 1: subspace ASTE origin.
pub const DUCT1_SSASTEO: u32 = 0x7FFF_FFC0;
/// DUCT word 3: subspace ASTE sequence number.
pub const DUCT3_SSASTESN: u32 = 0xFFFF_FFFF;
/// DUCT word 8 (BSA save area): return-address amode bit.
pub const DUCT8_AMODE: u32 = 0x8000_0000;
/// DUCT word 8: saved return instruction address.
pub const DUCT8_IA: u32 = 0x7FFF_FFFF;
/// DUCT word 9: saved PSW-key mask.
pub const DUCT9_PKM: u32 = 0xFFFF_0000;
/// DUCT word 9: saved PSW key.
pub const DUCT9_KEY: u32 = 0x0000_00F0;
/// DUCT word 9: reduced-authority state.
pub const DUCT9_RA: u32 = 0x0000_0008;
/// DUCT word 9: saved problem-state bit.
pub const DUCT9_PROB: u32 = 0x0000_0001;

// === Linkage tables and entry tables ===

/// PC-number: linkage index.
pub const PC_LX: u32 = 0x000F_FF00;
/// PC-number: entry index.
pub const PC_EX: u32 = 0x0000_00FF;
/// LTE: invalid bit.
pub const LTE_INVALID: u32 = 0x8000_0000;
/// LTE: entry-table origin.
pub const LTE_ETO: u32 = 0x7FFF_FFC0;
/// LTE: entry-table length (units of 4 entries).
pub const LTE_ETL: u32 = 0x0000_003F;
/// ETE word 0: authorization key mask.
pub const ETE0_AKM: u32 = 0xFFFF_0000;
/// ETE word 0: entry address-space number.
pub const ETE0_ASN: u32 = 0x0000_FFFF;
/// ETE word 1: entry addressing mode.
pub const ETE1_AMODE: u32 = 0x8000_0000;
/// ETE word 1: entry instruction address.
pub const ETE1_EIA: u32 = 0x7FFF_FFFE;
/// ETE word 1: entry problem-state bit.
pub const ETE1_PROB: u32 = 0x0000_0001;
/// ETE word 3: entry key mask.
pub const ETE3_EKM: u32 = 0xFFFF_0000;
/// ETE word 4: stacking-PC bit.
pub const ETE4_T: u32 = 0x8000_0000;
/// ETE word 4: PSW-key control.
pub const ETE4_K: u32 = 0x1000_0000;
/// ETE word 4: PSW-key-mask control.
pub const ETE4_M: u32 = 0x0800_0000;
/// ETE word 4: EAX control.
pub const ETE4_E: u32 = 0x0400_0000;
/// ETE word 4: address-space-control bit.
pub const ETE4_C: u32 = 0x0200_0000;
/// ETE word 4: secondary-ASN control.
pub const ETE4_S: u32 = 0x0100_0000;
/// ETE word 4: entry key.
pub const ETE4_EK: u32 = 0x00F0_0000;
/// ETE word 4: entry extended authorization index.
pub const ETE4_EEAX: u32 = 0x0000_FFFF;
/// TEA space-switch-event bit (old primary SSEVENT on a switch).
pub const TEA_SSEVENT: u64 = 0x8000_0000;

// === Translation-exception address ===

/// TEA: effective-address bits for translation exceptions.
pub const TEA_EFFADDR: u64 = !0xFFF;
/// TEA: effective-address bits for protection exceptions.
pub const TEA_PROTADDR: u64 = !0x7;
/// TEA: secondary-address indication.
pub const TEA_SECADDR: u64 = 0x8000_0000;
/// TEA: access-list-controlled protection on a store.
pub const TEA_PROT_AP: u64 = 0x0000_0004;
/// TEA: translation through the primary segment table.
pub const TEA_ST_PRIMARY: u64 = 0x0000_0000;
/// TEA: translation through an AR-specified segment table.
pub const TEA_ST_ARMODE: u64 = 0x0000_0001;
/// TEA: translation through the secondary segment table.
pub const TEA_ST_SECNDRY: u64 = 0x0000_0002;
/// TEA: translation through the home segment table.
pub const TEA_ST_HOME: u64 = 0x0000_0003;

// === PSA (ESA/390 layout) ===

/// Restart new PSW.
pub const PSA_RESTART_NEW: u64 = 0x00;
/// Restart old PSW.
pub const PSA_RESTART_OLD: u64 = 0x08;
/// External old PSW.
pub const PSA_EXTERNAL_OLD: u64 = 0x18;
/// SVC old PSW.
pub const PSA_SVC_OLD: u64 = 0x20;
/// Program old PSW.
pub const PSA_PROGRAM_OLD: u64 = 0x28;
/// External new PSW.
pub const PSA_EXTERNAL_NEW: u64 = 0x58;
/// SVC new PSW.
pub const PSA_SVC_NEW: u64 = 0x60;
/// Program new PSW.
pub const PSA_PROGRAM_NEW: u64 = 0x68;
/// Interval timer (fullword, S/370).
pub const PSA_INTTIMER: u64 = 0x50;
/// External-interruption parameter.
pub const PSA_EXTPARM: u64 = 0x80;
/// External-interruption CPU address.
pub const PSA_EXTCPAD: u64 = 0x84;
/// External-interruption code (halfword).
pub const PSA_EXTCODE: u64 = 0x86;
/// Program-interruption ILC byte.
pub const PSA_PGMILC: u64 = 0x8D;
/// Program-interruption code (halfword).
pub const PSA_PGMCODE: u64 = 0x8E;
/// Translation-exception address (fullword).
pub const PSA_TEA: u64 = 0x90;
/// Exception access identification.
pub const PSA_EXCARID: u64 = 0xA0;
/// PER access identification.
pub const PSA_PERAID: u64 = 0xA1;
/// Facilities-list bytes stored by STFL.
pub const PSA_STFL: u64 = 0xC8;

/// External-interruption code: interval timer.
pub const EXT_INTERVAL_TIMER: u16 = 0x0080;
/// External-interruption code: interrupt key.
pub const EXT_INTERRUPT_KEY: u16 = 0x0040;
/// External-interruption code: emergency signal.
pub const EXT_EMERGENCY_SIGNAL: u16 = 0x1201;
/// External-interruption code: external call.
pub const EXT_EXTERNAL_CALL: u16 = 0x1202;
/// External-interruption code: clock comparator.
pub const EXT_CLOCK_COMPARATOR: u16 = 0x1004;
/// External-interruption code: CPU timer.
pub const EXT_CPU_TIMER: u16 = 0x1005;
/// External-interruption code: service signal.
pub const EXT_SERVICE_SIGNAL: u16 = 0x2401;

/// STFL bit 0: N3 instructions installed on ESA/390.
pub const STFL_N3: u8 = 0x80;
/// STFL bit 1: ESAME installed.
pub const STFL_ESAME_INSTALLED: u8 = 0x40;
/// STFL bit 2: ESAME active.
pub const STFL_ESAME_ACTIVE: u8 = 0x20;
