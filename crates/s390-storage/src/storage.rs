//! The main-storage slab and its storage keys.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{KEY_FRAME_SIZE, STORKEY_CHANGE, STORKEY_REF};

/// Absolute main storage plus one storage key per 2 KiB frame.
///
/// All scalar accessors are big-endian and maintain the reference bit
/// (fetches) or reference+change bits (stores) of the frame they touch.
/// Callers are expected to have range-checked the absolute address against
/// [`MainStorage::size`] first — that check belongs to the addressing-
/// exception layer above, which also knows the access length.
pub struct MainStorage {
    mem: Vec<AtomicU8>,
    keys: Vec<AtomicU8>,
    size: u64,
}

impl MainStorage {
    /// Allocate `size` bytes of zeroed storage with zeroed keys.
    ///
    /// `size` is rounded up to a 4 KiB multiple.
    #[must_use]
    pub fn new(size: u64) -> Self {
        let size = (size + 0xFFF) & !0xFFF;
        let mut mem = Vec::with_capacity(size as usize);
        mem.resize_with(size as usize, AtomicU8::default);
        let nkeys = (size / KEY_FRAME_SIZE) as usize;
        let mut keys = Vec::with_capacity(nkeys);
        keys.resize_with(nkeys, AtomicU8::default);
        Self { mem, keys, size }
    }

    /// Configured main-storage size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// True if `len` bytes starting at `addr` all lie inside storage.
    #[must_use]
    pub const fn contains(&self, addr: u64, len: u64) -> bool {
        addr < self.size && len <= self.size - addr
    }

    // === Storage keys ===

    /// Storage key for the 2 KiB frame containing `addr`.
    #[must_use]
    pub fn key(&self, addr: u64) -> u8 {
        self.keys[(addr / KEY_FRAME_SIZE) as usize].load(Ordering::Relaxed)
    }

    /// Replace the storage key for the frame containing `addr`.
    pub fn set_key(&self, addr: u64, key: u8) {
        self.keys[(addr / KEY_FRAME_SIZE) as usize].store(key, Ordering::Relaxed)
    }

    /// OR bits into the storage key for the frame containing `addr`.
    ///
    /// Reference/change maintenance goes through here; set-only relaxed OR
    /// keeps concurrent updates from different CPUs race-safe.
    pub fn or_key(&self, addr: u64, bits: u8) {
        self.keys[(addr / KEY_FRAME_SIZE) as usize].fetch_or(bits, Ordering::Relaxed);
    }

    /// AND bits into the storage key for the frame containing `addr` and
    /// return the previous key (Reset Reference Bit wants the old value).
    pub fn and_key(&self, addr: u64, mask: u8) -> u8 {
        self.keys[(addr / KEY_FRAME_SIZE) as usize].fetch_and(mask, Ordering::Relaxed)
    }

    // === Instruction-fragment invalidation hook ===

    /// Store-path hook for host-side instruction caching.
    ///
    /// Every store helper reports the absolute address and span it wrote.
    /// With no JIT present this is a no-op, but the call sites are the
    /// contract: any future translated-code cache hangs its invalidation
    /// here.
    #[inline]
    pub fn frag_invalidate(&self, addr: u64, len: usize) {
        let _ = (addr, len);
    }

    // === Fetch (big-endian, sets reference bit) ===

    /// Fetch one byte from absolute storage.
    #[must_use]
    pub fn fetch_byte_absolute(&self, addr: u64) -> u8 {
        self.or_key(addr, STORKEY_REF);
        self.mem[addr as usize].load(Ordering::Relaxed)
    }

    /// Fetch a big-endian halfword from absolute storage.
    #[must_use]
    pub fn fetch_halfword_absolute(&self, addr: u64) -> u16 {
        self.or_key(addr, STORKEY_REF);
        u16::from(self.byte(addr)) << 8 | u16::from(self.byte(addr + 1))
    }

    /// Fetch a big-endian fullword from absolute storage.
    #[must_use]
    pub fn fetch_fullword_absolute(&self, addr: u64) -> u32 {
        self.or_key(addr, STORKEY_REF);
        u32::from(self.byte(addr)) << 24
            | u32::from(self.byte(addr + 1)) << 16
            | u32::from(self.byte(addr + 2)) << 8
            | u32::from(self.byte(addr + 3))
    }

    /// Fetch a big-endian doubleword from absolute storage.
    #[must_use]
    pub fn fetch_doubleword_absolute(&self, addr: u64) -> u64 {
        self.or_key(addr, STORKEY_REF);
        u64::from(self.fetch_fullword_absolute(addr)) << 32
            | u64::from(self.fetch_fullword_absolute(addr + 4))
    }

    /// Fetch `dest.len()` bytes into `dest`. Sets the reference bit of every
    /// frame the span touches.
    pub fn fetch_bytes_absolute(&self, dest: &mut [u8], addr: u64) {
        self.mark_span(addr, dest.len(), STORKEY_REF);
        for (i, b) in dest.iter_mut().enumerate() {
            *b = self.byte(addr + i as u64);
        }
    }

    // === Store (big-endian, sets reference and change bits) ===

    /// Store one byte into absolute storage.
    pub fn store_byte_absolute(&self, value: u8, addr: u64) {
        self.or_key(addr, STORKEY_REF | STORKEY_CHANGE);
        self.mem[addr as usize].store(value, Ordering::Relaxed);
        self.frag_invalidate(addr, 1);
    }

    /// Store a big-endian halfword into absolute storage.
    pub fn store_halfword_absolute(&self, value: u16, addr: u64) {
        self.or_key(addr, STORKEY_REF | STORKEY_CHANGE);
        self.set_byte(addr, (value >> 8) as u8);
        self.set_byte(addr + 1, value as u8);
        self.frag_invalidate(addr, 2);
    }

    /// Store a big-endian fullword into absolute storage.
    pub fn store_fullword_absolute(&self, value: u32, addr: u64) {
        self.or_key(addr, STORKEY_REF | STORKEY_CHANGE);
        self.set_byte(addr, (value >> 24) as u8);
        self.set_byte(addr + 1, (value >> 16) as u8);
        self.set_byte(addr + 2, (value >> 8) as u8);
        self.set_byte(addr + 3, value as u8);
        self.frag_invalidate(addr, 4);
    }

    /// Store a big-endian doubleword into absolute storage.
    pub fn store_doubleword_absolute(&self, value: u64, addr: u64) {
        self.store_fullword_absolute((value >> 32) as u32, addr);
        self.store_fullword_absolute(value as u32, addr + 4);
    }

    /// Store `src` into absolute storage. Sets reference+change bits of
    /// every frame the span touches.
    pub fn store_bytes_absolute(&self, src: &[u8], addr: u64) {
        self.mark_span(addr, src.len(), STORKEY_REF | STORKEY_CHANGE);
        for (i, b) in src.iter().enumerate() {
            self.set_byte(addr + i as u64, *b);
        }
        self.frag_invalidate(addr, src.len());
    }

    /// Zero a span of absolute storage without touching its key bits
    /// (Test Block clears the key separately).
    pub fn clear_span(&self, addr: u64, len: usize) {
        for i in 0..len {
            self.set_byte(addr + i as u64, 0);
        }
        self.frag_invalidate(addr, len);
    }

    // === Raw access (no key side effects; tests and status stores) ===

    /// Read a byte without touching the reference bit.
    #[must_use]
    pub fn peek(&self, addr: u64) -> u8 {
        self.byte(addr)
    }

    /// Write a byte without touching key bits.
    pub fn poke(&self, addr: u64, value: u8) {
        self.set_byte(addr, value);
    }

    fn byte(&self, addr: u64) -> u8 {
        self.mem[addr as usize].load(Ordering::Relaxed)
    }

    fn set_byte(&self, addr: u64, value: u8) {
        self.mem[addr as usize].store(value, Ordering::Relaxed);
    }

    fn mark_span(&self, addr: u64, len: usize, bits: u8) {
        if len == 0 {
            return;
        }
        let mut frame = addr / KEY_FRAME_SIZE;
        let last = (addr + len as u64 - 1) / KEY_FRAME_SIZE;
        while frame <= last {
            self.keys[frame as usize].fetch_or(bits, Ordering::Relaxed);
            frame += 1;
        }
    }
}

impl std::fmt::Debug for MainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainStorage")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STORKEY_FETCH;

    #[test]
    fn fullword_is_big_endian() {
        let stor = MainStorage::new(0x1000);
        stor.store_fullword_absolute(0x1234_5678, 0x100);
        assert_eq!(stor.peek(0x100), 0x12);
        assert_eq!(stor.peek(0x103), 0x78);
        assert_eq!(stor.fetch_fullword_absolute(0x100), 0x1234_5678);
    }

    #[test]
    fn fetch_sets_reference_bit_only() {
        let stor = MainStorage::new(0x2000);
        assert_eq!(stor.key(0x800), 0);
        let _ = stor.fetch_halfword_absolute(0x800);
        assert_eq!(stor.key(0x800), STORKEY_REF);
    }

    #[test]
    fn store_sets_reference_and_change_bits() {
        let stor = MainStorage::new(0x2000);
        stor.store_byte_absolute(0xAA, 0x800);
        assert_eq!(stor.key(0x800), STORKEY_REF | STORKEY_CHANGE);
        assert_eq!(stor.peek(0x800), 0xAA);
    }

    #[test]
    fn ref_change_updates_preserve_access_bits() {
        let stor = MainStorage::new(0x1000);
        stor.set_key(0x0, 0x30 | STORKEY_FETCH);
        stor.store_byte_absolute(1, 0x10);
        assert_eq!(
            stor.key(0x0),
            0x30 | STORKEY_FETCH | STORKEY_REF | STORKEY_CHANGE
        );
    }

    #[test]
    fn span_store_marks_both_frames() {
        let stor = MainStorage::new(0x2000);
        // 4 bytes straddling the 2 KiB key boundary
        stor.store_bytes_absolute(&[1, 2, 3, 4], 0x7FE);
        assert_eq!(stor.key(0x7FE), STORKEY_REF | STORKEY_CHANGE);
        assert_eq!(stor.key(0x800), STORKEY_REF | STORKEY_CHANGE);
    }

    #[test]
    fn contains_checks_span() {
        let stor = MainStorage::new(0x1000);
        assert!(stor.contains(0xFFF, 1));
        assert!(!stor.contains(0xFFF, 2));
        assert!(!stor.contains(0x1000, 1));
    }

    #[test]
    fn size_rounds_to_page() {
        let stor = MainStorage::new(0x1001);
        assert_eq!(stor.size(), 0x2000);
    }
}
