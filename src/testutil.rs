//! Test-only plumbing: a little builder that lays kernel structures out in a
//! flat buffer, plus an identity-mapped address space over it.
use std::collections::HashSet;

use crate::addr::{Addr, Pa, Va, PAGE_SIZE};
use crate::profile::Profile;
use crate::pte::Pte;
use crate::space::{KernelSpace, PhysicalSpace, ProtoPteResolver};

/// Where tests park their fake kernel globals.
pub const GLOBALS_BASE: u64 = 0x8_000;

/// Lays out structures at chosen offsets in a flat buffer. All layouts are
/// the crate defaults.
pub struct SnapshotBuilder {
    mem: Vec<u8>,
    unmapped: HashSet<u64>,
    proto: bool,
    extent: Option<u64>,
}

impl SnapshotBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            unmapped: HashSet::new(),
            proto: true,
            extent: None,
        }
    }

    pub fn without_proto_resolver(mut self) -> Self {
        self.proto = false;
        self
    }

    /// Pretend the physical space ends early.
    pub fn with_extent(mut self, extent: u64) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Mark the page containing `va` as having no virtual mapping.
    pub fn unmap_page(&mut self, va: u64) {
        self.unmapped.insert(va & !(PAGE_SIZE - 1));
    }

    pub fn write(&mut self, at: u64, bytes: &[u8]) {
        let at = usize::try_from(at).unwrap();
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u16(&mut self, at: u64, value: u16) {
        self.write(at, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, at: u64, value: u32) {
        self.write(at, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, at: u64, value: u64) {
        self.write(at, &value.to_le_bytes());
    }

    /// Lay out a `_VACB` slot.
    pub fn vacb_slot(&mut self, at: u64, base: u64, scm: u64, file_offset: u64, array_head: Va) {
        self.write_u64(at, base);
        self.write_u64(at + 0x8, scm);
        self.write_u64(at + 0x10, file_offset);
        self.write_u64(at + 0x28, array_head.u64());
    }

    /// Lay out a `UNICODE_STRING` at `at` whose buffer lives at `buffer_at`.
    pub fn unicode_string(&mut self, at: u64, buffer_at: u64, text: &str) {
        let units = text.encode_utf16().collect::<Vec<_>>();
        let byte_len = u16::try_from(units.len() * 2).unwrap();
        self.write_u16(at, byte_len);
        self.write_u16(at + 2, byte_len);
        self.write_u64(at + 8, buffer_at);
        for (i, unit) in units.iter().enumerate() {
            self.write_u16(buffer_at + (i as u64) * 2, *unit);
        }
    }

    /// Lay out a minimal `_FILE_OBJECT` (no device, no section pointers)
    /// whose name buffer goes to `scratch`.
    pub fn file_object(&mut self, at: u64, scratch: u64, name: &str) {
        self.unicode_string(at + 0x58, scratch, name);
    }

    /// Attach a `_SECTION_OBJECT_POINTERS` at `sop_at` to the file object at
    /// `fo_at`.
    pub fn section_pointers(&mut self, fo_at: u64, sop_at: u64, data: u64, scm: u64, image: u64) {
        self.write_u64(fo_at + 0x28, sop_at);
        self.write_u64(sop_at, data);
        self.write_u64(sop_at + 0x8, scm);
        self.write_u64(sop_at + 0x10, image);
    }

    /// Lay out a `_SHARED_CACHE_MAP` pointing back at a file object.
    pub fn shared_cache_map(&mut self, at: u64, file_object: u64) {
        self.write_u64(at + 0x18, file_object);
    }

    /// Lay out a `_SUBSECTION`.
    pub fn subsection(
        &mut self,
        at: u64,
        control_area: u64,
        pte_base: u64,
        next: u64,
        ptes: u32,
        starting_sector: u32,
        full_sectors: u32,
    ) {
        self.write_u64(at, control_area);
        self.write_u64(at + 0x8, pte_base);
        self.write_u64(at + 0x10, next);
        self.write_u32(at + 0x18, ptes);
        self.write_u32(at + 0x24, starting_sector);
        self.write_u32(at + 0x28, full_sectors);
    }

    /// Lay out a `_CONTROL_AREA` at `at` owned by `file_object`; the first
    /// subsection is expected at `at + 0x80`.
    pub fn control_area(&mut self, at: u64, file_object: u64) {
        self.write_u64(at + 0x40, file_object);
    }

    pub fn finish_with_globals(
        self,
        globals: impl IntoIterator<Item = (&'static str, u64)>,
    ) -> (Profile, TestSpace) {
        let profile = Profile::with_globals(
            globals
                .into_iter()
                .map(|(name, value)| (name.to_string(), value)),
        );

        (profile, self.into_space())
    }

    /// Same, but shrink the per-table slot count so table walks stay small.
    pub fn finish_with_globals_and_slots(
        self,
        globals: impl IntoIterator<Item = (&'static str, u64)>,
        slots_per_table: u32,
    ) -> (Profile, TestSpace) {
        let (mut profile, space) = self.finish_with_globals(globals);
        profile.layouts.vacb_array.slots_per_table = slots_per_table;

        (profile, space)
    }

    pub fn into_space(self) -> TestSpace {
        let extent = self.extent.unwrap_or(self.mem.len() as u64);

        TestSpace {
            mem: self.mem,
            unmapped: self.unmapped,
            proto: self.proto,
            extent,
        }
    }
}

/// An identity-mapped space over the builder's buffer: virtual address N is
/// physical address N is buffer offset N, except for pages explicitly marked
/// unmapped.
pub struct TestSpace {
    mem: Vec<u8>,
    unmapped: HashSet<u64>,
    proto: bool,
    extent: u64,
}

impl PhysicalSpace for TestSpace {
    fn read(&self, pa: Pa, buf: &mut [u8]) -> Option<usize> {
        let start = usize::try_from(pa.u64()).ok()?;
        if start >= self.mem.len() {
            return None;
        }

        let amount = buf.len().min(self.mem.len() - start);
        buf[..amount].copy_from_slice(&self.mem[start..start + amount]);

        Some(amount)
    }

    fn extent(&self) -> u64 {
        self.extent
    }
}

impl KernelSpace for TestSpace {
    fn vtop(&self, va: Va) -> Option<Pa> {
        if self.unmapped.contains(&va.page_align().u64()) {
            return None;
        }

        (va.u64() < self.mem.len() as u64).then(|| Pa::new(va.u64()))
    }

    fn read(&self, va: Va, buf: &mut [u8]) -> Option<usize> {
        let mut total_read = 0;
        let mut addr = va;
        while total_read < buf.len() {
            let left_in_page = usize::try_from(PAGE_SIZE - addr.offset()).unwrap();
            let amount_wanted = left_in_page.min(buf.len() - total_read);
            let Some(pa) = self.vtop(addr) else {
                return (total_read > 0).then_some(total_read);
            };

            let slice = &mut buf[total_read..total_read + amount_wanted];
            let amount_read = PhysicalSpace::read(self, pa, slice)?;
            total_read += amount_read;
            if amount_read != amount_wanted {
                break;
            }

            addr = addr.next_aligned_page();
        }

        Some(total_read)
    }

    fn proto_resolver(&self) -> Option<&dyn ProtoPteResolver> {
        self.proto.then_some(self as &dyn ProtoPteResolver)
    }
}

impl ProtoPteResolver for TestSpace {
    fn resolve(&self, pte: Pte) -> Option<Pa> {
        (pte.valid() || pte.transition()).then(|| pte.page_base())
    }
}
