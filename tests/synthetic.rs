//! End-to-end checks over a hand-built snapshot: a Win7-style VACB table
//! holding one `$Mft` window and one data-file window, a file object with a
//! data-section backing store, and a handful of MFT records.
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use cachedump::{
    list_vacbs, scan_mft, Addr, FileDumper, KernelSpace, NullProgress, ObjectReader, Pa,
    PhysicalSpace, Profile, ProtoPteResolver, Pte, SourceKind, Va, CC_VACB_ARRAYS,
    CC_VACB_ARRAYS_ALLOCATED, PAGE_SIZE,
};

const GLOBALS: u64 = 0x1_000;
const ARRAYS: u64 = 0x1_100;
const TABLE: u64 = 0x2_000;
const SCM_MFT: u64 = 0x3_000;
const FO_MFT: u64 = 0x3_100;
const SCM_FOO: u64 = 0x3_400;
const FO_FOO: u64 = 0x3_500;
const SOP_FOO: u64 = 0x3_700;
const CA_FOO: u64 = 0x4_000;
const PTES_FOO: u64 = 0x4_200;
const BACKING_PAGE: u64 = 0x10_000;
const FOO_WIN: u64 = 0x20_000;
const MFT_WIN: u64 = 0x60_000;
const IMAGE_LEN: usize = 0xa_0000;

/// An identity-mapped snapshot: virtual address N is physical address N is
/// buffer offset N, minus an explicit set of unmapped pages.
struct SyntheticSpace {
    mem: Vec<u8>,
    unmapped: HashSet<u64>,
}

impl PhysicalSpace for SyntheticSpace {
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
        self.mem.len() as u64
    }
}

impl KernelSpace for SyntheticSpace {
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
            let wanted = left_in_page.min(buf.len() - total_read);
            let Some(pa) = self.vtop(addr) else {
                return (total_read > 0).then_some(total_read);
            };

            let got = PhysicalSpace::read(self, pa, &mut buf[total_read..total_read + wanted])?;
            total_read += got;
            if got != wanted {
                break;
            }

            addr = addr.next_aligned_page();
        }

        Some(total_read)
    }

    fn proto_resolver(&self) -> Option<&dyn ProtoPteResolver> {
        Some(self)
    }
}

impl ProtoPteResolver for SyntheticSpace {
    fn resolve(&self, pte: Pte) -> Option<Pa> {
        (pte.valid() || pte.transition()).then(|| pte.page_base())
    }
}

struct Builder(Vec<u8>);

impl Builder {
    fn w(&mut self, at: u64, bytes: &[u8]) {
        let at = usize::try_from(at).unwrap();
        self.0[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, at: u64, v: u16) {
        self.w(at, &v.to_le_bytes());
    }

    fn u32(&mut self, at: u64, v: u32) {
        self.w(at, &v.to_le_bytes());
    }

    fn u64(&mut self, at: u64, v: u64) {
        self.w(at, &v.to_le_bytes());
    }

    fn unicode(&mut self, at: u64, buffer: u64, text: &str) {
        let units = text.encode_utf16().collect::<Vec<_>>();
        self.u16(at, (units.len() * 2) as u16);
        self.u16(at + 2, (units.len() * 2) as u16);
        self.u64(at + 8, buffer);
        for (i, unit) in units.iter().enumerate() {
            self.u16(buffer + (i as u64) * 2, *unit);
        }
    }

    /// Default Win7 x64 `_VACB` offsets.
    fn vacb(&mut self, at: u64, base: u64, scm: u64, file_offset: u64, head: u64) {
        self.u64(at, base);
        self.u64(at + 0x8, scm);
        self.u64(at + 0x10, file_offset);
        self.u64(at + 0x28, head);
    }

    /// A live MFT record: `$STANDARD_INFORMATION` + one `$FILE_NAME`.
    fn mft_record(&mut self, at: u64, id: u32, parent: u64, name: &str) {
        const TICKS: u64 = 116_444_736_000_000_000;

        self.w(at, b"FILE");
        self.u16(at + 0x14, 0x38);
        self.u32(at + 0x2c, id);

        // $STANDARD_INFORMATION, resident, 0x30-byte value.
        let si = at + 0x38;
        self.u32(si, 0x10);
        self.u32(si + 0x4, 0x48);
        self.u32(si + 0x10, 0x30);
        self.u16(si + 0x14, 0x18);
        for field in 0..4 {
            self.u64(si + 0x18 + field * 8, TICKS);
        }

        // $FILE_NAME, resident.
        let units = name.encode_utf16().collect::<Vec<_>>();
        let value_len = 0x42 + units.len() * 2;
        let attr_len = (0x18 + value_len + 7) & !7;
        let fname = si + 0x48;
        self.u32(fname, 0x30);
        self.u32(fname + 0x4, attr_len as u32);
        self.u32(fname + 0x10, value_len as u32);
        self.u16(fname + 0x14, 0x18);
        let value = fname + 0x18;
        self.u64(value, parent);
        self.w(value + 0x40, &[units.len() as u8, 1]);
        for (i, unit) in units.iter().enumerate() {
            self.u16(value + 0x42 + (i as u64) * 2, *unit);
        }

        self.u32(fname + attr_len as u64, 0xffff_ffff);
    }
}

fn build_snapshot() -> (Profile, SyntheticSpace) {
    let mut b = Builder(vec![0u8; IMAGE_LEN]);

    // Cache-manager globals: one allocated VACB table.
    b.u64(GLOBALS, ARRAYS);
    b.u32(GLOBALS + 8, 1);
    b.u64(ARRAYS, TABLE);
    b.u32(TABLE, 0); // VacbArrayIndex

    // Three slots behind the header: $Mft, \foo.txt, and a stale leftover.
    b.vacb(TABLE + 0x10, MFT_WIN, SCM_MFT, 0, TABLE);
    b.vacb(TABLE + 0x40, FOO_WIN, SCM_FOO, 0, TABLE);
    b.vacb(TABLE + 0x70, 0x7_0000, 0xeee0, 0, 0xdead_0000);

    // The $Mft stream: cache map -> file object -> name.
    b.u64(SCM_MFT + 0x18, FO_MFT);
    b.unicode(FO_MFT + 0x58, 0x3_200, r"\$Mft");

    // \foo.txt: cache map, file object, section pointers, a data-section
    // control area with one single-page subsection.
    b.u64(SCM_FOO + 0x18, FO_FOO);
    b.unicode(FO_FOO + 0x58, 0x3_600, r"\foo.txt");
    b.u64(FO_FOO + 0x28, SOP_FOO);
    b.u64(SOP_FOO, CA_FOO);
    b.u64(SOP_FOO + 0x8, SCM_FOO);
    b.u64(CA_FOO + 0x40, FO_FOO);
    let sub = CA_FOO + 0x80;
    b.u64(sub, CA_FOO);
    b.u64(sub + 0x8, PTES_FOO);
    b.u32(sub + 0x18, 1);
    b.u32(sub + 0x24, 0);
    b.u32(sub + 0x28, 8);
    b.u64(PTES_FOO, BACKING_PAGE | 1);

    // Distinct content for the two sources of \foo.txt.
    b.w(BACKING_PAGE, b"stale on-disk copy");
    b.w(FOO_WIN, b"fresh cached copy");

    // A little directory tree in the $Mft window.
    b.mft_record(MFT_WIN, 2, 2, ".");
    b.mft_record(MFT_WIN + 0x400, 5, 2, "docs");
    b.mft_record(MFT_WIN + 0x800, 16, 5, "a.txt");
    b.mft_record(MFT_WIN + 0xc00, 17, 5, "b.txt");

    // Only the first page of the \foo.txt window is resident.
    let mut unmapped = HashSet::new();
    let mut page = FOO_WIN + PAGE_SIZE;
    while page < FOO_WIN + 0x40_000 {
        unmapped.insert(page);
        page += PAGE_SIZE;
    }

    let profile = Profile::with_globals([
        (CC_VACB_ARRAYS.to_string(), GLOBALS),
        (CC_VACB_ARRAYS_ALLOCATED.to_string(), GLOBALS + 8),
    ]);

    (profile, SyntheticSpace {
        mem: b.0,
        unmapped,
    })
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cachedump-e2e-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[test]
fn vacb_listing_names_both_streams_and_drops_the_stale_slot() {
    let (profile, space) = build_snapshot();
    let reader = ObjectReader::new(&profile, &space);

    let rows = list_vacbs(&reader, &NullProgress).collect::<Vec<_>>();
    let filenames = rows.iter().map(|r| r.filename.as_str()).collect::<Vec<_>>();

    assert_eq!(filenames, vec![r"\$Mft", r"\foo.txt"]);
    assert!(rows.iter().all(|r| r.valid));
}

#[test]
fn dumpfiles_merges_backing_store_and_cache() {
    let (profile, space) = build_snapshot();
    let reader = ObjectReader::new(&profile, &space);
    let dir = scratch_dir("merge");

    let dumper = FileDumper::new(&reader, &space, &dir);
    let rows = dumper.run(&[], &[Va::new(FO_FOO)]).unwrap();

    // One backing range (8 sectors), then exactly one resident cache page.
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].source, SourceKind::DataSection);
    assert_eq!(rows[0].len, 8 * 512);
    assert_eq!(rows[1].source, SourceKind::Vacb);
    assert_eq!(rows[1].file_offset, 0);

    // The cache copy lands last and wins over the backing store.
    let content = fs::read(dir.join("_foo.txt")).unwrap();
    assert!(content.starts_with(b"fresh cached copy"));

    // Byte-identical on a second run.
    dumper.run(&[], &[Va::new(FO_FOO)]).unwrap();
    assert_eq!(fs::read(dir.join("_foo.txt")).unwrap(), content);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn mft_tree_renders_preorder_with_depths() {
    let (profile, space) = build_snapshot();
    let reader = ObjectReader::new(&profile, &space);

    let table = scan_mft(&reader, &NullProgress);
    assert_eq!(table.len(), 4);

    let rows = table.rows();
    let ids = rows.iter().map(|r| r.id).collect::<Vec<_>>();
    let depths = rows.iter().map(|r| r.depth).collect::<Vec<_>>();
    let names = rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();

    assert_eq!(ids, vec![2, 5, 16, 17]);
    assert_eq!(depths, vec![0, 1, 2, 2]);
    assert_eq!(names, vec![".", "docs", "a.txt", "b.txt"]);
    assert!(rows.iter().all(|r| r.created.is_some()));
}

#[test]
fn snapshot_without_cache_globals_yields_empty_everything() {
    let (_, space) = build_snapshot();
    let profile = Profile::default();
    let reader = ObjectReader::new(&profile, &space);

    assert_eq!(list_vacbs(&reader, &NullProgress).count(), 0);
    assert!(scan_mft(&reader, &NullProgress).rows().is_empty());
}
