//! The address-space boundary: read-only views over the captured snapshot.
//!
//! [`PhysicalSpace`] hands out raw bytes at physical addresses and knows how
//! far the snapshot extends. [`KernelSpace`] layers virtual-to-physical
//! translation on top and, when the architecture supports it, exposes a
//! prototype-PTE resolution capability through [`KernelSpace::proto_resolver`].
//! Callers must query the capability instead of attempting a resolution and
//! catching a failure; an address space without it simply returns `None`.
//!
//! Every read in here is best-effort: an unmapped page or an address past the
//! snapshot yields `None`, never an error.
use std::cell::RefCell;
use std::cmp::min;
use std::io::{Read, Seek, SeekFrom};

use crate::addr::{Addr, Pa, Va, PAGE_SIZE};
use crate::error::Result;
use crate::pte::Pte;

/// Read-only access to the physical memory captured in the snapshot.
pub trait PhysicalSpace {
    /// Read as many bytes as possible starting at `pa` into `buf`. Returns
    /// the amount read, or `None` when `pa` is not backed at all.
    fn read(&self, pa: Pa, buf: &mut [u8]) -> Option<usize>;

    /// One past the last physical address the snapshot covers. Anything
    /// beyond this is corrupt metadata by definition.
    fn extent(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `pa`, or nothing.
    fn read_exact(&self, pa: Pa, buf: &mut [u8]) -> Option<()> {
        (self.read(pa, buf)? == buf.len()).then_some(())
    }

    /// Read a `u64` at `pa`.
    fn read_u64(&self, pa: Pa) -> Option<u64> {
        let mut buf = [0; 8];
        self.read_exact(pa, &mut buf)?;

        Some(u64::from_le_bytes(buf))
    }
}

/// Resolution of prototype-form PTEs. Separate from [`KernelSpace`] so that
/// address spaces lacking the capability (non-PAE 32-bit, synthetic test
/// spaces) can say so explicitly.
pub trait ProtoPteResolver {
    /// Resolve a raw subsection PTE word down to a physical address. `None`
    /// means the page is not materialized anywhere in the snapshot, which is
    /// different from "unsupported" (that is the absence of the resolver).
    fn resolve(&self, pte: Pte) -> Option<Pa>;
}

/// The kernel virtual address space of the snapshotted machine.
pub trait KernelSpace {
    /// Translate a virtual address; `None` when no mapping exists.
    fn vtop(&self, va: Va) -> Option<Pa>;

    /// Read as many bytes as possible starting at `va`, best-effort across
    /// page boundaries. `None` when the very first page is unmapped.
    fn read(&self, va: Va, buf: &mut [u8]) -> Option<usize>;

    /// The prototype-PTE resolution capability, if this space has one.
    fn proto_resolver(&self) -> Option<&dyn ProtoPteResolver> {
        None
    }

    /// Read exactly `buf.len()` bytes at `va`, or nothing.
    fn read_exact(&self, va: Va, buf: &mut [u8]) -> Option<()> {
        (self.read(va, buf)? == buf.len()).then_some(())
    }

    /// Read a `u16` at `va`.
    fn read_u16(&self, va: Va) -> Option<u16> {
        let mut buf = [0; 2];
        self.read_exact(va, &mut buf)?;

        Some(u16::from_le_bytes(buf))
    }

    /// Read a `u32` at `va`.
    fn read_u32(&self, va: Va) -> Option<u32> {
        let mut buf = [0; 4];
        self.read_exact(va, &mut buf)?;

        Some(u32::from_le_bytes(buf))
    }

    /// Read a `u64` at `va`.
    fn read_u64(&self, va: Va) -> Option<u64> {
        let mut buf = [0; 8];
        self.read_exact(va, &mut buf)?;

        Some(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized word at `va` and give it back as a [`Va`], or
    /// `None` if it is unreadable or null.
    fn read_ptr(&self, va: Va) -> Option<Va> {
        let ptr = self.read_u64(va)?;

        (ptr != 0).then(|| Va::new(ptr))
    }
}

/// A flat physical memory snapshot backed by anything that can
/// [`Read`] + [`Seek`]: a raw dd-style image file, a `Cursor` over a buffer,
/// etc. Physical address N is byte offset N.
pub struct RawImage<R> {
    /// The backing reader. Interior mutability because reading physical
    /// memory is logically const.
    reader: RefCell<R>,
    len: u64,
}

impl<R> RawImage<R>
where
    R: Read + Seek,
{
    /// Create an instance from a reader. This seeks to the end once to learn
    /// the snapshot's extent.
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;

        Ok(Self {
            reader: RefCell::new(reader),
            len,
        })
    }
}

impl<R> PhysicalSpace for RawImage<R>
where
    R: Read + Seek,
{
    fn read(&self, pa: Pa, buf: &mut [u8]) -> Option<usize> {
        if pa.u64() >= self.len {
            return None;
        }

        // Never read past the end of the image.
        let left_in_image = usize::try_from(self.len - pa.u64()).unwrap_or(usize::MAX);
        let wanted = min(buf.len(), left_in_image);
        let mut reader = self.reader.borrow_mut();
        reader.seek(SeekFrom::Start(pa.u64())).ok()?;

        // Drain the reader until we got everything we wanted or it runs dry.
        let mut total_read = 0;
        while total_read < wanted {
            match reader.read(&mut buf[total_read..wanted]) {
                Ok(0) => break,
                Ok(n) => total_read += n,
                Err(_) => return None,
            }
        }

        Some(total_read)
    }

    fn extent(&self) -> u64 {
        self.len
    }
}

fn pte_idx(va: Va) -> u64 {
    (va.u64() >> 12) & 0x1ff
}

fn pde_idx(va: Va) -> u64 {
    (va.u64() >> 21) & 0x1ff
}

fn pdpe_idx(va: Va) -> u64 {
    (va.u64() >> 30) & 0x1ff
}

fn pml4e_idx(va: Va) -> u64 {
    (va.u64() >> 39) & 0x1ff
}

/// The x64 4-level kernel address space, rooted at a directory table base
/// found in the snapshot. This is the one space that supports prototype-PTE
/// resolution.
pub struct X64Space<'p> {
    phys: &'p dyn PhysicalSpace,
    dtb: Pa,
}

impl<'p> X64Space<'p> {
    pub fn new(phys: &'p dyn PhysicalSpace, dtb: Pa) -> Self {
        Self { phys, dtb }
    }

    fn pte_at(&self, pa: Pa) -> Option<Pte> {
        self.phys.read_u64(pa).map(Pte::from)
    }
}

impl KernelSpace for X64Space<'_> {
    /// Walk the 4-level page tables. Large (2MB) and huge (1GB) leaves are
    /// honored, and a transition PTE at the last level still translates: the
    /// page content is resident even though the valid bit is off.
    fn vtop(&self, va: Va) -> Option<Pa> {
        // Aligning in case PCID bits are set (bits 11:0).
        let pml4_base = self.dtb.page_align();
        let pml4e = self.pte_at(Pa::new(pml4_base.u64() + pml4e_idx(va) * 8))?;
        if !pml4e.valid() {
            return None;
        }

        let pdpt_base = pml4e.page_base();
        let pdpte = self.pte_at(Pa::new(pdpt_base.u64() + pdpe_idx(va) * 8))?;
        if !pdpte.valid() {
            return None;
        }

        // huge pages:
        // 7 (PS) - Page size; must be 1 (otherwise, this entry references a
        // page directory; see Table 4-1).
        let pd_base = pdpte.page_base();
        if pdpte.large_page() {
            return Some(Pa::new(pd_base.u64() + (va.u64() & 0x3fff_ffff)));
        }

        let pde = self.pte_at(Pa::new(pd_base.u64() + pde_idx(va) * 8))?;
        if !pde.valid() {
            return None;
        }

        // large pages:
        // 7 (PS) - Page size; must be 1 (otherwise, this entry references a
        // page table; see Table 4-18).
        let pt_base = pde.page_base();
        if pde.large_page() {
            return Some(Pa::new(pt_base.u64() + (va.u64() & 0x1f_ffff)));
        }

        let pte = self.pte_at(Pa::new(pt_base.u64() + pte_idx(va) * 8))?;
        if !pte.valid() && !pte.transition() {
            return None;
        }

        Some(Pa::new(pte.page_base().u64() + va.offset()))
    }

    fn read(&self, va: Va, buf: &mut [u8]) -> Option<usize> {
        // Amount of bytes left to read.
        let mut amount_left = buf.len();
        // Total amount of bytes that we have successfully read.
        let mut total_read = 0;
        // The current va we are reading from.
        let mut addr = va;
        while amount_left > 0 {
            // Reads can straddle page boundaries, so figure out the maximum
            // amount we can grab off this page..
            let left_in_page = usize::try_from(PAGE_SIZE - addr.offset()).unwrap();
            let amount_wanted = min(amount_left, left_in_page);
            let slice = &mut buf[total_read..total_read + amount_wanted];
            // ..translate..
            let Some(pa) = self.vtop(addr) else {
                // The very first page being unmapped means there was nothing
                // to read at all.
                return (total_read > 0).then_some(total_read);
            };

            // ..and read the physical memory!
            let amount_read = self.phys.read(pa, slice)?;
            total_read += amount_read;
            amount_left -= amount_read;
            if amount_read != amount_wanted {
                return Some(total_read);
            }

            addr = addr.next_aligned_page();
        }

        Some(total_read)
    }

    fn proto_resolver(&self) -> Option<&dyn ProtoPteResolver> {
        Some(self)
    }
}

impl ProtoPteResolver for X64Space<'_> {
    /// From a static snapshot only two PTE forms still point at bytes: a
    /// hardware-valid entry and a transition entry. Everything else
    /// (pagefile, demand-zero, true prototype indirections) has no resident
    /// content to recover.
    fn resolve(&self, pte: Pte) -> Option<Pa> {
        if pte.valid() || pte.transition() {
            Some(pte.page_base())
        } else {
            None
        }
    }
}
