//! Thin decoding layer for the kernel objects the cache manager hangs
//! together: `_VACB` slots, `_FILE_OBJECT`s, `_CONTROL_AREA`s and their
//! `_SUBSECTION` chains. Everything is offset-driven through the
//! [`Profile`]'s layouts and read through a [`KernelSpace`], and everything
//! returns an `Option`: an unreadable or null structure is "absent", not an
//! error.
use crate::addr::{Addr, Va};
use crate::profile::Profile;
use crate::space::KernelSpace;

/// `_EX_FAST_REF` packs a reference count into the low pointer bits.
const EX_FAST_REF_MASK: u64 = 0xf;

/// Name-info / creator-info presence bits in `_OBJECT_HEADER.InfoMask`.
const INFO_MASK_CREATOR: u8 = 0x1;
const INFO_MASK_NAME: u8 = 0x2;

/// One decoded `_VACB` slot.
#[derive(Debug, Clone, Copy)]
pub struct RawVacb {
    /// Address of the slot itself.
    pub va: Va,
    /// Virtual address of the 256 KB window of cached data.
    pub base: Va,
    /// Owning `_SHARED_CACHE_MAP`, the correlation key to the file stream.
    /// Null when the slot is free.
    pub shared_cache_map: Va,
    /// Byte offset within the file that `base` maps.
    pub file_offset: u64,
    /// Back-reference to the owning `_VACB_ARRAY_HEADER`.
    pub array_head: Va,
}

/// One decoded `_SUBSECTION`.
#[derive(Debug, Clone, Copy)]
pub struct Subsection {
    pub va: Va,
    /// Base of the prototype-PTE array.
    pub pte_base: Va,
    /// Next subsection in the chain, null at the tail.
    pub next: Va,
    /// Number of entries in the PTE array. May cover fewer sectors than
    /// `number_of_full_sectors` declares.
    pub ptes_in_subsection: u32,
    /// First file sector this subsection maps.
    pub starting_sector: u32,
    /// Declared number of mapped sectors.
    pub number_of_full_sectors: u32,
}

/// One decoded `_FILE_OBJECT` with its section pointers chased.
#[derive(Debug, Clone)]
pub struct FileObject {
    pub va: Va,
    /// The bare `FileName`, e.g. `\Windows\System32\ntdll.dll`.
    pub name: String,
    /// The owning device's name when the object header chain is readable,
    /// e.g. `HarddiskVolume2`.
    pub device: Option<String>,
    pub data_section: Option<Va>,
    pub image_section: Option<Va>,
    pub shared_cache_map: Option<Va>,
}

impl FileObject {
    /// The device-qualified name the dumper keys its output on.
    #[must_use]
    pub fn name_with_device(&self) -> String {
        match &self.device {
            Some(device) => format!(r"\Device\{device}{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Decodes kernel objects at arbitrary addresses, given a profile and the
/// kernel address space of the snapshot.
pub struct ObjectReader<'a> {
    profile: &'a Profile,
    kernel: &'a dyn KernelSpace,
}

impl<'a> ObjectReader<'a> {
    pub fn new(profile: &'a Profile, kernel: &'a dyn KernelSpace) -> Self {
        Self { profile, kernel }
    }

    pub fn profile(&self) -> &Profile {
        self.profile
    }

    pub fn kernel(&self) -> &dyn KernelSpace {
        self.kernel
    }

    /// Address of `field_offset` bytes into the structure at `base`;
    /// overflowing arithmetic means corrupt metadata, reported as absent.
    fn field(base: Va, field_offset: u64) -> Option<Va> {
        base.u64().checked_add(field_offset).map(Va::new)
    }

    fn read_u8(&self, va: Va) -> Option<u8> {
        let mut buf = [0; 1];
        self.kernel.read_exact(va, &mut buf)?;

        Some(buf[0])
    }

    /// Read a `UNICODE_STRING` structure at `va` and decode its buffer.
    pub fn unicode_string(&self, va: Va) -> Option<String> {
        let length = self.kernel.read_u16(va)?;
        if length == 0 {
            return Some(String::new());
        }

        // An odd length cannot hold UTF-16 code units.
        if (length % 2) != 0 {
            return None;
        }

        let buffer = self.kernel.read_ptr(Self::field(va, 8)?)?;
        let mut raw = vec![0u8; usize::from(length)];
        self.kernel.read_exact(buffer, &mut raw)?;

        let units = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();

        String::from_utf16(&units).ok()
    }

    /// Decode the `_VACB` slot at `va`.
    pub fn vacb(&self, va: Va) -> Option<RawVacb> {
        let layout = &self.profile.layouts.vacb;

        Some(RawVacb {
            va,
            base: Va::new(self.kernel.read_u64(Self::field(va, layout.base_address)?)?),
            shared_cache_map: Va::new(
                self.kernel
                    .read_u64(Self::field(va, layout.shared_cache_map)?)?,
            ),
            file_offset: self.kernel.read_u64(Self::field(va, layout.file_offset)?)?,
            array_head: Va::new(self.kernel.read_u64(Self::field(va, layout.array_head)?)?),
        })
    }

    /// The `VacbArrayIndex` of the `_VACB_ARRAY_HEADER` at `va`.
    pub fn vacb_array_index(&self, va: Va) -> Option<u32> {
        let layout = &self.profile.layouts.vacb_array;

        self.kernel.read_u32(Self::field(va, layout.array_index)?)
    }

    /// Decode the `_SUBSECTION` at `va`.
    pub fn subsection(&self, va: Va) -> Option<Subsection> {
        let layout = &self.profile.layouts.subsection;

        Some(Subsection {
            va,
            pte_base: Va::new(
                self.kernel
                    .read_u64(Self::field(va, layout.subsection_base)?)?,
            ),
            next: Va::new(
                self.kernel
                    .read_u64(Self::field(va, layout.next_subsection)?)?,
            ),
            ptes_in_subsection: self
                .kernel
                .read_u32(Self::field(va, layout.ptes_in_subsection)?)?,
            starting_sector: self
                .kernel
                .read_u32(Self::field(va, layout.starting_sector)?)?,
            number_of_full_sectors: self
                .kernel
                .read_u32(Self::field(va, layout.number_of_full_sectors)?)?,
        })
    }

    /// Where the first `_SUBSECTION` of a control area lives: right behind
    /// the `_CONTROL_AREA` itself.
    pub fn first_subsection(&self, control_area: Va) -> Option<Va> {
        Self::field(control_area, self.profile.layouts.control_area.size)
    }

    /// The `_CONTROL_AREA.FilePointer`, unmasked from its `_EX_FAST_REF`
    /// packaging. The address owning the subsection at `subsection_va` is
    /// read off the subsection itself.
    pub fn subsection_file_object(&self, subsection_va: Va) -> Option<Va> {
        let layout = &self.profile.layouts.subsection;
        let control_area = self
            .kernel
            .read_ptr(Self::field(subsection_va, layout.control_area)?)?;

        self.control_area_file_object(control_area)
    }

    /// The file object owning a control area, or `None` when unset.
    pub fn control_area_file_object(&self, control_area: Va) -> Option<Va> {
        let layout = &self.profile.layouts.control_area;
        let raw = self
            .kernel
            .read_u64(Self::field(control_area, layout.file_pointer)?)?;
        let unmasked = raw & !EX_FAST_REF_MASK;

        (unmasked != 0).then(|| Va::new(unmasked))
    }

    /// The file object a `_SHARED_CACHE_MAP` belongs to.
    pub fn shared_cache_map_file_object(&self, shared_cache_map: Va) -> Option<Va> {
        let layout = &self.profile.layouts.shared_cache_map;

        self.kernel
            .read_ptr(Self::field(shared_cache_map, layout.file_object)?)
    }

    /// Decode the `_FILE_OBJECT` at `va`: its name, its device's name and
    /// its three section-object pointers.
    pub fn file_object(&self, va: Va) -> Option<FileObject> {
        let layout = &self.profile.layouts.file_object;
        let name = self.unicode_string(Self::field(va, layout.file_name)?)?;

        let device = self
            .kernel
            .read_ptr(Self::field(va, layout.device_object)?)
            .and_then(|device| self.object_name(device));

        let mut data_section = None;
        let mut image_section = None;
        let mut shared_cache_map = None;
        if let Some(sop) = self
            .kernel
            .read_ptr(Self::field(va, layout.section_object_pointer)?)
        {
            let sop_layout = &self.profile.layouts.section_object_pointers;
            data_section = Self::field(sop, sop_layout.data_section_object)
                .and_then(|f| self.kernel.read_ptr(f));
            shared_cache_map = Self::field(sop, sop_layout.shared_cache_map)
                .and_then(|f| self.kernel.read_ptr(f));
            image_section = Self::field(sop, sop_layout.image_section_object)
                .and_then(|f| self.kernel.read_ptr(f));
        }

        Some(FileObject {
            va,
            name,
            device,
            data_section,
            image_section,
            shared_cache_map,
        })
    }

    /// Recover an object's name from the `_OBJECT_HEADER_NAME_INFO` that
    /// optionally precedes its `_OBJECT_HEADER`. The name info sits
    /// `InfoMask`-dependent bytes before the header.
    fn object_name(&self, body: Va) -> Option<String> {
        let layout = &self.profile.layouts.object_header;
        let header = Va::new(body.u64().checked_sub(layout.body_offset)?);
        let mask = self.read_u8(Self::field(header, layout.info_mask)?)?;
        if (mask & INFO_MASK_NAME) == 0 {
            return None;
        }

        let mut back = layout.name_info_size;
        if (mask & INFO_MASK_CREATOR) != 0 {
            back = back.checked_add(layout.creator_info_size)?;
        }

        let name_info = Va::new(header.u64().checked_sub(back)?);
        let name = self.unicode_string(Self::field(name_info, layout.name_info_name)?)?;

        (!name.is_empty()).then_some(name)
    }
}
