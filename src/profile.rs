//! The profile boundary: what the symbol files of the snapshotted kernel tell
//! us. A [`Profile`] carries the virtual addresses of the handful of named
//! cache-manager globals plus the field layouts of the structures this crate
//! walks. Layouts default to Windows 7 x64; a dump-specific profile can be
//! deserialized from JSON and override any subset of them.
use std::collections::BTreeMap;

use serde::Deserialize;

use crate::addr::Va;
use crate::error::{Error, Result};

/// Legacy (XP era) pointer to the flat `_VACB` array.
pub const CC_VACBS: &str = "CcVacbs";
/// Legacy count of entries in the flat array.
pub const CC_NUMBER_VACBS: &str = "CcNumberVacbs";
/// Win7+ pointer to the array of `_VACB_ARRAY_HEADER` pointers.
pub const CC_VACB_ARRAYS: &str = "CcVacbArrays";
/// Win7+ count of allocated array headers.
pub const CC_VACB_ARRAYS_ALLOCATED: &str = "CcVacbArraysAllocated";

/// Field offsets for `_VACB`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VacbLayout {
    pub size: u64,
    pub base_address: u64,
    pub shared_cache_map: u64,
    pub file_offset: u64,
    pub array_head: u64,
}

impl Default for VacbLayout {
    fn default() -> Self {
        Self {
            size: 0x30,
            base_address: 0x0,
            shared_cache_map: 0x8,
            file_offset: 0x10,
            array_head: 0x28,
        }
    }
}

/// Field offsets for `_VACB_ARRAY_HEADER`, and how many `_VACB` slots follow
/// one header.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VacbArrayLayout {
    pub size: u64,
    pub array_index: u64,
    pub slots_per_table: u32,
}

impl Default for VacbArrayLayout {
    fn default() -> Self {
        Self {
            size: 0x10,
            array_index: 0x0,
            slots_per_table: 4_096,
        }
    }
}

/// Field offsets for `_SHARED_CACHE_MAP`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedCacheMapLayout {
    pub file_object: u64,
}

impl Default for SharedCacheMapLayout {
    fn default() -> Self {
        Self { file_object: 0x18 }
    }
}

/// Field offsets for `_FILE_OBJECT`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileObjectLayout {
    pub device_object: u64,
    pub section_object_pointer: u64,
    pub file_name: u64,
}

impl Default for FileObjectLayout {
    fn default() -> Self {
        Self {
            device_object: 0x8,
            section_object_pointer: 0x28,
            file_name: 0x58,
        }
    }
}

/// Field offsets for `_SECTION_OBJECT_POINTERS`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SectionObjectPointersLayout {
    pub data_section_object: u64,
    pub shared_cache_map: u64,
    pub image_section_object: u64,
}

impl Default for SectionObjectPointersLayout {
    fn default() -> Self {
        Self {
            data_section_object: 0x0,
            shared_cache_map: 0x8,
            image_section_object: 0x10,
        }
    }
}

/// Field offsets for `_CONTROL_AREA`. The first `_SUBSECTION` is laid out
/// right behind the control area, hence `size` doubling as the chain anchor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlAreaLayout {
    pub size: u64,
    pub file_pointer: u64,
}

impl Default for ControlAreaLayout {
    fn default() -> Self {
        Self {
            size: 0x80,
            file_pointer: 0x40,
        }
    }
}

/// Field offsets for `_SUBSECTION`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubsectionLayout {
    pub control_area: u64,
    pub subsection_base: u64,
    pub next_subsection: u64,
    pub ptes_in_subsection: u64,
    pub starting_sector: u64,
    pub number_of_full_sectors: u64,
}

impl Default for SubsectionLayout {
    fn default() -> Self {
        Self {
            control_area: 0x0,
            subsection_base: 0x8,
            next_subsection: 0x10,
            ptes_in_subsection: 0x18,
            starting_sector: 0x24,
            number_of_full_sectors: 0x28,
        }
    }
}

/// The object-manager geometry needed to recover an object's name: where the
/// object body sits relative to its `_OBJECT_HEADER`, and how to locate the
/// `_OBJECT_HEADER_NAME_INFO` that optionally precedes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectHeaderLayout {
    pub body_offset: u64,
    pub info_mask: u64,
    pub name_info_size: u64,
    pub creator_info_size: u64,
    pub name_info_name: u64,
}

impl Default for ObjectHeaderLayout {
    fn default() -> Self {
        Self {
            body_offset: 0x30,
            info_mask: 0x1a,
            name_info_size: 0x20,
            creator_info_size: 0x20,
            name_info_name: 0x8,
        }
    }
}

/// All the structure layouts in one place.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Layouts {
    pub vacb: VacbLayout,
    pub vacb_array: VacbArrayLayout,
    pub shared_cache_map: SharedCacheMapLayout,
    pub file_object: FileObjectLayout,
    pub section_object_pointers: SectionObjectPointersLayout,
    pub control_area: ControlAreaLayout,
    pub subsection: SubsectionLayout,
    pub object_header: ObjectHeaderLayout,
}

/// A profile: named kernel globals resolved to virtual addresses plus the
/// structure layouts above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    globals: BTreeMap<String, u64>,
    pub layouts: Layouts,
}

impl Profile {
    /// Create a profile from a set of resolved globals, with default layouts.
    pub fn with_globals(globals: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            globals: globals.into_iter().collect(),
            layouts: Layouts::default(),
        }
    }

    /// Resolve a named kernel global to the virtual address of the variable
    /// itself. `None` means the symbol is not known to this profile, which
    /// downstream treats as "feature not present on this kernel".
    pub fn global(&self, name: &str) -> Option<Va> {
        self.globals.get(name).copied().map(Va::new)
    }

    /// Reject layouts that cannot describe anything: a zero-sized `_VACB`
    /// or an empty table would turn every walk into nonsense, so they fail
    /// up front instead of degrading quietly mid-scan.
    pub fn validate(&self) -> Result<()> {
        if self.layouts.vacb.size == 0 {
            return Err(Error::InvalidProfile("_VACB size is zero"));
        }

        if self.layouts.vacb_array.slots_per_table == 0 {
            return Err(Error::InvalidProfile("no _VACB slots per table"));
        }

        if self.layouts.control_area.size == 0 {
            return Err(Error::InvalidProfile("_CONTROL_AREA size is zero"));
        }

        Ok(())
    }
}
