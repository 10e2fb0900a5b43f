//! Offset and size tables for the runtime structures we decode. ART's
//! in-memory layouts drift across releases, so every table is picked once,
//! up front, from the detected SDK level and pointer width, and is immutable
//! afterwards. Version gates are inclusive lower bounds on the OAT version,
//! which moves independently of the platform API level.
use crate::core::{CoreError, Result};
use crate::utils;

/// Everything the decoders need to know about the target's ART build.
pub struct Layouts {
    pub bits: u32,
    pub sdk: u32,
    pub oat_version: u32,
    pub method_header: MethodHeaderLayout,
    pub logd: SerializedLogBufferLayout,
    pub nterp_frame: NterpFrameLayout,
}

impl Layouts {
    pub fn init(bits: u32, sdk: u32) -> Result<Layouts> {
        let oat_version = oat_version_for_sdk(sdk)?;
        Ok(Layouts::with_oat_version(bits, sdk, oat_version))
    }

    /// For targets whose OAT version is known exactly, e.g. builds between
    /// platform releases.
    pub fn with_oat_version(bits: u32, sdk: u32, oat_version: u32) -> Layouts {
        Layouts {
            bits,
            sdk,
            oat_version,
            method_header: MethodHeaderLayout::for_oat(oat_version),
            logd: SerializedLogBufferLayout::for_sdk(sdk),
            nterp_frame: NterpFrameLayout {
                ptr_size: (bits / 8) as u64,
            },
        }
    }
}

/// OAT versions shipped with each platform release. The gates the decoders
/// care about are 124, 156, 158, 192, 238 and 239.
fn oat_version_for_sdk(sdk: u32) -> Result<u32> {
    match sdk {
        26 => Ok(124),
        27 => Ok(131),
        28 => Ok(138),
        29 => Ok(170),
        30 => Ok(183),
        31 | 32 => Ok(195),
        33 => Ok(227),
        34 => Ok(244),
        35.. => Ok(247),
        _ => Err(CoreError::unsupported(format!("unknown OAT version for SDK {sdk}"))),
    }
}

/// OatQuickMethodHeader, the per-compiled-method descriptor that sits right
/// before the machine code. Offsets that don't exist in a given version are
/// None; reading them is a decoder bug.
pub struct MethodHeaderLayout {
    pub vmap_table_offset: Option<u64>,
    pub method_info_offset: Option<u64>,
    pub frame_info: Option<u64>,
    pub code_size: Option<u64>,
    /// The shared code-info-offset / code-size word, from 192 on.
    pub data: Option<u64>,
    /// From 239 on the word only ever holds a code info offset.
    pub code_info_offset: Option<u64>,
    /// Offset of the code itself; the field is the trailing flexible array,
    /// so this equals the header size.
    pub code: u64,
    pub size: u64,

    pub is_code_info_mask: u32,
    pub code_info_mask: u32,
    pub code_size_mask: u32,
}

impl MethodHeaderLayout {
    pub fn for_oat(oat: u32) -> MethodHeaderLayout {
        let mut layout = MethodHeaderLayout {
            vmap_table_offset: Some(0),
            method_info_offset: Some(4),
            frame_info: Some(8),
            code_size: Some(20),
            data: None,
            code_info_offset: None,
            code: 24,
            size: 24,
            is_code_info_mask: 0x4000_0000,
            code_info_mask: 0x3FFF_FFFF,
            // ~kShouldDeoptimizeMask
            code_size_mask: 0x7FFF_FFFF,
        };
        if oat >= 156 {
            layout.frame_info = None;
            layout.code_size = Some(8);
            layout.code = 12;
            layout.size = 12;
        }
        if oat >= 158 {
            layout.method_info_offset = None;
            layout.code_size = Some(4);
            layout.code = 8;
            layout.size = 8;
        }
        if oat >= 192 {
            layout.vmap_table_offset = None;
            layout.code_size = None;
            layout.data = Some(0);
            layout.code = 4;
            layout.size = 4;
            layout.is_code_info_mask = 0x4000_0000;
            layout.code_info_mask = 0x3FFF_FFFF;
            layout.code_size_mask = 0x3FFF_FFFF;
        }
        if oat >= 238 {
            layout.is_code_info_mask = 0x8000_0000;
            layout.code_info_mask = 0x7FFF_FFFF;
            layout.code_size_mask = 0x7FFF_FFFF;
        }
        if oat >= 239 {
            layout.data = None;
            layout.code_info_offset = Some(0);
        }
        layout
    }
}

/// logd's SerializedLogBuffer, the in-memory form of the logcat buffers
/// since Android S. 64-bit only; nobody ships 32-bit logd any more.
pub struct SerializedLogBufferLayout {
    pub vtbl: u64,
    /// How many vtable slots the probe checks for containment in exec text.
    pub vtable_slots: u64,
    pub reader_list: u64,
    pub tags: u64,
    pub stats: u64,
    /// std::list<SerializedLogChunk> logs_[LOG_ID_MAX]
    pub logs: u64,
    pub log_id_max: u64,
    /// sizeof(std::list) in the target's libc++.
    pub list_size: u64,
    pub size: u64,
}

impl SerializedLogBufferLayout {
    fn for_sdk(_sdk: u32) -> SerializedLogBufferLayout {
        // vtable ptr, three owner pointers, max_size_[8], logs_[8], sequence_.
        SerializedLogBufferLayout {
            vtbl: 0,
            vtable_slots: 8,
            reader_list: 8,
            tags: 16,
            stats: 24,
            logs: 96,
            log_id_max: 8,
            list_size: 24,
            size: 296,
        }
    }
}

/// Where things live in an nterp frame, relative to the quick frame pointer.
/// The interpreter's frame is: ArtMethod* at the bottom, then the reference
/// array, the dex register array, and the saved dex pc above those.
pub struct NterpFrameLayout {
    ptr_size: u64,
}

impl NterpFrameLayout {
    pub fn refs_offset(&self) -> u64 {
        self.ptr_size
    }

    pub fn vreg_offset(&self, num_vregs: u16, index: u16) -> u64 {
        let refs_end = self.refs_offset() + num_vregs as u64 * 4;
        utils::round_up(refs_end, self.ptr_size) + index as u64 * 4
    }

    pub fn dex_pc_ptr_offset(&self, num_vregs: u16) -> u64 {
        let vregs_end = self.vreg_offset(num_vregs, num_vregs);
        utils::round_up(vregs_end, self.ptr_size)
    }
}
