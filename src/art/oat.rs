//! OatQuickMethodHeader: the little descriptor ART places immediately before
//! each compiled method's code. What the fields mean has changed repeatedly;
//! all the version fencing lives here, keyed off the layout tables.
//!
//! From OAT 192 the header is a single word that is either a code-info
//! offset or a raw code size, distinguished by a flag bit whose position
//! moved at 238. From 239 the word is always a code-info offset and Nterp
//! frames are recognized by their entry point instead.
use crate::art::ArtState;
use crate::art::code_info::{CodeInfo, DexRegisterInfo};
use crate::core::{Core, CoreError, MemoryRef, Result};
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QuickMethodFrameInfo {
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

pub struct OatQuickMethodHeader {
    mem: MemoryRef,
}

impl OatQuickMethodHeader {
    pub fn at(mem: MemoryRef) -> OatQuickMethodHeader {
        OatQuickMethodHeader { mem }
    }

    /// The header sits `sizeof(OatQuickMethodHeader)` bytes before the code
    /// it describes.
    pub fn from_code_pointer(core: &Core, art: &ArtState, code: u64) -> Result<OatQuickMethodHeader> {
        let size = art.layouts()?.method_header.size;
        let mem = core.memory_ref(core.strip_code_tag(code).wrapping_sub(size))?;
        Ok(OatQuickMethodHeader { mem })
    }

    pub fn addr(&self) -> u64 {
        self.mem.vaddr()
    }

    fn field_u32(&self, core: &Core, offset: Option<u64>) -> Result<u32> {
        let offset = offset.ok_or(CoreError::PreconditionViolated(
            "method header field missing in this OAT version",
        ))?;
        self.mem.read_u32(&core.space, offset)
    }

    /// The address of the machine code: the code field is the trailing
    /// flexible array, so its offset is the code itself.
    pub fn code(&self, art: &ArtState) -> Result<u64> {
        Ok(self.mem.vaddr() + art.layouts()?.method_header.code)
    }

    /// `code()` with the architecture's tag bits stripped.
    pub fn code_start(&self, core: &Core, art: &ArtState) -> Result<u64> {
        Ok(core.strip_code_tag(self.code(art)?))
    }

    pub fn is_optimized(&self, core: &Core, art: &ArtState) -> Result<bool> {
        let layouts = art.layouts()?;
        let header = &layouts.method_header;
        if layouts.oat_version >= 239 {
            // Everything is optimized code now except the two hand-written
            // interpreter entry points.
            let code = self.code(art)?;
            for nterp in [art.nterp_impl(), art.nterp_with_clinit_impl()] {
                if let Some(entry) = nterp
                    && entry.entry_point == code
                {
                    return Ok(false);
                }
            }
            Ok(true)
        } else if layouts.oat_version >= 192 {
            Ok(self.field_u32(core, header.data)? & header.is_code_info_mask != 0)
        } else {
            Ok(self.code_size(core, art)? != 0
                && self.field_u32(core, header.vmap_table_offset)? != 0)
        }
    }

    pub fn code_size(&self, core: &Core, art: &ArtState) -> Result<u32> {
        let layouts = art.layouts()?;
        let header = &layouts.method_header;
        if layouts.oat_version >= 239 {
            // Nterp's "methods" share one header; their size is a word
            // stored alongside the entry point symbol.
            let code = self.code(art)?;
            for nterp in [art.nterp_impl(), art.nterp_with_clinit_impl()] {
                if let Some(entry) = nterp
                    && entry.entry_point == code
                {
                    return Ok(entry.code_size);
                }
            }
            Ok(self.code_info(core, art)?.code_size)
        } else if layouts.oat_version >= 192 {
            let data = self.field_u32(core, header.data)?;
            if data & header.is_code_info_mask != 0 {
                Ok(self.code_info(core, art)?.code_size)
            } else {
                Ok(data & header.code_size_mask)
            }
        } else {
            Ok(self.field_u32(core, header.code_size)? & header.code_size_mask)
        }
    }

    /// Inclusive on both ends: the one-past-the-end PC is how return
    /// addresses point at their frame's method.
    pub fn contains(&self, core: &Core, art: &ArtState, pc: u64) -> Result<bool> {
        let code_start = self.code_start(core, art)?;
        let pc = pc & core.space.vabits_mask();
        Ok(code_start <= pc && pc <= code_start + self.code_size(core, art)? as u64)
    }

    fn code_info_offset(&self, core: &Core, art: &ArtState) -> Result<u32> {
        let layouts = art.layouts()?;
        let header = &layouts.method_header;
        if layouts.oat_version >= 239 {
            self.field_u32(core, header.code_info_offset)
        } else if layouts.oat_version >= 192 {
            Ok(self.field_u32(core, header.data)? & header.code_info_mask)
        } else {
            self.field_u32(core, header.vmap_table_offset)
        }
    }

    /// Decode the code-info blob, which lives `code_info_offset` bytes
    /// before the code.
    pub fn code_info(&self, core: &Core, art: &ArtState) -> Result<CodeInfo> {
        let layouts = art.layouts()?;
        let offset = self.code_info_offset(core, art)? as u64;
        let at = self.code_start(core, art)?.wrapping_sub(offset);
        let bytes = core.translate(at)?;
        CodeInfo::decode(bytes, layouts.oat_version)
    }

    pub fn frame_info(&self, core: &Core, art: &ArtState) -> Result<QuickMethodFrameInfo> {
        let layouts = art.layouts()?;
        if layouts.oat_version >= 156 {
            let info = self.code_info(core, art)?;
            Ok(QuickMethodFrameInfo {
                frame_size_in_bytes: info.frame_size_in_bytes(),
                core_spill_mask: info.core_spill_mask,
                fp_spill_mask: info.fp_spill_mask,
            })
        } else {
            let offset = layouts.method_header.frame_info.ok_or(
                CoreError::PreconditionViolated("frame info field missing"),
            )?;
            Ok(QuickMethodFrameInfo {
                frame_size_in_bytes: self.mem.read_u32(&core.space, offset)?,
                core_spill_mask: self.mem.read_u32(&core.space, offset + 4)?,
                fp_spill_mask: self.mem.read_u32(&core.space, offset + 8)?,
            })
        }
    }

    pub fn native_pc_to_dex_pc(&self, core: &Core, art: &ArtState, native_pc: u32) -> Result<u32> {
        self.code_info(core, art)?
            .native_pc_to_dex_pc(native_pc, core.machine)
    }

    pub fn native_pc_to_vregs(
        &self,
        core: &Core,
        art: &ArtState,
        native_pc: u32,
    ) -> Result<BTreeMap<u16, DexRegisterInfo>> {
        self.code_info(core, art)?
            .native_pc_to_vregs(native_pc, core.machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::art::code_info::encode;
    use crate::core::Machine;
    use crate::core::elf::{PF_R, PF_X};
    use crate::core::testdata::CoreBuilder;

    // Lay out [code info][header][code] in one RX block, the way the
    // compiler does, and return (core, header).
    fn core_with_method(sdk: u32, data_word: u32, info_blob: &[u8]) -> (Core, ArtState, u64) {
        const BASE: u64 = 0x70_0000;
        let mut seg = vec![0u8; 0x1000];
        let info_at = 0x100 - info_blob.len();
        seg[info_at..0x100].copy_from_slice(info_blob);
        seg[0x100..0x104].copy_from_slice(&data_word.to_le_bytes());
        // "code" starts at 0x104 and is NOPs.
        for byte in seg[0x104..0x200].iter_mut() {
            *byte = 0x90;
        }

        let path = CoreBuilder::new(Machine::X86_64)
            .load(BASE, PF_R | PF_X, &seg)
            .write("oat-core");
        let core = Core::load(&path).unwrap();
        let mut art = ArtState::new();
        art.init(core.machine.pointer_bits(), sdk).unwrap();
        (core, art, BASE + 0x100)
    }

    #[test]
    fn oat_192_code_info_bit() {
        // SDK 31 -> OAT 195: flag at 0x40000000, code info blob says 0x1000.
        let blob = encode::header_only(0x1000, 2, 0, 0);
        let data = 0x4000_0000 | (blob.len() as u32 + 4);
        let (core, art, header_at) = core_with_method(31, data, &blob);
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());

        assert!(header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x1000);
        assert_eq!(header.code(&art).unwrap(), header_at + 4);
    }

    #[test]
    fn oat_192_raw_code_size() {
        let (core, art, header_at) = core_with_method(31, 0x1000, &[]);
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());
        assert!(!header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x1000);
    }

    #[test]
    fn oat_238_mask_moved() {
        // SDK 33 -> OAT 227 keeps the old bit; SDK 34 -> 244 is >= 239 and
        // treats the word as an offset outright, so test 238 semantics via
        // the mask values on a 227 layout and the flipped bit on 244.
        let blob = encode::header_only(0x1000, 2, 0, 0);
        let data = 0x4000_0000 | (blob.len() as u32 + 4);
        let (core, art, header_at) = core_with_method(33, data, &blob);
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());
        assert!(header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x1000);

        // 0x8000_0000 is kShouldDeoptimize there, not "has code info".
        let (core, art, header_at) = core_with_method(33, 0x8000_1000, &[]);
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());
        assert!(!header.is_optimized(&core, &art).unwrap());
    }

    #[test]
    fn oat_238_regime() {
        // Between 238 and 239 the flag bit sits at the top of the word.
        const BASE: u64 = 0x70_0000;
        let blob = encode::header_only(0x1000, 2, 0, 0);
        let data = 0x8000_0000 | (blob.len() as u32 + 4);

        let mut seg = vec![0u8; 0x1000];
        let info_at = 0x100 - blob.len();
        seg[info_at..0x100].copy_from_slice(&blob);
        seg[0x100..0x104].copy_from_slice(&data.to_le_bytes());
        let path = CoreBuilder::new(Machine::X86_64)
            .load(BASE, PF_R | PF_X, &seg)
            .write("oat-238-core");
        let core = Core::load(&path).unwrap();
        let mut art = ArtState::new();
        art.init_with_oat(64, 33, 238).unwrap();

        let header = OatQuickMethodHeader::at(core.memory_ref(BASE + 0x100).unwrap());
        assert!(header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x1000);

        // With the top bit clear the word is a raw code size again.
        let mut seg = vec![0u8; 0x1000];
        seg[0x100..0x104].copy_from_slice(&0x1000u32.to_le_bytes());
        let path = CoreBuilder::new(Machine::X86_64)
            .load(BASE, PF_R | PF_X, &seg)
            .write("oat-238-raw-core");
        let core = Core::load(&path).unwrap();
        let header = OatQuickMethodHeader::at(core.memory_ref(BASE + 0x100).unwrap());
        assert!(!header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x1000);
    }

    #[test]
    fn oat_239_always_code_info() {
        // SDK 34 -> OAT 244: the word is a plain code info offset.
        let blob = encode::header_only(0x80, 2, 0x3, 0);
        let data = blob.len() as u32 + 4;
        let (core, art, header_at) = core_with_method(34, data, &blob);
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());

        assert!(header.is_optimized(&core, &art).unwrap());
        assert_eq!(header.code_size(&core, &art).unwrap(), 0x80);
        let frame = header.frame_info(&core, &art).unwrap();
        assert_eq!(frame.frame_size_in_bytes, 32);
        assert_eq!(frame.core_spill_mask, 0x3);
        assert!(header.contains(&core, &art, header_at + 4).unwrap());
        assert!(header.contains(&core, &art, header_at + 4 + 0x80).unwrap());
        assert!(!header.contains(&core, &art, header_at + 4 + 0x81).unwrap());
    }

    #[test]
    fn decoder_requires_layouts() {
        let (core, _, header_at) = core_with_method(31, 0, &[]);
        let art = ArtState::new();
        let header = OatQuickMethodHeader::at(core.memory_ref(header_at).unwrap());
        assert!(matches!(
            header.code_size(&core, &art),
            Err(CoreError::PreconditionViolated(_))
        ));
    }
}
