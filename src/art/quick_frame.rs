//! A stack frame belonging to compiled (or Nterp-interpreted) managed code:
//! a method, its header, and the PC the frame was suspended at. Dex PCs and
//! virtual registers come from the code-info tables for optimized frames and
//! from the interpreter's frame layout for Nterp frames.
use crate::art::ArtState;
use crate::art::oat::OatQuickMethodHeader;
use crate::core::{Core, MemoryRef, Result};

/// The little we need to know about the frame's ArtMethod.
pub struct FrameMethod {
    pub is_native: bool,

    /// Register count from the method's code item; drives the nterp frame
    /// layout.
    pub num_vregs: u16,
}

pub struct QuickFrame {
    pub method: FrameMethod,
    pub header: Option<OatQuickMethodHeader>,

    /// Absolute PC within the method the frame was suspended at.
    pub frame_pc: u64,

    /// The quick frame pointer: where the ArtMethod* slot lives on the stack.
    pub frame: MemoryRef,

    vregs: Option<Vec<u32>>,
}

impl QuickFrame {
    pub fn new(
        method: FrameMethod,
        header: Option<OatQuickMethodHeader>,
        frame_pc: u64,
        frame: MemoryRef,
    ) -> QuickFrame {
        QuickFrame {
            method,
            header,
            frame_pc,
            frame,
            vregs: None,
        }
    }

    /// The dex PC the frame is at: zero for native methods, a code-info
    /// lookup for optimized frames, and a slot in the interpreter frame for
    /// Nterp.
    pub fn dex_pc_ptr(&self, core: &Core, art: &ArtState) -> Result<u64> {
        if self.method.is_native {
            return Ok(0);
        }
        let Some(header) = &self.header else {
            return Ok(0);
        };

        if header.is_optimized(core, art)? {
            let native_pc = self.frame_pc.wrapping_sub(header.code_start(core, art)?) as u32;
            Ok(header.native_pc_to_dex_pc(core, art, native_pc)? as u64)
        } else {
            let offset = art
                .layouts()?
                .nterp_frame
                .dex_pc_ptr_offset(self.method.num_vregs);
            self.frame.read_ptr(&core.space, offset)
        }
    }

    /// The frame's dex registers, materialized lazily and cached. Optimized
    /// frames come back empty: their registers are only recorded per PC, so
    /// callers go straight to `native_pc_to_vregs`.
    pub fn vregs(&mut self, core: &Core, art: &ArtState) -> Result<&[u32]> {
        if self.vregs.is_none() {
            self.vregs = Some(self.materialize_vregs(core, art)?);
        }
        Ok(self.vregs.as_ref().unwrap())
    }

    fn materialize_vregs(&self, core: &Core, art: &ArtState) -> Result<Vec<u32>> {
        if self.method.is_native {
            return Ok(Vec::new());
        }
        let Some(header) = &self.header else {
            return Ok(Vec::new());
        };
        if header.is_optimized(core, art)? {
            return Ok(Vec::new());
        }

        let layout = &art.layouts()?.nterp_frame;
        let mut vregs = Vec::with_capacity(self.method.num_vregs as usize);
        for i in 0..self.method.num_vregs {
            let offset = layout.vreg_offset(self.method.num_vregs, i);
            vregs.push(self.frame.read_u32(&core.space, offset)?);
        }
        Ok(vregs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::art::NterpEntry;
    use crate::core::Machine;
    use crate::core::elf::{PF_R, PF_W, PF_X};
    use crate::core::testdata::CoreBuilder;

    // An Nterp frame: code block holds a method header whose code matches
    // the (fake) Nterp entry point; a stack block holds the interpreter
    // frame with three vregs and a saved dex pc pointer.
    fn nterp_setup() -> (Core, ArtState, QuickFrame) {
        const CODE: u64 = 0x70_0000;
        const STACK: u64 = 0x7fff_0000;
        const NUM_VREGS: u16 = 3;

        let mut code_seg = vec![0u8; 0x100];
        // OAT >= 239 header: a single code-info-offset word at 0x40.
        code_seg[0x40..0x44].copy_from_slice(&0u32.to_le_bytes());

        let mut stack_seg = vec![0u8; 0x100];
        // frame base at STACK+0x20: ArtMethod*, refs[3], vregs[3], dex_pc.
        let base = 0x20usize;
        for i in 0..NUM_VREGS as usize {
            let at = base + 24 + i * 4; // vreg array per the nterp layout
            stack_seg[at..at + 4].copy_from_slice(&(0x100 + i as u32).to_le_bytes());
        }
        let dex_pc_at = base + 40;
        stack_seg[dex_pc_at..dex_pc_at + 8].copy_from_slice(&0x1234_5678u64.to_le_bytes());

        let path = CoreBuilder::new(Machine::X86_64)
            .load(CODE, PF_R | PF_X, &code_seg)
            .load(STACK, PF_R | PF_W, &stack_seg)
            .write("nterp-core");
        let core = Core::load(&path).unwrap();

        let mut art = ArtState::new();
        art.init(64, 34).unwrap();
        art.set_nterp_impl(NterpEntry {
            entry_point: CODE + 0x44, // the header's code address
            code_size: 0x1000,
        });

        let header = OatQuickMethodHeader::at(core.memory_ref(CODE + 0x40).unwrap());
        let frame = core.memory_ref(STACK + 0x20).unwrap();
        let quick = QuickFrame::new(
            FrameMethod {
                is_native: false,
                num_vregs: NUM_VREGS,
            },
            Some(header),
            CODE + 0x50,
            frame,
        );
        (core, art, quick)
    }

    #[test]
    fn nterp_dex_pc_and_vregs() {
        let (core, art, mut frame) = nterp_setup();
        assert!(!frame.header.as_ref().unwrap().is_optimized(&core, &art).unwrap());
        assert_eq!(frame.dex_pc_ptr(&core, &art).unwrap(), 0x1234_5678);
        assert_eq!(frame.vregs(&core, &art).unwrap(), &[0x100, 0x101, 0x102]);
        // Cached: a second call returns the same slice.
        assert_eq!(frame.vregs(&core, &art).unwrap().len(), 3);
    }

    #[test]
    fn native_frames_have_no_dex_pc() {
        let (core, art, _) = nterp_setup();
        let frame_ref = core.memory_ref(0x7fff_0020).unwrap();
        let mut frame = QuickFrame::new(
            FrameMethod {
                is_native: true,
                num_vregs: 0,
            },
            None,
            0,
            frame_ref,
        );
        assert_eq!(frame.dex_pc_ptr(&core, &art).unwrap(), 0);
        assert!(frame.vregs(&core, &art).unwrap().is_empty());
    }
}
