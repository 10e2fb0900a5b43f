//! Heuristic probes for runtime singletons that can't be found by name.
//! logd's `SerializedLogBuffer` is the canonical case: logd strips its
//! symbols, but the buffer object sits somewhere on the heap and its shape
//! is distinctive enough to scan for. The probe walks every writable block
//! at pointer alignment and keeps the first candidate whose vtable slots all
//! land in the executable's text and whose owner pointers all land in the
//! executable's writable memory.
//!
//! Known limitation: requiring *every* vtable slot to point into exec text
//! under-matches on stripped builds with unusual relocations.
use crate::art::ArtState;
use crate::art::layout::SerializedLogBufferLayout;
use crate::core::{Core, CoreError, MemoryRef, Result, Walk};

/// How many chunks we'll follow in one buffer's list before deciding the
/// core is lying to us.
const MAX_CHUNKS: usize = 4096;

pub struct SerializedLogBuffer {
    pub mem: MemoryRef,
}

impl SerializedLogBuffer {
    pub fn reader_list(&self, core: &Core, layout: &SerializedLogBufferLayout) -> Result<u64> {
        self.mem.read_ptr(&core.space, layout.reader_list)
    }

    pub fn tags(&self, core: &Core, layout: &SerializedLogBufferLayout) -> Result<u64> {
        self.mem.read_ptr(&core.space, layout.tags)
    }

    pub fn stats(&self, core: &Core, layout: &SerializedLogBufferLayout) -> Result<u64> {
        self.mem.read_ptr(&core.space, layout.stats)
    }

    /// Address of the `std::list<SerializedLogChunk>` for one log id.
    pub fn logs(&self, layout: &SerializedLogBufferLayout, id: u64) -> u64 {
        self.mem.vaddr() + layout.logs + id * layout.list_size
    }

    /// The chunk nodes of one buffer, by walking the list's next pointers
    /// until they wrap back around to the head.
    pub fn chunks(
        &self,
        core: &Core,
        layout: &SerializedLogBufferLayout,
        id: u64,
    ) -> Result<Vec<u64>> {
        let head = self.logs(layout, id);
        let ptr = core.pointer_size();
        let mut nodes = Vec::new();
        // libc++ list nodes are { prev, next, value... }.
        let mut node = core.read_ptr(head + ptr)?;
        while node != head && nodes.len() < MAX_CHUNKS {
            nodes.push(node + 2 * ptr);
            node = core.read_ptr(node + ptr)?;
        }
        Ok(nodes)
    }
}

/// Scan the writable blocks for the logd buffer singleton. Only 64-bit
/// targets carry one we understand.
pub fn find_serialized_log_buffer(core: &Core, art: &ArtState) -> Result<SerializedLogBuffer> {
    if core.machine.pointer_bits() != 64 {
        return Err(CoreError::unsupported("32-bit logcat"));
    }
    let layouts = art.layouts()?;
    if layouts.sdk < 31 {
        return Err(CoreError::unsupported(format!(
            "logcat buffers before Android S (SDK {})",
            layouts.sdk
        )));
    }
    let layout = &layouts.logd;

    let entry = core
        .find_auxv(crate::core::notes::AT_ENTRY)
        .ok_or_else(|| CoreError::not_found("AT_ENTRY"))?;
    let text_block = core
        .space
        .find(entry)
        .ok_or_else(|| CoreError::not_found("exec text block"))?;
    let exec_name = core
        .find_auxv(crate::core::notes::AT_EXECFN)
        .and_then(|p| core.read_string(p).ok())
        .ok_or_else(|| CoreError::not_found("AT_EXECFN"))?;

    let in_exec_text = |ptr: u64| core.space.find(ptr) == Some(text_block);
    let in_exec_writable = |ptr: u64| {
        core.space
            .find(ptr)
            .map(|id| core.space.block(id).writable())
            .unwrap_or(false)
            && core.find_file(ptr).is_some_and(|f| f.name == exec_name)
    };

    let ptr_size = core.pointer_size();
    let mut found = None;

    core.foreach_load_block(|_, block| {
        if !block.writable() {
            return Walk::Continue;
        }

        let mut at = block.vaddr;
        while at + layout.size <= block.vaddr + block.mem_size {
            if let Some(hit) = probe_candidate(
                core,
                layout,
                at,
                ptr_size,
                &in_exec_text,
                &in_exec_writable,
            ) {
                found = Some(hit);
                return Walk::Stop;
            }
            at += ptr_size;
        }
        Walk::Continue
    });

    found.ok_or_else(|| CoreError::not_found("SerializedLogBuffer"))
}

fn probe_candidate(
    core: &Core,
    layout: &SerializedLogBufferLayout,
    at: u64,
    ptr_size: u64,
    in_exec_text: &dyn Fn(u64) -> bool,
    in_exec_writable: &dyn Fn(u64) -> bool,
) -> Option<SerializedLogBuffer> {
    let candidate = core.memory_ref(at).ok()?;

    // First word must be a pointer to a vtable whose slots all lie in the
    // executable's text.
    let vtbl = candidate.read_ptr(&core.space, layout.vtbl).ok()?;
    let vtbl_ref = core.memory_ref(vtbl).ok()?;
    for slot in 0..layout.vtable_slots {
        let method = vtbl_ref.read_ptr(&core.space, slot * ptr_size).ok()?;
        if !in_exec_text(method) {
            return None;
        }
    }

    // log_buffer = new SerializedLogBuffer(&reader_list, &log_tags, &log_statistics);
    for offset in [layout.reader_list, layout.tags, layout.stats] {
        let member = candidate.read_ptr(&core.space, offset).ok()?;
        if !in_exec_writable(member) {
            return None;
        }
    }

    Some(SerializedLogBuffer { mem: candidate })
}
