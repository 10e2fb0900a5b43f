//! Decoding the Android Runtime's side of the process: version-gated layout
//! tables, the OAT method header and code-info decoders, and the handful of
//! libart singletons the decoders hang off. All of it lives in per-session
//! state rather than globals so two cores can be analyzed back to back.
pub mod code_info;
pub mod layout;
pub mod oat;
pub mod quick_frame;

pub use layout::Layouts;
pub use oat::{OatQuickMethodHeader, QuickMethodFrameInfo};

use crate::core::{Core, CoreError, MemoryRef, Result, Walk};
use crate::utils;

// Symbols resolved out of libart's dynamic table.
const RUNTIME_INSTANCE: &str = "_ZN3art7Runtime9instance_E";
const NTERP_IMPL: &str = "_ZN3art20OatQuickMethodHeader9NterpImplE";
const NTERP_WITH_CLINIT_IMPL: &str = "_ZN3art20OatQuickMethodHeader19NterpWithClinitImplE";

/// One of the interpreter's entry points: the address compiled frames are
/// compared against, plus the code size stashed in the word after it.
#[derive(Copy, Clone)]
pub struct NterpEntry {
    pub entry_point: u64,
    pub code_size: u32,
}

/// Per-session ART state. `init` must run (with the detected or supplied SDK
/// level) before any decoder is used; re-initializing with a different
/// version is rejected because every cached decode would be suspect.
pub struct ArtState {
    layouts: Option<Layouts>,
    runtime: Option<MemoryRef>,
    nterp_impl: Option<NterpEntry>,
    nterp_with_clinit_impl: Option<NterpEntry>,
}

impl ArtState {
    pub fn new() -> ArtState {
        ArtState {
            layouts: None,
            runtime: None,
            nterp_impl: None,
            nterp_with_clinit_impl: None,
        }
    }

    pub fn init(&mut self, bits: u32, sdk: u32) -> Result<()> {
        if let Some(existing) = &self.layouts {
            if existing.sdk == sdk && existing.bits == bits {
                return Ok(());
            }
            return Err(CoreError::PreconditionViolated(
                "layouts already initialized for a different ART version",
            ));
        }
        self.layouts = Some(Layouts::init(bits, sdk)?);
        Ok(())
    }

    /// Like `init`, but with the OAT version pinned rather than derived from
    /// the SDK table. Useful for builds cut between platform releases.
    pub fn init_with_oat(&mut self, bits: u32, sdk: u32, oat_version: u32) -> Result<()> {
        if let Some(existing) = &self.layouts {
            if existing.oat_version == oat_version && existing.bits == bits {
                return Ok(());
            }
            return Err(CoreError::PreconditionViolated(
                "layouts already initialized for a different ART version",
            ));
        }
        self.layouts = Some(Layouts::with_oat_version(bits, sdk, oat_version));
        Ok(())
    }

    pub fn layouts(&self) -> Result<&Layouts> {
        self.layouts
            .as_ref()
            .ok_or(CoreError::PreconditionViolated("ART decoder"))
    }

    /// Resolve and cache the Nterp entry points. Harmless to call on cores
    /// without libart; the entries just stay unknown.
    pub fn oat_prepare(&mut self, core: &Core) {
        if self.nterp_impl.is_none() {
            self.nterp_impl = read_nterp_entry(core, NTERP_IMPL);
        }
        if self.nterp_with_clinit_impl.is_none() {
            self.nterp_with_clinit_impl = read_nterp_entry(core, NTERP_WITH_CLINIT_IMPL);
        }
    }

    pub fn nterp_impl(&self) -> Option<&NterpEntry> {
        self.nterp_impl.as_ref()
    }

    pub fn nterp_with_clinit_impl(&self) -> Option<&NterpEntry> {
        self.nterp_with_clinit_impl.as_ref()
    }

    /// The `art::Runtime` singleton, through `Runtime::instance_`.
    pub fn runtime(&mut self, core: &Core) -> Result<MemoryRef> {
        if let Some(runtime) = self.runtime {
            return Ok(runtime);
        }
        let instance = core.search_symbol(RUNTIME_INSTANCE)?;
        let runtime_addr = core.read_ptr(instance)?;
        if runtime_addr == 0 {
            return Err(CoreError::not_found("art::Runtime instance"));
        }
        let runtime = core.memory_ref(runtime_addr)?;
        self.runtime = Some(runtime);
        Ok(runtime)
    }

    /// Override used by tests and by cores whose libart has no symbols.
    pub fn set_nterp_impl(&mut self, entry: NterpEntry) {
        self.nterp_impl = Some(entry);
    }
}

impl Default for ArtState {
    fn default() -> Self {
        ArtState::new()
    }
}

fn read_nterp_entry(core: &Core, symbol: &str) -> Option<NterpEntry> {
    let sym = core.search_symbol(symbol).ok()?;
    let mem = core.memory_ref(sym).ok()?;
    let entry_point = mem.value(&core.space).ok()?;
    if entry_point == 0 {
        return None;
    }
    let code_size = mem.read_ptr(&core.space, core.pointer_size()).ok()? as u32;
    Some(NterpEntry {
        entry_point,
        code_size,
    })
}

/// Best-effort SDK detection: Android keeps its system properties mapped in
/// the zygote's address space, so `ro.build.version.sdk=NN` usually survives
/// into the core. Returns the first plausible hit.
pub fn detect_sdk(core: &Core) -> Option<u32> {
    const NEEDLE: &[u8] = b"ro.build.version.sdk=";
    let mut found = None;

    core.foreach_load_block(|_, block| {
        let Ok(bytes) = block.translate(block.vaddr) else {
            return Walk::Continue;
        };
        for window in bytes.windows(NEEDLE.len()).enumerate() {
            let (at, candidate) = window;
            if candidate != NEEDLE {
                continue;
            }
            let digits: String = bytes[at + NEEDLE.len()..]
                .iter()
                .take(2)
                .take_while(|b| b.is_ascii_digit())
                .map(|b| *b as char)
                .collect();
            if let Ok(sdk) = digits.parse::<u32>() {
                found = Some(sdk);
                return Walk::Stop;
            }
        }
        Walk::Continue
    });

    if let Some(sdk) = found {
        utils::warn(&format!("detected SDK {sdk} from system properties"));
    }
    found
}
