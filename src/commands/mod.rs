pub mod info;
pub mod misc;
pub mod tables;

pub use info::*;
pub use misc::*;

use crate::art::ArtState;
use crate::core::Core;

/// Everything one analysis owns: the core and the runtime decoder state
/// hanging off it.
pub struct Session {
    pub core: Core,
    pub art: ArtState,
}
