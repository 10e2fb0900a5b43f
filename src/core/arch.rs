//! The architectures we can analyze. Architecture-specific behavior is a
//! dispatch on this enum rather than a trait object: the set is closed and
//! each variant only differs in a handful of constants.
use crate::core::{CoreError, Result};

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;
pub const EM_RISCV: u16 = 243;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Machine {
    X86_64,
    I386,
    Aarch64,
    Arm,
    Riscv64,
}

impl Machine {
    pub fn from_elf(e_machine: u16) -> Result<Machine> {
        match e_machine {
            EM_X86_64 => Ok(Machine::X86_64),
            EM_386 => Ok(Machine::I386),
            EM_AARCH64 => Ok(Machine::Aarch64),
            EM_ARM => Ok(Machine::Arm),
            EM_RISCV => Ok(Machine::Riscv64),
            _ => Err(CoreError::InvalidElf {
                reason: format!("unsupported machine: {e_machine}"),
            }),
        }
    }

    pub fn elf_machine(&self) -> u16 {
        match self {
            Machine::X86_64 => EM_X86_64,
            Machine::I386 => EM_386,
            Machine::Aarch64 => EM_AARCH64,
            Machine::Arm => EM_ARM,
            Machine::Riscv64 => EM_RISCV,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Machine::X86_64 => "x86_64",
            Machine::I386 => "i386",
            Machine::Aarch64 => "aarch64",
            Machine::Arm => "arm",
            Machine::Riscv64 => "riscv64",
        }
    }

    pub fn pointer_bits(&self) -> u32 {
        match self {
            Machine::X86_64 | Machine::Aarch64 | Machine::Riscv64 => 64,
            Machine::I386 | Machine::Arm => 32,
        }
    }

    pub fn pointer_size(&self) -> u64 {
        (self.pointer_bits() / 8) as u64
    }

    /// The valid-virtual-address mask. Interpreted pointers are masked with
    /// this before translation so stray high bits (tags, PAC signatures)
    /// don't break lookups.
    pub fn vabits_mask(&self) -> u64 {
        match self {
            Machine::X86_64 => u64::MAX,
            Machine::I386 | Machine::Arm => 0xFFFF_FFFF,
            // Android arm64 kernels run with up to 52-bit VA.
            Machine::Aarch64 => (1u64 << 52) - 1,
            // Sv39 is what shipping riscv64 Android uses.
            Machine::Riscv64 => (1u64 << 39) - 1,
        }
    }

    /// Recover the true first-instruction address from a code pointer.
    /// AArch64 carries tag/PAC bits in the top byte; 32-bit ARM code
    /// pointers have the thumb bit stripped by the compiler so the real
    /// entry is one past the recorded value.
    pub fn strip_code_tag(&self, code: u64) -> u64 {
        match self {
            Machine::Aarch64 => code & ((1u64 << 56) - 1),
            Machine::Arm => code + 1,
            _ => code,
        }
    }

    /// Machine-code alignment, used when unpacking native PCs from
    /// compiler-emitted tables.
    pub fn instruction_alignment(&self) -> u32 {
        match self {
            Machine::X86_64 | Machine::I386 => 1,
            Machine::Arm | Machine::Riscv64 => 2,
            Machine::Aarch64 => 4,
        }
    }

    /// Number of general purpose registers recorded in NT_PRSTATUS.
    pub fn greg_count(&self) -> usize {
        match self {
            Machine::X86_64 => 27,
            Machine::I386 => 17,
            Machine::Aarch64 => 34, // x0-x30, sp, pc, pstate
            Machine::Arm => 18,
            Machine::Riscv64 => 32,
        }
    }
}
