//! PT_NOTE parsing. For core files the notes carry the process state we care
//! about: one NT_PRSTATUS per thread, the auxiliary vector, and the mapped
//! file table. See fill_files_note and friends in the kernel's binfmt_elf.c.
use crate::core::arch::Machine;
use crate::core::io::Stream;
use crate::core::Result;
use crate::utils;

pub const NT_PRSTATUS: u32 = 1;
pub const NT_AUXV: u32 = 6;
pub const NT_FILE: u32 = 0x46494c45;

pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;
pub const AT_EXECFN: u64 = 31;
pub const AT_SYSINFO_EHDR: u64 = 33;

/// Register state for one thread, from NT_PRSTATUS.
pub struct ThreadRecord {
    /// The signal that terminated the process.
    pub signal: i32,

    pub pid: i32,

    /// General purpose registers, laid out as in the architecture's pt_regs.
    pub registers: Vec<u64>,
}

/// One row of the NT_FILE table: a file-backed vma.
pub struct FileRecord {
    pub start: u64,
    pub end: u64,

    /// Offset into the file, in bytes (the note stores pages).
    pub offset: u64,

    pub name: String,
}

/// The parsed children of one PT_NOTE segment.
pub struct NoteBlock {
    pub threads: Vec<ThreadRecord>,
    pub auxv: Vec<(u64, u64)>,
    pub files: Vec<FileRecord>,
}

impl NoteBlock {
    /// Core files can be damaged (typically truncated), and not all notes are
    /// essential, so a note that fails to parse is logged and skipped rather
    /// than failing the whole load.
    pub fn parse(bytes: &[u8], machine: Machine) -> NoteBlock {
        let wide = machine.pointer_bits() == 64;
        let mut block = NoteBlock {
            threads: Vec::new(),
            auxv: Vec::new(),
            files: Vec::new(),
        };

        let mut s = Stream::new(bytes, 0, wide);
        while s.remaining() >= 12 {
            match read_note(&mut s, bytes) {
                Ok((name, ntype, desc)) => {
                    if name != "CORE" {
                        continue;
                    }
                    match ntype {
                        NT_PRSTATUS => match parse_prstatus(desc, machine) {
                            Ok(thread) => block.threads.push(thread),
                            Err(err) => utils::warn(&format!("bad NT_PRSTATUS: {err}")),
                        },
                        NT_AUXV => match parse_auxv(desc, wide) {
                            Ok(mut pairs) => block.auxv.append(&mut pairs),
                            Err(err) => utils::warn(&format!("bad NT_AUXV: {err}")),
                        },
                        NT_FILE => match parse_files(desc, wide) {
                            Ok(mut files) => block.files.append(&mut files),
                            Err(err) => utils::warn(&format!("bad NT_FILE: {err}")),
                        },
                        _ => (), // PRPSINFO, SIGINFO, FPREGSET, ... nothing we need
                    }
                }
                Err(err) => {
                    utils::warn(&format!("failed to read note at offset {}: {err}", s.offset));
                    break;
                }
            }
        }
        block
    }
}

/// Reads one note header and returns (name, type, desc bytes), leaving the
/// stream at the next note. Name and desc are both 4-byte aligned.
fn read_note<'a>(s: &mut Stream, bytes: &'a [u8]) -> Result<(String, u32, &'a [u8])> {
    let namesz = s.read_word()?;
    let descsz = s.read_word()?;
    let ntype = s.read_word()?;

    let name_at = s.offset;
    let name = if namesz > 0 {
        let mut name_stream = Stream::new(bytes, name_at, s.wide);
        name_stream.read_string()?
    } else {
        String::new()
    };
    s.skip(utils::align_to_word(namesz) as usize);

    let desc_at = s.offset;
    let desc_end = desc_at + descsz as usize;
    if desc_end > bytes.len() {
        return Err(crate::core::CoreError::InvalidElf {
            reason: format!("note desc at {desc_at} runs past the segment"),
        });
    }
    s.skip(utils::align_to_word(descsz) as usize);

    Ok((name, ntype, &bytes[desc_at..desc_end]))
}

// See elf_prstatus in the kernel's uapi/linux/elfcore.h.
fn parse_prstatus(desc: &[u8], machine: Machine) -> Result<ThreadRecord> {
    let wide = machine.pointer_bits() == 64;
    let mut s = Stream::new(desc, 0, wide);
    let signal = s.read_int()?; // si_signo
    let _code = s.read_int()?;
    let _errno = s.read_int()?;
    let _cursig = s.read_half()?;
    let _padding = s.read_half()?;
    let _pending = s.read_ulong()?;
    let _held = s.read_ulong()?;
    let pid = s.read_int()?;
    let _ppid = s.read_int()?;
    let _pgrp = s.read_int()?;
    let _sid = s.read_int()?;
    for _ in 0..8 {
        let _time = s.read_ulong()?; // utime, stime, cutime, cstime
    }

    let width = machine.pointer_size() as usize;
    let count = machine.greg_count().min(s.remaining() / width);
    let mut registers = Vec::with_capacity(count);
    for _ in 0..count {
        registers.push(s.read_addr()?);
    }

    Ok(ThreadRecord {
        signal,
        pid,
        registers,
    })
}

fn parse_auxv(desc: &[u8], wide: bool) -> Result<Vec<(u64, u64)>> {
    let mut s = Stream::new(desc, 0, wide);
    let mut pairs = Vec::new();
    let entry = if wide { 16 } else { 8 };
    while s.remaining() >= entry {
        let key = s.read_addr()?;
        let value = s.read_addr()?;
        if key == 0 {
            break; // AT_NULL
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

// Layout: [count][page_size][count x (start, end, file_offset)][names...],
// all words at target pointer width, names flat and NUL terminated.
fn parse_files(desc: &[u8], wide: bool) -> Result<Vec<FileRecord>> {
    let mut s = Stream::new(desc, 0, wide);
    let count = s.read_ulong()?;
    let page_size = s.read_ulong()?;

    let mut rows = Vec::new();
    for _ in 0..count {
        let start = s.read_ulong()?;
        let end = s.read_ulong()?;
        let offset = s.read_ulong()?;
        rows.push((start, end, offset));
    }

    let mut files = Vec::new();
    for (start, end, offset) in rows {
        let name = s.read_string()?;
        files.push(FileRecord {
            start,
            end,
            offset: offset * page_size,
            name,
        });
    }
    Ok(files)
}
