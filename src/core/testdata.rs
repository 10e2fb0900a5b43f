//! Builders for synthetic core files and friends. Real cores are too big to
//! check in, so tests assemble just enough ELF by hand to exercise the code
//! under test.
use crate::core::arch::Machine;
use crate::core::elf::{ET_CORE, PT_LOAD, PT_NOTE};
use crate::core::mapper::MappedFile;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

/// Write bytes to a scratch file and hand back its path. Files are unique
/// per test run; nobody cleans them up because temp dirs are for that.
pub fn scratch_file(name: &str, bytes: &[u8]) -> PathBuf {
    let n = NEXT_FILE.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!("artdb-test-{name}-{}-{n}", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

pub fn map_bytes(name: &str, bytes: &[u8]) -> MappedFile {
    MappedFile::map(&scratch_file(name, bytes)).unwrap()
}

pub struct SegSpec {
    pub vaddr: u64,
    pub flags: u32,
    pub bytes: Vec<u8>,
    pub mem_size: u64,
}

/// Assembles a little-endian core image: ELF header, program headers, one
/// optional PT_NOTE, then the load segment bytes.
pub struct CoreBuilder {
    machine: Machine,
    loads: Vec<SegSpec>,
    notes: Vec<u8>,
}

impl CoreBuilder {
    pub fn new(machine: Machine) -> CoreBuilder {
        CoreBuilder {
            machine,
            loads: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn wide(&self) -> bool {
        self.machine.pointer_bits() == 64
    }

    pub fn load(mut self, vaddr: u64, flags: u32, bytes: &[u8]) -> Self {
        self.loads.push(SegSpec {
            vaddr,
            flags,
            bytes: bytes.to_vec(),
            mem_size: bytes.len() as u64,
        });
        self
    }

    /// A load block whose memory size exceeds its file size.
    pub fn load_sized(mut self, vaddr: u64, flags: u32, bytes: &[u8], mem_size: u64) -> Self {
        self.loads.push(SegSpec {
            vaddr,
            flags,
            bytes: bytes.to_vec(),
            mem_size,
        });
        self
    }

    pub fn note(mut self, ntype: u32, desc: &[u8]) -> Self {
        let name = b"CORE\0";
        push_u32(&mut self.notes, name.len() as u32);
        push_u32(&mut self.notes, desc.len() as u32);
        push_u32(&mut self.notes, ntype);
        self.notes.extend_from_slice(name);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self.notes.extend_from_slice(desc);
        while self.notes.len() % 4 != 0 {
            self.notes.push(0);
        }
        self
    }

    pub fn auxv(self, pairs: &[(u64, u64)]) -> Self {
        let wide = self.machine.pointer_bits() == 64;
        let mut desc = Vec::new();
        for (key, value) in pairs {
            push_addr(&mut desc, *key, wide);
            push_addr(&mut desc, *value, wide);
        }
        push_addr(&mut desc, 0, wide);
        push_addr(&mut desc, 0, wide);
        self.note(6, &desc) // NT_AUXV
    }

    pub fn prstatus(self, pid: i32, signal: i32, registers: &[u64]) -> Self {
        let wide = self.machine.pointer_bits() == 64;
        let mut desc = Vec::new();
        push_u32(&mut desc, signal as u32); // si_signo
        push_u32(&mut desc, 0); // si_code
        push_u32(&mut desc, 0); // si_errno
        push_u16(&mut desc, signal as u16); // pr_cursig
        push_u16(&mut desc, 0); // padding
        push_addr(&mut desc, 0, wide); // pr_sigpend
        push_addr(&mut desc, 0, wide); // pr_sighold
        push_u32(&mut desc, pid as u32);
        push_u32(&mut desc, 0); // ppid
        push_u32(&mut desc, 0); // pgrp
        push_u32(&mut desc, 0); // sid
        for _ in 0..8 {
            push_addr(&mut desc, 0, wide); // utime/stime/cutime/cstime
        }
        for reg in registers {
            push_addr(&mut desc, *reg, wide);
        }
        push_u32(&mut desc, 1); // pr_fpvalid
        self.note(1, &desc) // NT_PRSTATUS
    }

    pub fn file_map(self, page_size: u64, entries: &[(u64, u64, u64, &str)]) -> Self {
        let wide = self.machine.pointer_bits() == 64;
        let mut desc = Vec::new();
        push_addr(&mut desc, entries.len() as u64, wide);
        push_addr(&mut desc, page_size, wide);
        for (start, end, offset, _) in entries {
            push_addr(&mut desc, *start, wide);
            push_addr(&mut desc, *end, wide);
            push_addr(&mut desc, *offset, wide);
        }
        for (_, _, _, name) in entries {
            desc.extend_from_slice(name.as_bytes());
            desc.push(0);
        }
        self.note(0x46494c45, &desc) // NT_FILE
    }

    pub fn build(self) -> Vec<u8> {
        let wide = self.wide();
        let (ehsize, phsize) = if wide { (64, 56) } else { (52, 32) };
        let phnum = self.loads.len() + if self.notes.is_empty() { 0 } else { 1 };
        let mut image = Vec::new();

        // e_ident
        image.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        image.push(if wide { 2 } else { 1 });
        image.push(1); // little endian
        image.push(1); // version
        image.extend_from_slice(&[0; 9]);
        push_u16(&mut image, ET_CORE);
        push_u16(&mut image, self.machine.elf_machine());
        push_u32(&mut image, 1); // version
        push_addr(&mut image, 0, wide); // entry
        push_addr(&mut image, ehsize as u64, wide); // phoff
        push_addr(&mut image, 0, wide); // shoff
        push_u32(&mut image, 0); // flags
        push_u16(&mut image, ehsize as u16);
        push_u16(&mut image, phsize as u16);
        push_u16(&mut image, phnum as u16);
        push_u16(&mut image, 0); // shentsize
        push_u16(&mut image, 0); // shnum
        push_u16(&mut image, 0); // shstrndx

        let mut offset = (ehsize + phnum * phsize) as u64;
        if !self.notes.is_empty() {
            push_phdr(&mut image, wide, PT_NOTE, 0, offset, 0, self.notes.len() as u64, 0);
            offset += self.notes.len() as u64;
        }
        for seg in &self.loads {
            push_phdr(
                &mut image,
                wide,
                PT_LOAD,
                seg.flags,
                offset,
                seg.vaddr,
                seg.bytes.len() as u64,
                seg.mem_size,
            );
            offset += seg.bytes.len() as u64;
        }

        image.extend_from_slice(&self.notes);
        for seg in &self.loads {
            image.extend_from_slice(&seg.bytes);
        }
        image
    }

    pub fn write(self, name: &str) -> PathBuf {
        let bytes = self.build();
        scratch_file(name, &bytes)
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_addr(out: &mut Vec<u8>, value: u64, wide: bool) {
    if wide {
        push_u64(out, value);
    } else {
        push_u32(out, value as u32);
    }
}

#[allow(clippy::too_many_arguments)]
fn push_phdr(
    out: &mut Vec<u8>,
    wide: bool,
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
) {
    let mem_size = mem_size.max(file_size);
    if wide {
        push_u32(out, ptype);
        push_u32(out, flags);
        push_u64(out, offset);
        push_u64(out, vaddr);
        push_u64(out, vaddr); // paddr
        push_u64(out, file_size);
        push_u64(out, mem_size);
        push_u64(out, 0x1000); // align
    } else {
        push_u32(out, ptype);
        push_u32(out, offset as u32);
        push_u32(out, vaddr as u32);
        push_u32(out, vaddr as u32);
        push_u32(out, file_size as u32);
        push_u32(out, mem_size as u32);
        push_u32(out, flags);
        push_u32(out, 0x1000);
    }
}

/// Builds a minimal ZIP with a single entry, stored or deflated. Only the
/// records the central-directory reader looks at are filled in.
pub fn zip_with_entry(name: &str, entry_name: &str, data: &[u8], stored: bool) -> PathBuf {
    let method: u16 = if stored { 0 } else { 8 };
    let crc = crc32(data);
    let mut zip = Vec::new();

    // local file header
    let local_offset = zip.len() as u32;
    push_u32(&mut zip, 0x04034b50);
    push_u16(&mut zip, 20); // version needed
    push_u16(&mut zip, 0); // flags
    push_u16(&mut zip, method);
    push_u16(&mut zip, 0); // mod time
    push_u16(&mut zip, 0); // mod date
    push_u32(&mut zip, crc);
    push_u32(&mut zip, data.len() as u32); // compressed (lying for deflate is fine here)
    push_u32(&mut zip, data.len() as u32); // uncompressed
    push_u16(&mut zip, entry_name.len() as u16);
    push_u16(&mut zip, 0); // extra len
    zip.extend_from_slice(entry_name.as_bytes());
    zip.extend_from_slice(data);

    // central directory
    let cd_offset = zip.len() as u32;
    push_u32(&mut zip, 0x02014b50);
    push_u16(&mut zip, 20); // version made by
    push_u16(&mut zip, 20); // version needed
    push_u16(&mut zip, 0); // flags
    push_u16(&mut zip, method);
    push_u16(&mut zip, 0); // mod time
    push_u16(&mut zip, 0); // mod date
    push_u32(&mut zip, crc);
    push_u32(&mut zip, data.len() as u32);
    push_u32(&mut zip, data.len() as u32);
    push_u16(&mut zip, entry_name.len() as u16);
    push_u16(&mut zip, 0); // extra len
    push_u16(&mut zip, 0); // comment len
    push_u16(&mut zip, 0); // disk number
    push_u16(&mut zip, 0); // internal attrs
    push_u32(&mut zip, 0); // external attrs
    push_u32(&mut zip, local_offset);
    zip.extend_from_slice(entry_name.as_bytes());
    let cd_size = zip.len() as u32 - cd_offset;

    // end of central directory
    push_u32(&mut zip, 0x06054b50);
    push_u16(&mut zip, 0); // disk number
    push_u16(&mut zip, 0); // cd disk
    push_u16(&mut zip, 1); // entries on disk
    push_u16(&mut zip, 1); // entries total
    push_u32(&mut zip, cd_size);
    push_u32(&mut zip, cd_offset);
    push_u16(&mut zip, 0); // comment len

    scratch_file(name, &zip)
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB88320 & mask);
        }
    }
    !crc
}
