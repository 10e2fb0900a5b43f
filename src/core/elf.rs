//! Generic ELF parsing shared by the core loader and the on-disk object
//! support. Field sizes and order differ between 32-bit and 64-bit files,
//! see https://llvm.org/doxygen/BinaryFormat_2ELF_8h_source.html.
use crate::core::io::Stream;
use crate::core::mapper::MappedFile;
use crate::core::{CoreError, Result};
use crate::utils;
use std::rc::Rc;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

pub const DT_NULL: u64 = 0;
pub const DT_STRTAB: u64 = 5;
pub const DT_SYMTAB: u64 = 6;
pub const DT_SYMENT: u64 = 11;
pub const DT_DEBUG: u64 = 21;
pub const DT_VERSYM: u64 = 0x6fff_fff0;

pub const STT_NOTYPE: u8 = 0;
pub const STT_FUNC: u8 = 2;

pub struct Ehdr {
    pub bits: u32,
    pub etype: u16,
    pub machine: u16,
    pub entry: u64,
    pub ph_offset: u64,
    pub sh_offset: u64,
    pub ph_entry_size: u16,
    pub num_ph_entries: u16,
    pub sh_entry_size: u16,
    pub num_sh_entries: u16,
    pub sh_string_index: u16,
}

impl Ehdr {
    pub fn new(bytes: &[u8]) -> Result<Ehdr> {
        utils::require(bytes.len() >= 52, "file is much too small")?;
        utils::require(
            bytes[0] == 0x7f && bytes[1] == b'E' && bytes[2] == b'L' && bytes[3] == b'F',
            "not an ELF file (bad magic)",
        )?;
        let ei_class = bytes[4];
        let ei_data = bytes[5];
        let ei_version = bytes[6];
        utils::require(ei_class == 1 || ei_class == 2, "bad ELF class")?;
        utils::require(ei_data == 1, "big-endian files aren't supported")?;
        utils::require(ei_version == 1, "bad ELF version")?;

        let wide = ei_class == 2;
        let mut s = Stream::new(bytes, 16, wide);
        let etype = s.read_half()?;
        let machine = s.read_half()?;
        let _version = s.read_word()?;
        let entry = s.read_addr()?;
        let ph_offset = s.read_addr()?;
        let sh_offset = s.read_addr()?;
        let _flags = s.read_word()?;
        let _ehsize = s.read_half()?;
        let ph_entry_size = s.read_half()?;
        let num_ph_entries = s.read_half()?;
        let sh_entry_size = s.read_half()?;
        let num_sh_entries = s.read_half()?;
        let sh_string_index = s.read_half()?;

        Ok(Ehdr {
            bits: if wide { 64 } else { 32 },
            etype,
            machine,
            entry,
            ph_offset,
            sh_offset,
            ph_entry_size,
            num_ph_entries,
            sh_entry_size,
            num_sh_entries,
            sh_string_index,
        })
    }

    pub fn wide(&self) -> bool {
        self.bits == 64
    }
}

pub struct Phdr {
    pub ptype: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl Phdr {
    pub fn new(bytes: &[u8], offset: usize, wide: bool) -> Result<Phdr> {
        let mut s = Stream::new(bytes, offset, wide);
        if wide {
            let p_type = s.read_word()?;
            let p_flags = s.read_word()?;
            let p_offset = s.read_xword()?;
            let p_vaddr = s.read_xword()?;
            let p_paddr = s.read_xword()?;
            let p_filesz = s.read_xword()?;
            let p_memsz = s.read_xword()?;
            let p_align = s.read_xword()?;
            Ok(Phdr {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                align: p_align,
            })
        } else {
            let p_type = s.read_word()?;
            let p_offset = s.read_word()? as u64;
            let p_vaddr = s.read_word()? as u64;
            let p_paddr = s.read_word()? as u64;
            let p_filesz = s.read_word()? as u64;
            let p_memsz = s.read_word()? as u64;
            let p_flags = s.read_word()?;
            let p_align = s.read_word()? as u64;
            Ok(Phdr {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                align: p_align,
            })
        }
    }

    /// Sizes of an on-disk program header, by class.
    pub fn size_of(wide: bool) -> usize {
        if wide { 56 } else { 32 }
    }

    pub fn flags_str(flags: u32) -> String {
        let mut result = String::new();
        result.push(if flags & PF_X != 0 { 'x' } else { '-' });
        result.push(if flags & PF_W != 0 { 'w' } else { '-' });
        result.push(if flags & PF_R != 0 { 'r' } else { '-' });
        result
    }
}

pub fn parse_phdrs(bytes: &[u8], ehdr: &Ehdr) -> Vec<Phdr> {
    let mut phdrs = Vec::new();
    let mut offset = ehdr.ph_offset as usize;

    // Even a large core file has a small number of program headers, so it's
    // fine to re-iterate over these whenever a caller wants them.
    for _ in 0..ehdr.num_ph_entries {
        match Phdr::new(bytes, offset, ehdr.wide()) {
            Ok(ph) => phdrs.push(ph),
            Err(err) => {
                utils::warn(&format!("failed to read program header at {offset}: {err}"));
            }
        }
        offset += ehdr.ph_entry_size as usize;
    }
    phdrs
}

pub struct Shdr {
    pub name: u32,
    pub stype: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub entry_size: u64,
}

impl Shdr {
    fn new(bytes: &[u8], offset: usize, wide: bool) -> Result<Shdr> {
        let mut s = Stream::new(bytes, offset, wide);
        let name = s.read_word()?;
        let stype = s.read_word()?;
        let _flags = s.read_addr()?;
        let addr = s.read_addr()?;
        let sh_offset = s.read_addr()?;
        let size = s.read_addr()?;
        let _link = s.read_word()?;
        let _info = s.read_word()?;
        let _addralign = s.read_addr()?;
        let entry_size = s.read_addr()?;
        Ok(Shdr {
            name,
            stype,
            addr,
            offset: sh_offset,
            size,
            entry_size,
        })
    }
}

pub struct Sym {
    pub name: u32,
    pub value: u64,
    pub size: u64,
    pub info: u8,
}

impl Sym {
    pub fn new(bytes: &[u8], offset: usize, wide: bool) -> Result<Sym> {
        let mut s = Stream::new(bytes, offset, wide);
        if wide {
            let name = s.read_word()?;
            let info = s.read_byte()?;
            let _other = s.read_byte()?;
            let _shndx = s.read_half()?;
            let value = s.read_xword()?;
            let size = s.read_xword()?;
            Ok(Sym {
                name,
                value,
                size,
                info,
            })
        } else {
            let name = s.read_word()?;
            let value = s.read_word()? as u64;
            let size = s.read_word()? as u64;
            let info = s.read_byte()?;
            let _other = s.read_byte()?;
            let _shndx = s.read_half()?;
            Ok(Sym {
                name,
                value,
                size,
                info,
            })
        }
    }

    pub fn size_of(wide: bool) -> usize {
        if wide { 24 } else { 16 }
    }

    pub fn stype(&self) -> u8 {
        self.info & 0xf
    }
}

/// An executable or shared object mapped from disk, used to re-back core
/// load blocks and to look up symbols the core itself doesn't carry.
pub struct ElfImage {
    pub map: Rc<MappedFile>,
    pub ehdr: Ehdr,
}

impl ElfImage {
    pub fn open(map: MappedFile) -> Result<ElfImage> {
        let ehdr = Ehdr::new(map.data())?;
        Ok(ElfImage {
            map: Rc::new(map),
            ehdr,
        })
    }

    pub fn phdrs(&self) -> Vec<Phdr> {
        parse_phdrs(self.map.data(), &self.ehdr)
    }

    fn section_by_name(&self, want: &str) -> Option<Shdr> {
        let bytes = self.map.data();
        let wide = self.ehdr.wide();
        let entry = self.ehdr.sh_entry_size as usize;
        let strtab = Shdr::new(
            bytes,
            self.ehdr.sh_offset as usize + self.ehdr.sh_string_index as usize * entry,
            wide,
        )
        .ok()?;

        for i in 0..self.ehdr.num_sh_entries as usize {
            let shdr = match Shdr::new(bytes, self.ehdr.sh_offset as usize + i * entry, wide) {
                Ok(shdr) => shdr,
                Err(_) => continue,
            };
            let name_at = strtab.offset as usize + shdr.name as usize;
            let mut s = Stream::new(bytes, name_at, wide);
            if let Ok(name) = s.read_string()
                && name == want
            {
                return Some(shdr);
            }
        }
        None
    }

    /// Scan `.dynsym` then `.symtab` for an exact name match and return its
    /// `st_value`. This is how symbols are found in files supplied from a
    /// sysroot; symbols inside the target go through the link map, which
    /// needs no section headers.
    pub fn lookup_symbol(&self, symbol: &str) -> Result<u64> {
        for (symtab, strtab) in [(".dynsym", ".dynstr"), (".symtab", ".strtab")] {
            let Some(syms) = self.section_by_name(symtab) else {
                continue;
            };
            let Some(strs) = self.section_by_name(strtab) else {
                continue;
            };
            if syms.entry_size == 0 {
                continue;
            }

            let bytes = self.map.data();
            let count = syms.size / syms.entry_size;
            for i in 0..count {
                let offset = syms.offset as usize + (i * syms.entry_size) as usize;
                let Ok(sym) = Sym::new(bytes, offset, self.ehdr.wide()) else {
                    break;
                };
                let name_at = strs.offset as usize + sym.name as usize;
                let mut s = Stream::new(bytes, name_at, self.ehdr.wide());
                if let Ok(name) = s.read_string()
                    && name == symbol
                {
                    return Ok(sym.value);
                }
            }
        }
        Err(CoreError::not_found(format!("symbol {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testdata;

    fn push(v: &mut Vec<u8>, bytes: &[u8]) {
        v.extend_from_slice(bytes);
    }

    fn shdr(image: &mut Vec<u8>, name: u32, stype: u32, offset: u64, size: u64, entsize: u64) {
        push(image, &name.to_le_bytes());
        push(image, &stype.to_le_bytes());
        testdata::push_addr(image, 0, true); // flags
        testdata::push_addr(image, 0, true); // addr
        testdata::push_addr(image, offset, true);
        testdata::push_addr(image, size, true);
        push(image, &0u32.to_le_bytes()); // link
        push(image, &0u32.to_le_bytes()); // info
        testdata::push_addr(image, 0, true); // addralign
        testdata::push_addr(image, entsize, true);
    }

    // An ET_DYN with just enough sections to exercise the symbol scan:
    // .dynsym with one real symbol, .dynstr, and .shstrtab.
    fn image_with_dynsym() -> Vec<u8> {
        let mut image = Vec::new();
        push(&mut image, &[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        push(&mut image, &[0; 9]);
        push(&mut image, &ET_DYN.to_le_bytes());
        push(&mut image, &62u16.to_le_bytes()); // EM_X86_64
        push(&mut image, &1u32.to_le_bytes());
        testdata::push_addr(&mut image, 0, true); // entry
        testdata::push_addr(&mut image, 0, true); // phoff
        testdata::push_addr(&mut image, 0x200, true); // shoff
        push(&mut image, &0u32.to_le_bytes()); // flags
        for v in [64u16, 56, 0, 64, 4, 3] {
            // ehsize, phentsize, phnum, shentsize, shnum, shstrndx
            push(&mut image, &v.to_le_bytes());
        }

        image.resize(0x200, 0);
        shdr(&mut image, 0, 0, 0, 0, 0); // null section
        shdr(&mut image, 1, 11, 0x440, 48, 24); // .dynsym
        shdr(&mut image, 9, 3, 0x480, 5, 0); // .dynstr
        shdr(&mut image, 17, 3, 0x400, 26, 0); // .shstrtab

        image.resize(0x41a, 0);
        image[0x400..0x41a].copy_from_slice(b"\0.dynsym\0.dynstr\0.shstrtab");

        image.resize(0x440, 0);
        image.resize(0x458, 0); // null symbol
        push(&mut image, &1u32.to_le_bytes()); // st_name -> "foo"
        push(&mut image, &[0x12, 0]); // FUNC, default visibility
        push(&mut image, &1u16.to_le_bytes()); // shndx
        testdata::push_addr(&mut image, 0x1234, true); // value
        testdata::push_addr(&mut image, 0x10, true); // size

        image.resize(0x480, 0);
        image.extend_from_slice(b"\0foo\0");
        image
    }

    #[test]
    fn disk_symbol_lookup() {
        let path = testdata::scratch_file("dynsym-image", &image_with_dynsym());
        let image = ElfImage::open(crate::core::MappedFile::map(&path).unwrap()).unwrap();
        assert_eq!(image.lookup_symbol("foo").unwrap(), 0x1234);
        assert!(matches!(
            image.lookup_symbol("bar"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let path = testdata::scratch_file("bad-magic", &[0u8; 128]);
        match ElfImage::open(crate::core::MappedFile::map(&path).unwrap()) {
            Err(CoreError::InvalidElf { reason }) => assert!(reason.contains("magic")),
            _ => panic!("expected InvalidElf"),
        }
    }

    #[test]
    fn phdr_classes() {
        // The same logical header serialized for both classes.
        let mut wide = Vec::new();
        push(&mut wide, &PT_LOAD.to_le_bytes());
        push(&mut wide, &(PF_R | PF_X).to_le_bytes());
        for v in [0x1000u64, 0x40_0000, 0x40_0000, 0x800, 0x1000, 0x1000] {
            push(&mut wide, &v.to_le_bytes());
        }
        let ph = Phdr::new(&wide, 0, true).unwrap();
        assert_eq!(ph.vaddr, 0x40_0000);
        assert_eq!(ph.file_size, 0x800);
        assert_eq!(ph.mem_size, 0x1000);

        let mut narrow = Vec::new();
        push(&mut narrow, &PT_LOAD.to_le_bytes());
        for v in [0x1000u32, 0x8000, 0x8000, 0x800, 0x1000] {
            push(&mut narrow, &v.to_le_bytes());
        }
        push(&mut narrow, &(PF_R | PF_W).to_le_bytes());
        push(&mut narrow, &0x1000u32.to_le_bytes());
        let ph = Phdr::new(&narrow, 0, false).unwrap();
        assert_eq!(ph.vaddr, 0x8000);
        assert_eq!(ph.flags, PF_R | PF_W);
        assert_eq!(Phdr::flags_str(ph.flags), "-wr");
    }
}
