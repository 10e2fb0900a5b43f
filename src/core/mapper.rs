//! Read-only byte windows onto files on disk. Everything the analyzer reads
//! (the core itself, replacement executables and shared objects, APK entries)
//! comes through here.
use crate::core::{CoreError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct MappedFile {
    pub path: PathBuf,
    map: Mmap,
    /// Offset of the window within the file, when this is a slice.
    offset: u64,
    /// Bytes to skip at the front of the mmap because the requested offset
    /// wasn't page aligned.
    skip: usize,
}

impl MappedFile {
    /// Map an entire file.
    pub fn map(path: &Path) -> Result<MappedFile> {
        let file = open(path)?;
        // This is unsafe because it has undefined behavior if the underlying
        // file is modified while the memory map is in use.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| io_err(path, e))?;
        Ok(MappedFile {
            path: path.to_path_buf(),
            map,
            offset: 0,
            skip: 0,
        })
    }

    /// Map `length` bytes starting at `offset`. The offset doesn't have to be
    /// page aligned; the window is adjusted internally.
    pub fn map_slice(path: &Path, length: u64, offset: u64) -> Result<MappedFile> {
        let file = open(path)?;
        let page = offset & !0xFFF;
        let skip = (offset - page) as usize;
        let map = unsafe {
            MmapOptions::new()
                .offset(page)
                .len(length as usize + skip)
                .map(&file)
        }
        .map_err(|e| io_err(path, e))?;
        Ok(MappedFile {
            path: path.to_path_buf(),
            map,
            offset,
            skip,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.map[self.skip..]
    }

    pub fn len(&self) -> usize {
        self.map.len() - self.skip
    }

    /// Offset of the first byte of `data()` within the underlying file.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| io_err(path, e))
}

fn io_err(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
