//! Android loads shared objects straight out of APKs when they're stored
//! uncompressed and page aligned. We do the same: the zip crate finds the
//! entry's data offset and the bytes are mmapped in place. Anything deflated
//! would need extraction first, which is out of scope here.
use crate::core::mapper::MappedFile;
use crate::core::{CoreError, Result};
use std::fs::File;
use std::path::Path;
use zip::{CompressionMethod, ZipArchive};

pub fn map_stored_entry(path: &Path, entry: &str) -> Result<MappedFile> {
    let file = File::open(path).map_err(|e| CoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| CoreError::InvalidElf {
        reason: format!("{} isn't a zip archive: {e}", path.display()),
    })?;

    // Paths out of NT_FILE look like "...apk!/lib/arm64-v8a/libfoo.so".
    let name = entry.trim_start_matches('/');
    let (offset, size) = {
        let zf = archive
            .by_name(name)
            .map_err(|_| CoreError::not_found(format!("zip entry {name}")))?;
        if zf.compression() != CompressionMethod::Stored {
            return Err(CoreError::unsupported("compressed zip"));
        }
        (zf.data_start(), zf.size())
    };

    MappedFile::map_slice(path, size, offset)
}
