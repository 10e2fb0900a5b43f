use super::Session;
use super::tables::{TableBuilder, add_field, kv_table};
use crate::core::notes;
use crate::repl::{ExplainArgs, TableArgs};
use crate::utils::Styling;
use std::io;

pub fn info_header(session: &Session, args: &ExplainArgs) {
    let core = &session.core;
    let art = match session.art.layouts() {
        Ok(layouts) => format!("SDK {} (OAT {})", layouts.sdk, layouts.oat_version),
        Err(_) => "not detected".to_string(),
    };
    kv_table(
        io::stdout(),
        &[
            (
                "file",
                core.path.display().to_string(),
                "path to the core that was loaded",
            ),
            ("machine", core.machine.name().to_string(), "CPU architecture"),
            (
                "bits",
                core.machine.pointer_bits().to_string(),
                "target pointer width",
            ),
            (
                "vabits",
                format!("{:x}", core.space.vabits_mask()),
                "mask of meaningful virtual address bits",
            ),
            (
                "blocks",
                core.space.len().to_string(),
                "number of load blocks in the address space",
            ),
            (
                "threads",
                core.threads.len().to_string(),
                "NT_PRSTATUS records found",
            ),
            ("art", art, "detected Android runtime version"),
        ],
        args.explain,
    );
}

pub fn info_loads(session: &Session, args: &TableArgs) {
    let mut builder = TableBuilder::new();
    builder.add_col_l("flags", "readable, writeable, and/or executable");
    builder.add_col_r("offset", "offset into the core file at which the block's bytes start");
    builder.add_col_r("vaddr", "the virtual address of the first byte in the block");
    builder.add_col_r("file size", "bytes present in the core (hex)");
    builder.add_col_r("mem size", "bytes the block occupied in memory (hex)");
    builder.add_col_l("backing", "replacement file, if one was bound with exec/sysroot");

    session.core.foreach_load_block(|_, block| {
        add_field!(builder, "flags", block.flags_str());
        add_field!(builder, "offset", "{:x}", block.offset);
        add_field!(builder, "vaddr", "{:x}", block.vaddr);
        add_field!(builder, "file size", "{:x}", block.file_size);
        add_field!(builder, "mem size", "{:x}", block.mem_size);
        let backing = match block.replacement() {
            Some(path) => path.display().to_string(),
            None if block.truncated => "(truncated)".to_string(),
            None => String::new(),
        };
        add_field!(builder, "backing", backing);
        crate::core::Walk::Continue
    });

    builder.writeln(io::stdout(), args.titles, args.explain);
}

pub fn info_auxv(session: &Session, args: &TableArgs) {
    if session.core.auxv.is_empty() {
        println!("No auxv note found.");
        return;
    }

    let mut builder = TableBuilder::new();
    builder.add_col_l("key", "auxiliary vector entry name");
    builder.add_col_r("value", "entry value (hex)");
    for (key, value) in session.core.auxv.iter() {
        add_field!(builder, "key", auxv_name(*key));
        add_field!(builder, "value", "{:x}", value);
    }
    builder.writeln(io::stdout(), args.titles, args.explain);
}

pub fn info_mapped(session: &Session, args: &TableArgs) {
    if session.core.files.is_empty() {
        println!("No memory mapped files found.");
        return;
    }

    let mut builder = TableBuilder::new();
    builder.add_col_r(
        "start",
        "the virtual address for the first byte the file is mapped into",
    );
    builder.add_col_r(
        "end",
        "the virtual address after the last byte the file is mapped into",
    );
    builder.add_col_r("offset", "byte offset into the file");
    builder.add_col_l("file name", "path to the file");

    for file in session.core.files.iter() {
        add_field!(builder, "start", "{:x}", file.start);
        add_field!(builder, "end", "{:x}", file.end);
        add_field!(builder, "offset", "{:x}", file.offset);
        add_field!(builder, "file name", file.name);
    }
    builder.writeln(io::stdout(), args.titles, args.explain);
}

pub fn info_linkmap(session: &Session, args: &TableArgs) {
    if session.core.link_maps.is_empty() {
        println!("No link map entries (try the exec command).");
        return;
    }

    let mut builder = TableBuilder::new();
    builder.add_col_r("base", "the address the object was loaded at");
    builder.add_col_r("dynamic", "the object's PT_DYNAMIC, when recorded");
    builder.add_col_l("name", "the object's path as the linker saw it");

    for entry in session.core.link_maps.iter() {
        add_field!(builder, "base", "{:x}", entry.l_addr);
        add_field!(builder, "dynamic", "{:x}", entry.l_ld);
        add_field!(builder, "name", entry.name);
    }
    builder.writeln(io::stdout(), args.titles, args.explain);
}

pub fn info_threads(session: &Session, args: &TableArgs) {
    if session.core.threads.is_empty() {
        println!("No prstatus notes found.");
        return;
    }

    let mut builder = TableBuilder::new();
    builder.add_col_r("pid", "the thread id");
    builder.add_col_r("signal", "the signal the thread stopped with");
    builder.add_col_r("registers", "number of general purpose registers captured");

    for thread in session.core.threads.iter() {
        add_field!(builder, "pid", thread.pid);
        add_field!(builder, "signal", thread.signal);
        add_field!(builder, "registers", thread.registers.len());
    }
    builder.writeln(io::stdout(), args.titles, args.explain);
}

fn auxv_name(key: u64) -> String {
    match key {
        notes::AT_PHDR => "AT_PHDR".to_string(),
        notes::AT_PHENT => "AT_PHENT".to_string(),
        notes::AT_PHNUM => "AT_PHNUM".to_string(),
        notes::AT_ENTRY => "AT_ENTRY".to_string(),
        notes::AT_EXECFN => "AT_EXECFN".to_string(),
        notes::AT_SYSINFO_EHDR => "AT_SYSINFO_EHDR".to_string(),
        7 => "AT_BASE".to_string(),
        6 => "AT_PAGESZ".to_string(),
        11 => "AT_UID".to_string(),
        12 => "AT_EUID".to_string(),
        13 => "AT_GID".to_string(),
        14 => "AT_EGID".to_string(),
        16 => "AT_HWCAP".to_string(),
        17 => "AT_CLKTCK".to_string(),
        23 => "AT_SECURE".to_string(),
        25 => "AT_RANDOM".to_string(),
        26 => "AT_HWCAP2".to_string(),
        _ => format!("AT_{key}"),
    }
}
