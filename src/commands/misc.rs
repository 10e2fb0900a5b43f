use super::Session;
use crate::core::notes::AT_PHDR;
use crate::logd;
use crate::repl::{DlsymArgs, ExecArgs, HexdumpArgs, LogcatArgs, NiceArgs, SymArgs, SysrootArgs};
use crate::utils::Styling;
use crate::utils::print_styled;
use crate::utils::warn;

pub fn exec(session: &mut Session, args: &ExecArgs) {
    let Some(phdr) = session.core.find_auxv(AT_PHDR) else {
        warn("core has no AT_PHDR, can't place the executable");
        return;
    };
    match session.core.exec(phdr, &args.path) {
        Ok(()) => println!("bound {}", args.path.display()),
        Err(e) => warn(&format!("exec failed: {e}")),
    }
}

pub fn sysroot(session: &mut Session, args: &SysrootArgs) {
    match session
        .core
        .sysroot(&args.object, &args.path, args.entry.as_deref())
    {
        Ok(()) => println!("bound {} for {}", args.path.display(), args.object),
        Err(e) => warn(&format!("sysroot failed: {e}")),
    }
}

pub fn sym(session: &Session, args: &SymArgs) {
    match session.core.search_symbol(&args.name) {
        Ok(vaddr) => println!("0x{vaddr:x}"),
        Err(e) => println!("{e}"),
    }
}

pub fn dlsym(session: &Session, args: &DlsymArgs) {
    match session.core.dlsym(&args.path, &args.name) {
        Ok(value) => println!("0x{value:x}"),
        Err(e) => println!("{e}"),
    }
}

pub fn nice(session: &Session, args: &NiceArgs) {
    match session.core.nice_symbol(args.addr) {
        Ok((name, 0)) => println!("{name}"),
        Ok((name, offset)) => println!("{name}+0x{offset:x}"),
        Err(e) => println!("{e}"),
    }
}

pub fn hexdump(session: &Session, args: &HexdumpArgs) {
    let core = &session.core;
    let mut at = args.addr;
    let end = args.addr + args.count as u64;
    while at < end {
        let take = 16.min(end - at) as usize;
        let bytes = match core.space.read(at, take) {
            Ok(bytes) => bytes.into_owned(),
            Err(e) => {
                warn(&format!("{e}"));
                return;
            }
        };

        print_styled!("{:012x}: ", hex_offset, at);
        for byte in bytes.iter() {
            print_styled!("{:02x} ", hex_hex, byte);
        }
        print!("  ");
        for byte in bytes.iter() {
            let ch = *byte as char;
            if ch.is_ascii_graphic() {
                print_styled!("{ch}", hex_ascii);
            } else {
                print_styled!(".", hex_ascii);
            }
        }
        println!();
        at += take as u64;
    }
}

pub fn runtime(session: &mut Session) {
    let Session { core, art } = session;
    match art.runtime(core) {
        Ok(mem) => println!("art::Runtime at 0x{:x}", mem.vaddr()),
        Err(e) => println!("{e}"),
    }
}

/// Locate the logd buffers and report what's in them. Decoding the chunk
/// payloads is a separate concern; this shows where they live.
pub fn logcat(session: &Session, args: &LogcatArgs) {
    const NAMES: [&str; 8] = [
        "main", "radio", "events", "system", "crash", "stats", "security", "kernel",
    ];

    let core = &session.core;
    let layouts = match session.art.layouts() {
        Ok(layouts) => layouts,
        Err(e) => {
            warn(&format!("logcat: {e}"));
            return;
        }
    };
    let buffer = match logd::find_serialized_log_buffer(core, &session.art) {
        Ok(buffer) => buffer,
        Err(e) => {
            warn(&format!("logcat: {e}"));
            return;
        }
    };
    println!("SerializedLogBuffer at 0x{:x}", buffer.mem.vaddr());

    for id in 0..layouts.logd.log_id_max {
        if args.buffer.is_some_and(|want| want != id) {
            continue;
        }
        match buffer.chunks(core, &layouts.logd, id) {
            Ok(chunks) => println!(
                "--------- beginning of {}: {} chunk(s)",
                NAMES[id as usize], chunks.len()
            ),
            Err(e) => warn(&format!("buffer {id}: {e}")),
        }
    }
}
