//! Definitions for the commands that are used interactively, e.g.
//! `info loads` and `logcat`.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(infer_subcommands(true))] // allow abreviations
pub struct Repl {
    #[command(subcommand)]
    pub command: MainCommand,
}

#[derive(Subcommand)]
pub enum MainCommand {
    /// Show various forms of information
    Info(InfoCommand),

    /// Bind the on-disk executable's bytes into the address space
    Exec(ExecArgs),

    /// Bind an on-disk shared object's bytes into the address space
    Sysroot(SysrootArgs),

    /// Look up a symbol by name across the loaded objects
    Sym(SymArgs),

    /// Look up a symbol in a file on disk
    Dlsym(DlsymArgs),

    /// Render an address as symbol+offset
    Nice(NiceArgs),

    /// Print memory range as hex and ascii
    Hexdump(HexdumpArgs),

    /// Find the logd buffers serialized in memory
    Logcat(LogcatArgs),

    /// Locate the ART Runtime singleton
    Runtime,

    /// Exit artdb
    Quit,
}

#[derive(Args)]
pub struct InfoCommand {
    #[clap(subcommand)]
    pub action: InfoAction,
}

#[derive(Subcommand)]
pub enum InfoAction {
    /// Show core file header
    Header(ExplainArgs),

    /// Show load blocks
    Loads(TableArgs),

    /// Show the auxiliary vector
    Auxv(TableArgs),

    /// Show memory mapped files
    Mapped(TableArgs),

    /// Show the dynamic linker's object list
    Linkmap(TableArgs),

    /// Show the threads found in the core
    Threads(TableArgs),
}

#[derive(Args)]
pub struct ExplainArgs {
    /// Explain columns, fields, etc.
    #[arg(short, long)]
    pub explain: bool,
}

#[derive(Args)]
pub struct TableArgs {
    /// Explain columns, fields, etc.
    #[arg(short, long)]
    pub explain: bool,

    /// Add column headers
    #[arg(short, long)]
    pub titles: bool,
}

#[derive(Args)]
pub struct ExecArgs {
    /// Path to the executable the core was produced from
    pub path: PathBuf,
}

#[derive(Args)]
pub struct SysrootArgs {
    /// Name (or name suffix) of the object in the link map
    pub object: String,

    /// Path to the file on disk
    pub path: PathBuf,

    /// Entry inside the file when it's an APK, e.g. lib/arm64-v8a/libfoo.so
    #[arg(long)]
    pub entry: Option<String>,
}

#[derive(Args)]
pub struct SymArgs {
    /// Symbol name, mangled
    pub name: String,
}

#[derive(Args)]
pub struct DlsymArgs {
    /// Path to the executable or shared object
    pub path: PathBuf,

    /// Symbol name, mangled
    pub name: String,
}

#[derive(Args)]
pub struct NiceArgs {
    /// Address to symbolize
    #[arg(value_parser = parse_u64_expr)]
    pub addr: u64,
}

#[derive(Args)]
pub struct HexdumpArgs {
    /// Address at which to start dumping
    #[arg(value_parser = parse_u64_expr)]
    pub addr: u64,

    /// Number of bytes to dump
    #[arg(short, long)]
    #[arg(default_value_t = 64)]
    pub count: usize,
}

#[derive(Args)]
pub struct LogcatArgs {
    /// Only this buffer id (0 = main, 4 = crash)
    #[arg(short, long)]
    pub buffer: Option<u64>,
}

fn parse_u64_expr(s: &str) -> Result<u64, String> {
    if s.starts_with("0x") {
        let t = s.trim_start_matches("0x");
        u64::from_str_radix(t, 16).map_err(|_| format!("`{s}` isn't a hex or decimal number"))
    } else {
        s.parse()
            .map_err(|_| format!("`{s}` isn't a hex or decimal number"))
    }
}
