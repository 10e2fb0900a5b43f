mod art;
mod commands;
mod core;
mod logd;
mod repl;
mod utils;
use art::ArtState;
use clap::Parser;
use clap_repl::ClapEditor;
use clap_repl::reedline::{
    DefaultPrompt, FileBackedHistory, Highlighter, Prompt, PromptEditMode, PromptHistorySearch,
    StyledText,
};
use commands::Session;
use crate::core::Core;
use nu_ansi_term::{Color, Style};
use repl::InfoAction;
use repl::Repl;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process;

use crate::utils::warn;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// path to core file
    core: PathBuf,

    /// Android SDK level of the target, when detection can't find it
    #[arg(long)]
    sdk: Option<u32>,
}

/// The command words the dispatcher accepts (abbreviations of these work
/// too, since the parser infers subcommands).
const COMMANDS: &[&str] = &[
    "info", "exec", "sysroot", "sym", "dlsym", "nice", "hexdump", "logcat", "runtime", "quit",
];

/// Colors the line as it's typed: the leading command word goes blue when it
/// abbreviates a known command and red when it can't match anything, and
/// addresses and numbers are picked out so a mistyped hex digit is visible
/// before enter.
pub struct CommandHighlighter;

impl Highlighter for CommandHighlighter {
    fn highlight(&self, line: &str, _cursor: usize) -> StyledText {
        let mut styled = StyledText::new();
        let mut word = String::new();
        let mut first_word = true;

        for c in line.chars() {
            if c.is_whitespace() {
                if !word.is_empty() {
                    let style = word_style(&word, first_word);
                    styled.push((style, std::mem::take(&mut word)));
                    first_word = false;
                }
                styled.push((Style::new(), c.to_string()));
            } else {
                word.push(c);
            }
        }
        if !word.is_empty() {
            styled.push((word_style(&word, first_word), word));
        }
        styled
    }
}

fn word_style(word: &str, first_word: bool) -> Style {
    if first_word {
        return if COMMANDS.iter().any(|c| c.starts_with(word)) {
            Style::new().fg(Color::Blue)
        } else {
            Style::new().fg(Color::Red)
        };
    }
    if word.starts_with("0x") || word.chars().all(|c| c.is_ascii_digit()) {
        Style::new().fg(Color::Cyan)
    } else if word.starts_with('-') {
        Style::new().fg(Color::DarkGray)
    } else {
        Style::new()
    }
}

/// Prompt reflecting what was loaded: the core's file name, the detected SDK
/// when the ART layouts resolved, and a yellow tint when they didn't (so
/// it's obvious why the runtime commands will refuse to run).
pub struct SessionPrompt {
    label: String,
    art_ready: bool,
    default: DefaultPrompt,
}

impl SessionPrompt {
    fn new(session: &Session) -> SessionPrompt {
        let mut label = String::from("artdb");
        if let Some(name) = session.core.path.file_name().and_then(|n| n.to_str()) {
            label.push(':');
            label.push_str(name);
        }
        let art_ready = match session.art.layouts() {
            Ok(layouts) => {
                label.push_str(&format!(" sdk{}", layouts.sdk));
                true
            }
            Err(_) => false,
        };
        SessionPrompt {
            label,
            art_ready,
            default: DefaultPrompt::default(),
        }
    }
}

impl Prompt for SessionPrompt {
    fn render_prompt_left(&self) -> Cow<str> {
        Cow::Borrowed(&self.label)
    }

    fn render_prompt_right(&self) -> Cow<str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: PromptEditMode) -> Cow<str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<str> {
        self.default.render_prompt_multiline_indicator()
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<str> {
        self.default
            .render_prompt_history_search_indicator(history_search)
    }

    fn get_prompt_color(&self) -> clap_repl::reedline::Color {
        if self.art_ready {
            clap_repl::reedline::Color::DarkBlue
        } else {
            clap_repl::reedline::Color::DarkYellow
        }
    }

    fn get_indicator_color(&self) -> clap_repl::reedline::Color {
        self.get_prompt_color()
    }
}

fn load_session(path: PathBuf, sdk: Option<u32>) -> Session {
    let core = match Core::load(&path) {
        Ok(core) => core,
        Err(e) => {
            warn(&format!("Couldn't load {}: {e}", path.display()));
            std::process::exit(1);
        }
    };

    let mut art = ArtState::new();
    if let Some(sdk) = sdk.or_else(|| art::detect_sdk(&core)) {
        match art.init(core.machine.pointer_bits(), sdk) {
            Ok(()) => art.oat_prepare(&core),
            Err(e) => warn(&format!("ART layouts unavailable: {e}")),
        }
    }
    Session { core, art }
}

fn main() {
    utils::generate_style_file();

    let cli = Cli::parse();
    let mut session = load_session(cli.core, cli.sdk);

    let prompt = SessionPrompt::new(&session);
    let rl = ClapEditor::<Repl>::builder()
        .with_prompt(Box::new(prompt))
        .with_editor_hook(|reed| {
            reed.with_highlighter(Box::new(CommandHighlighter))
                .with_history(Box::new(
                    FileBackedHistory::with_file(10000, "/tmp/artdb-history".into()).unwrap(),
                ))
        })
        .build();

    use repl::MainCommand::*;
    rl.repl(move |repl: Repl| match repl.command {
        Info(info) => match info.action {
            InfoAction::Header(args) => commands::info_header(&session, &args),
            InfoAction::Loads(args) => commands::info_loads(&session, &args),
            InfoAction::Auxv(args) => commands::info_auxv(&session, &args),
            InfoAction::Mapped(args) => commands::info_mapped(&session, &args),
            InfoAction::Linkmap(args) => commands::info_linkmap(&session, &args),
            InfoAction::Threads(args) => commands::info_threads(&session, &args),
        },
        Exec(args) => commands::exec(&mut session, &args),
        Sysroot(args) => commands::sysroot(&mut session, &args),
        Sym(args) => commands::sym(&session, &args),
        Dlsym(args) => commands::dlsym(&session, &args),
        Nice(args) => commands::nice(&session, &args),
        Hexdump(args) => commands::hexdump(&session, &args),
        Logcat(args) => commands::logcat(&session, &args),
        Runtime => commands::runtime(&mut session),
        Quit => process::exit(0),
    });
}
