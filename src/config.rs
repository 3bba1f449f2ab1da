//! Typed configuration handed to the runtime by the config store.

use crate::keys::{default_sequences, KeySequence, DEVICE_KEYS, DEVICE_KEY_COUNT};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Most layouts a program can have; the keypad has three indicator lights.
pub const MAX_LAYOUTS: usize = 7;

/// Backlight level while a configured program is active
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Brightness {
    Off,
    #[default]
    Low,
    Med,
    High,
}

impl Brightness {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Brightness::Off),
            "low" => Some(Brightness::Low),
            "med" | "medium" => Some(Brightness::Med),
            "high" => Some(Brightness::High),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Brightness::Off => "off",
            Brightness::Low => "low",
            Brightness::Med => "med",
            Brightness::High => "high",
        }
    }
}

/// Chords for an external window-system binding layer. Not interpreted here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hotkeys {
    pub launch: Option<String>,
    pub next: Option<String>,
    pub prev: Option<String>,
}

/// One complete assignment of sequences to every physical key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub id: u32,
    pub keys: [KeySequence; DEVICE_KEY_COUNT],
}

impl Layout {
    /// A layout where every key sends its own default code.
    pub fn with_defaults(id: u32) -> Self {
        Self { id, keys: default_sequences() }
    }
}

/// Executable path pattern. Absolute patterns must match exactly, relative
/// ones anywhere in the resolved path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExePattern {
    Absolute(String),
    Relative(String),
}

impl ExePattern {
    pub fn new(pattern: &str) -> Self {
        if pattern.starts_with('/') {
            ExePattern::Absolute(pattern.to_string())
        } else {
            ExePattern::Relative(pattern.to_string())
        }
    }

    pub fn matches(&self, exe: &str) -> bool {
        match self {
            ExePattern::Absolute(p) => exe == p,
            ExePattern::Relative(p) => exe.contains(p.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub name: String,
    pub priority: i32,
    pub cmds: Vec<String>,
    pub exes: Vec<ExePattern>,
    /// Sorted by id, never empty, at most `MAX_LAYOUTS`
    pub layouts: Vec<Layout>,
}

impl Program {
    /// Whether a process with this command line and executable belongs to
    /// the program. Command patterns are tested before executable patterns.
    pub fn matches(&self, cmdline: Option<&str>, exe: Option<&str>) -> bool {
        if let Some(cmdline) = cmdline {
            if self.cmds.iter().any(|p| cmdline.contains(p.as_str())) {
                return true;
            }
        }
        match exe {
            Some(exe) => self.exes.iter().any(|p| p.matches(exe)),
            None => false,
        }
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.len()
    }
}

/// A complete config snapshot. Rebuilt from disk on every reload.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub dir: PathBuf,
    pub brightness: Brightness,
    pub pulse: bool,
    pub hotkeys: Hotkeys,
    /// In match priority order
    pub programs: Vec<Program>,
}

impl Config {
    pub fn program(&self, index: usize) -> Option<&Program> {
        self.programs.get(index)
    }

    /// Human-readable dump of everything that was parsed.
    pub fn dump(&self) -> String {
        const INDENT: &str = "    ";
        let mut out = String::new();
        let hotkey = |k: &Option<String>| k.clone().unwrap_or_else(|| "(unset)".into());

        let _ = writeln!(out, "config dir: {}", self.dir.display());
        let _ = writeln!(out, "pulse: {}", self.pulse);
        let _ = writeln!(out, "brightness: {}", self.brightness.name());
        let _ = writeln!(
            out,
            "hotkeys: launch={} next={} prev={}",
            hotkey(&self.hotkeys.launch),
            hotkey(&self.hotkeys.next),
            hotkey(&self.hotkeys.prev)
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "programs ({}):", self.programs.len());

        for prog in &self.programs {
            let _ = writeln!(
                out,
                "{INDENT}{} (priority: {}, layouts: {}):",
                prog.name,
                prog.priority,
                prog.layouts.len()
            );
            let _ = writeln!(out, "{INDENT}{INDENT}cmds ({}):", prog.cmds.len());
            for cmd in &prog.cmds {
                let _ = writeln!(out, "{INDENT}{INDENT}{INDENT}{cmd}");
            }
            let _ = writeln!(out, "{INDENT}{INDENT}exes ({}):", prog.exes.len());
            for exe in &prog.exes {
                let (kind, pattern) = match exe {
                    ExePattern::Absolute(p) => ("abs", p),
                    ExePattern::Relative(p) => ("rel", p),
                };
                let _ = writeln!(out, "{INDENT}{INDENT}{INDENT}{kind}: {pattern}");
            }
            for (i, layout) in prog.layouts.iter().enumerate() {
                let _ = writeln!(out, "{INDENT}{INDENT}layout {}:", i + 1);
                for (dev, seq) in DEVICE_KEYS.iter().zip(layout.keys.iter()) {
                    let _ = writeln!(out, "{INDENT}{INDENT}{INDENT}{:>10} => {seq}", dev.name);
                }
            }
        }

        out
    }
}
