//! On-disk settings: TOML files in the config directory, merged into a
//! validated `Config` snapshot.

use crate::config::{Brightness, Config, ExePattern, Hotkeys, Layout, Program, MAX_LAYOUTS};
use crate::error::ConfigError;
use crate::keys::{device_position, KeySequence};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

pub const DEFAULT_FILE: &str = "config.toml";

const DEFAULT_CONFIG: &str = r#"# tartarusd configuration
#
# Every *.toml file in this directory is read in file-name order.

[default]
brightness = "low"
pulse = false

# [hotkeys]
# launch = "super+t"
# next = "super+n"
# prev = "super+p"

# [[program]]
# name = "editor"
# priority = 0
# cmd = ["vim"]
# exe = ["/usr/bin/editor"]
#
# [[program.layout]]
# id = 1
# [program.layout.keys]
# 1 = "ctrl+c"
# thumb_up = "layout_next"
"#;

#[derive(Debug, Default, Deserialize)]
struct RawFile {
    #[serde(default)]
    default: RawDefaults,
    #[serde(default)]
    hotkeys: RawHotkeys,
    #[serde(default)]
    program: Vec<RawProgram>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    brightness: Option<toml::Value>,
    pulse: Option<toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHotkeys {
    launch: Option<String>,
    next: Option<String>,
    prev: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    name: String,
    priority: Option<i32>,
    #[serde(default)]
    cmd: Vec<String>,
    #[serde(default)]
    exe: Vec<String>,
    #[serde(default)]
    layout: Vec<RawLayout>,
}

#[derive(Debug, Deserialize)]
struct RawLayout {
    id: i64,
    #[serde(default)]
    keys: BTreeMap<String, toml::Value>,
}

/// Resolve the config directory from the command line or the platform default.
pub fn config_dir(arg: Option<&Path>) -> PathBuf {
    match arg {
        Some(path) => expand_home(path),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tartarusd"),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Make sure the directory and a default config file exist.
pub fn ensure_dir(dir: &Path) -> Result<(), ConfigError> {
    if !dir.is_dir() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|source| ConfigError::CreateDir { path: dir.to_path_buf(), source })?;
    }

    let path = dir.join(DEFAULT_FILE);
    if !path.exists() {
        debug!(path = %path.display(), "writing default config");
        fs::write(&path, DEFAULT_CONFIG)
            .map_err(|source| ConfigError::WriteDefault { path, source })?;
    }
    Ok(())
}

/// Read every `*.toml` file in `dir` and build one snapshot.
pub fn load(dir: &Path) -> Result<Config, ConfigError> {
    ensure_dir(dir)?;

    let entries = fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir { path: dir.to_path_buf(), source })?;
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml") && p.is_file())
        .collect();
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<RawFile>(&text) {
                Ok(file) => files.push(file),
                Err(e) => error!(path = %path.display(), "failed to parse config file: {e}"),
            },
            // Removed between listing and reading
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "failed to read config file: {e}"),
        }
    }

    Ok(build(dir, files))
}

fn build(dir: &Path, files: Vec<RawFile>) -> Config {
    let mut config = Config { dir: dir.to_path_buf(), ..Config::default() };
    let mut merged: Vec<RawProgram> = Vec::new();

    for file in files {
        if let Some(value) = file.default.brightness {
            config.brightness = parse_brightness(&value);
        }
        if let Some(value) = file.default.pulse {
            config.pulse = parse_pulse(&value);
        }
        merge_hotkeys(&mut config.hotkeys, file.hotkeys);

        for prog in file.program {
            match merged.iter_mut().find(|p| p.name == prog.name) {
                Some(existing) => {
                    if prog.priority.is_some() {
                        existing.priority = prog.priority;
                    }
                    existing.cmd.extend(prog.cmd);
                    existing.exe.extend(prog.exe);
                    existing.layout.extend(prog.layout);
                }
                None => merged.push(prog),
            }
        }
    }

    config.programs = merged.into_iter().filter_map(build_program).collect();
    // Stable, so equal priorities keep declaration order
    config.programs.sort_by(|a, b| b.priority.cmp(&a.priority));
    config
}

fn parse_brightness(value: &toml::Value) -> Brightness {
    match value.as_str().and_then(Brightness::from_name) {
        Some(b) => b,
        None => {
            warn!("invalid brightness {value}, defaulting to low");
            Brightness::Low
        }
    }
}

fn parse_pulse(value: &toml::Value) -> bool {
    match value.as_bool() {
        Some(b) => b,
        None => {
            warn!("invalid pulse {value}, defaulting to false");
            false
        }
    }
}

fn merge_hotkeys(hotkeys: &mut Hotkeys, raw: RawHotkeys) {
    if raw.launch.is_some() {
        hotkeys.launch = raw.launch;
    }
    if raw.next.is_some() {
        hotkeys.next = raw.next;
    }
    if raw.prev.is_some() {
        hotkeys.prev = raw.prev;
    }
}

fn build_program(raw: RawProgram) -> Option<Program> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        warn!("skipping program with empty name");
        return None;
    }

    let mut layouts: Vec<Layout> = Vec::new();
    for raw_layout in raw.layout {
        let id = match u32::try_from(raw_layout.id) {
            Ok(id) if id > 0 => id,
            _ => {
                warn!(program = %name, "invalid layout id {}, skipping", raw_layout.id);
                continue;
            }
        };
        if layouts.iter().any(|l| l.id == id) {
            warn!(program = %name, "duplicate layout {id}, skipping");
            continue;
        }
        layouts.push(build_layout(&name, id, raw_layout.keys));
    }
    layouts.sort_by_key(|l| l.id);

    if layouts.len() > MAX_LAYOUTS {
        warn!(program = %name, "too many layouts ({}), keeping the first {MAX_LAYOUTS}", layouts.len());
        layouts.truncate(MAX_LAYOUTS);
    }
    for (expected, layout) in (1..).zip(layouts.iter()) {
        if layout.id != expected {
            warn!(program = %name, "layout ids have a gap before {}", layout.id);
            break;
        }
    }
    if layouts.is_empty() {
        debug!(program = %name, "no layouts, using defaults");
        layouts.push(Layout::with_defaults(1));
    }

    Some(Program {
        name,
        priority: raw.priority.unwrap_or(0),
        cmds: raw.cmd,
        exes: raw.exe.iter().map(|e| ExePattern::new(e)).collect(),
        layouts,
    })
}

fn build_layout(program: &str, id: u32, keys: BTreeMap<String, toml::Value>) -> Layout {
    let mut layout = Layout::with_defaults(id);
    for (key, value) in keys {
        let Some(pos) = device_position(&key) else {
            warn!(program, layout = id, "unknown key {key:?}");
            continue;
        };
        let Some(text) = value.as_str() else {
            warn!(program, layout = id, "key {key} is not a string, keeping default");
            continue;
        };
        match KeySequence::parse(text) {
            Ok(seq) => layout.keys[pos] = seq,
            Err(e) => warn!(program, layout = id, "key {key}: {e}, keeping default"),
        }
    }
    layout
}
