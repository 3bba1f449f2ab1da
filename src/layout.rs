//! Layout engine: physical key translation and layout switching.

use crate::config::Config;
use crate::keys::{position_for_code, KeyCode, KeySequence};
use crate::state::SharedState;
use tracing::debug;

fn layout_count(state: &SharedState, config: &Config) -> usize {
    state
        .program()
        .and_then(|i| config.program(i))
        .map_or(0, |p| p.layout_count())
}

/// The sequence configured for the physical key that reports `code`, if a
/// layout is active.
pub fn translate<'c>(state: &SharedState, config: &'c Config, code: u16) -> Option<&'c KeySequence> {
    let layout = state.layout();
    if layout == 0 {
        return None;
    }
    let program = config.program(state.program()?)?;
    let pos = position_for_code(code)?;
    program.layouts.get(layout - 1).map(|l| &l.keys[pos])
}

/// Apply a next/prev layout command. Wraps at both ends.
pub fn handle_internal(state: &mut SharedState, config: &Config, code: KeyCode) {
    let count = layout_count(state, config);
    let current = state.layout();
    if count == 0 || current == 0 {
        return;
    }

    let next = match code {
        KeyCode::NEXT_LAYOUT if current >= count => 1,
        KeyCode::NEXT_LAYOUT => current + 1,
        KeyCode::PREV_LAYOUT if current <= 1 => count,
        KeyCode::PREV_LAYOUT => current - 1,
        _ => return,
    };
    debug!(from = current, to = next, "switching layout");
    state.set_layout(next);
}

pub fn on_prog_start(state: &mut SharedState) {
    if state.layout() == 0 {
        state.set_layout(1);
    }
}

pub fn on_prog_end(state: &mut SharedState) {
    state.set_layout(0);
}

/// Keep the layout inside the active program's range after a reload.
pub fn on_config_updated(state: &mut SharedState, config: &Config) {
    if state.program().is_none() {
        return;
    }
    let count = layout_count(state, config).max(1);
    if state.layout() > count {
        state.set_layout(count);
    }
}
