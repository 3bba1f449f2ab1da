//! Lighting command buffers. Pure data, no I/O.

use crate::config::{Brightness, Config};
use crate::state::SharedState;

pub const CMD_LEN: usize = 90;
/// Commands sent per resync: three layout lights, brightness, pulse
pub const BATCH_LEN: usize = 5;

const ARG1: usize = 10;
const ARG2: usize = 88;

pub type Command = [u8; CMD_LEN];

const fn template(kind: [u8; 3]) -> Command {
    let mut cmd = [0u8; CMD_LEN];
    cmd[1] = 0xff;
    cmd[5] = 0x03;
    cmd[6] = 0x03;
    cmd[7] = kind[0];
    cmd[8] = kind[1];
    cmd[9] = kind[2];
    cmd
}

const LAYOUT_TEMPLATES: [Command; 3] = [
    template([0x00, 0x01, 0x0c]),
    template([0x00, 0x01, 0x0d]),
    template([0x00, 0x01, 0x0e]),
];
const LIGHT_TEMPLATE: Command = template([0x03, 0x01, 0x05]);
const PULSE_TEMPLATE: Command = template([0x02, 0x01, 0x05]);

/// Argument bytes for the three layout commands, one row per layout
/// number. Row 0 is what an idle keypad shows; row 7 turns every
/// indicator off.
const LAYOUT_ROWS: [[(u8, u8); 3]; 8] = [
    [(0x00, 0x0d), (0x00, 0x0c), (0x01, 0x0e)],
    [(0x01, 0x0c), (0x00, 0x0c), (0x00, 0x0f)],
    [(0x00, 0x0d), (0x01, 0x0d), (0x00, 0x0f)],
    [(0x01, 0x0c), (0x00, 0x0c), (0x01, 0x0e)],
    [(0x00, 0x0d), (0x01, 0x0d), (0x01, 0x0e)],
    [(0x01, 0x0c), (0x01, 0x0d), (0x00, 0x0f)],
    [(0x01, 0x0c), (0x01, 0x0d), (0x01, 0x0e)],
    [(0x00, 0x0d), (0x00, 0x0c), (0x00, 0x0f)],
];

fn layout_args(layout: usize) -> [(u8, u8); 3] {
    LAYOUT_ROWS[layout.min(LAYOUT_ROWS.len() - 1)]
}

fn brightness_args(level: Brightness) -> (u8, u8) {
    match level {
        Brightness::Off => (0x00, 0x07),
        Brightness::Low => (0x49, 0x4e),
        Brightness::Med => (0xa3, 0xa4),
        Brightness::High => (0xff, 0xf8),
    }
}

fn pulse_args(pulse: bool) -> (u8, u8) {
    if pulse {
        (0x02, 0x04)
    } else {
        (0x00, 0x06)
    }
}

fn fill(template: &Command, (a, b): (u8, u8)) -> Command {
    let mut cmd = *template;
    cmd[ARG1] = a;
    cmd[ARG2] = b;
    cmd
}

/// Build the full resync batch for the given state.
///
/// Without an active program the keypad goes dark regardless of the
/// configured brightness and pulse.
pub fn build_batch(state: &SharedState, config: &Config) -> [Command; BATCH_LEN] {
    let active = state.program().is_some();
    let layout = layout_args(state.layout());
    let (brightness, pulse) = if active {
        (config.brightness, config.pulse)
    } else {
        (Brightness::Off, false)
    };

    [
        fill(&LAYOUT_TEMPLATES[0], layout[0]),
        fill(&LAYOUT_TEMPLATES[1], layout[1]),
        fill(&LAYOUT_TEMPLATES[2], layout[2]),
        fill(&LIGHT_TEMPLATE, brightness_args(brightness)),
        fill(&PULSE_TEMPLATE, pulse_args(pulse)),
    ]
}
