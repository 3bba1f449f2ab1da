//! Key table: symbolic key names, OS key codes and the keypad's physical layout.

use crate::error::KeyParseError;
use std::fmt;

/// Identifier for a key. Non-negative values are Linux input key codes; the
/// negative values are internal commands that never reach the virtual keyboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(pub i32);

impl KeyCode {
    /// Switch to the next layout of the active program
    pub const NEXT_LAYOUT: KeyCode = KeyCode(-2);
    /// Switch to the previous layout of the active program
    pub const PREV_LAYOUT: KeyCode = KeyCode(-1);

    /// Look up a key by name, ignoring case. Alternate names are accepted.
    pub fn from_name(name: &str) -> Option<KeyCode> {
        let upper = name.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return None;
        }
        KEYS.iter()
            .find(|k| k.name == upper || k.alt_name == Some(upper.as_str()))
            .map(|k| k.code)
    }

    /// Canonical name of the key. Keys with an alternate name report that one.
    pub fn name(self) -> Option<&'static str> {
        KEYS.iter()
            .find(|k| k.code == self)
            .map(|k| k.alt_name.unwrap_or(k.name))
    }

    pub fn is_internal(self) -> bool {
        self.0 < 0
    }

    /// The code to write to the input subsystem, if this is a real key.
    pub fn os_code(self) -> Option<u16> {
        u16::try_from(self.0).ok()
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(&name.to_ascii_lowercase()),
            None => write!(f, "unknown({})", self.0),
        }
    }
}

struct KeyEntry {
    name: &'static str,
    alt_name: Option<&'static str>,
    code: KeyCode,
}

const fn key(name: &'static str, code: i32) -> KeyEntry {
    KeyEntry { name, alt_name: None, code: KeyCode(code) }
}

const fn key_alt(name: &'static str, alt_name: &'static str, code: i32) -> KeyEntry {
    KeyEntry { name, alt_name: Some(alt_name), code: KeyCode(code) }
}

// ============================================================================
// Key Table
// ============================================================================

/// Every key that can appear in a configured sequence
const KEYS: &[KeyEntry] = &[
    // Internal commands
    key("LAYOUT_NEXT", -2),
    key("LAYOUT_PREV", -1),

    // Main block
    key("ESC", 1),
    key("1", 2), key("2", 3), key("3", 4), key("4", 5), key("5", 6),
    key("6", 7), key("7", 8), key("8", 9), key("9", 10), key("0", 11),
    key("-", 12), key("=", 13), key("BACKSPACE", 14), key("TAB", 15),
    key("Q", 16), key("W", 17), key("E", 18), key("R", 19), key("T", 20),
    key("Y", 21), key("U", 22), key("I", 23), key("O", 24), key("P", 25),
    key("[", 26), key("]", 27), key("ENTER", 28),
    key_alt("CTRL_L", "CTRL", 29),
    key("A", 30), key("S", 31), key("D", 32), key("F", 33), key("G", 34),
    key("H", 35), key("J", 36), key("K", 37), key("L", 38),
    key(";", 39), key("'", 40), key("`", 41),
    key_alt("SHIFT_L", "SHIFT", 42),
    key("\\", 43),
    key("Z", 44), key("X", 45), key("C", 46), key("V", 47), key("B", 48),
    key("N", 49), key("M", 50), key(",", 51), key(".", 52), key("/", 53),
    key("SHIFT_R", 54),
    key("*", 55),
    key_alt("ALT_L", "ALT", 56),
    key("SPACE", 57),
    key("CAPSLOCK", 58),

    // Function row
    key("F1", 59), key("F2", 60), key("F3", 61), key("F4", 62), key("F5", 63),
    key("F6", 64), key("F7", 65), key("F8", 66), key("F9", 67), key("F10", 68),
    key("NUMLOCK", 69), key("SCROLLLOCK", 70),

    // Keypad
    key("KP7", 71), key("KP8", 72), key("KP9", 73), key("KP-", 74),
    key("KP4", 75), key("KP5", 76), key("KP6", 77), key("PLUS", 78),
    key("KP1", 79), key("KP2", 80), key("KP3", 81), key("KP0", 82), key("KPD.", 83),

    key("F11", 87), key("F12", 88), key("RO", 89),
    key("KPENTER", 96), key("CTRL_R", 97), key("KP/", 98), key("ALT_R", 100),

    // Navigation
    key("HOME", 102), key("UP", 103), key("PAGEUP", 104), key("LEFT", 105),
    key("RIGHT", 106), key("END", 107), key("DOWN", 108), key("PAGEDOWN", 109),
    key("INSERT", 110), key("DELETE", 111),

    key("KP=", 117), key("KPPLUSMINUS", 118), key("PAUSE", 119), key("KP,", 121),
    key_alt("SUPER-L", "SUPER", 125),
    key("SUPER-R", 126),
    key("COMPOSE", 127),

    // Extended function keys
    key("F13", 183), key("F14", 184), key("F15", 185), key("F16", 186),
    key("F17", 187), key("F18", 188), key("F19", 189), key("F20", 190),
    key("F21", 191), key("F22", 192), key("F23", 193), key("F24", 194),
];

/// Every key code the daemon might ever replay to the virtual keyboard.
pub fn injectable_codes() -> impl Iterator<Item = u16> {
    KEYS.iter().filter_map(|k| k.code.os_code())
}

// ============================================================================
// Combos and Sequences
// ============================================================================

/// Keys asserted together, in press order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCombo(Vec<KeyCode>);

impl KeyCombo {
    pub fn codes(&self) -> &[KeyCode] {
        &self.0
    }

    fn parse(combo: &str, whole: &str) -> Result<Self, KeyParseError> {
        combo
            .split('+')
            .map(|name| {
                KeyCode::from_name(name).ok_or_else(|| KeyParseError::UnknownKey {
                    combo: whole.to_string(),
                    key: name.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(KeyCombo)
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, code) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{code}")?;
        }
        Ok(())
    }
}

/// One or more combos fired in order for a single physical key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySequence(Vec<KeyCombo>);

impl KeySequence {
    /// Parse `"ctrl+c shift+a b"`: combos separated by whitespace, keys by `+`.
    pub fn parse(text: &str) -> Result<Self, KeyParseError> {
        let combos = text
            .split_whitespace()
            .map(|combo| KeyCombo::parse(combo, text))
            .collect::<Result<Vec<_>, _>>()?;
        if combos.is_empty() {
            return Err(KeyParseError::Empty);
        }
        Ok(KeySequence(combos))
    }

    pub fn single(code: KeyCode) -> Self {
        KeySequence(vec![KeyCombo(vec![code])])
    }

    pub fn combos(&self) -> &[KeyCombo] {
        &self.0
    }

    pub fn is_macro(&self) -> bool {
        self.0.len() > 1
    }
}

impl fmt::Display for KeySequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, combo) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{combo}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Physical Layout
// ============================================================================

/// Number of remappable keys on the keypad
pub const DEVICE_KEY_COUNT: usize = 21;

/// A physical key: the label used in config files and the key it sends by default
#[derive(Clone, Copy, Debug)]
pub struct DeviceKey {
    pub name: &'static str,
    pub default: KeyCode,
}

const fn dev(name: &'static str, default: i32) -> DeviceKey {
    DeviceKey { name, default: KeyCode(default) }
}

/// Physical positions in order: numbered pad keys, d-pad arrows, thumb buttons.
/// The keypad itself reports the default code of each position.
pub const DEVICE_KEYS: [DeviceKey; DEVICE_KEY_COUNT] = [
    dev("1", 15),   // tab
    dev("2", 16),   // q
    dev("3", 17),   // w
    dev("4", 18),   // e
    dev("5", 19),   // r
    dev("6", 58),   // capslock
    dev("7", 30),   // a
    dev("8", 31),   // s
    dev("9", 32),   // d
    dev("10", 33),  // f
    dev("11", 42),  // shift
    dev("12", 44),  // z
    dev("13", 45),  // x
    dev("14", 46),  // c
    dev("15", 47),  // v
    dev("up", 103),
    dev("down", 108),
    dev("left", 105),
    dev("right", 106),
    dev("thumb_up", 56),    // alt
    dev("thumb_down", 57),  // space
];

/// Position of the physical key with the given config name.
pub fn device_position(name: &str) -> Option<usize> {
    DEVICE_KEYS.iter().position(|k| k.name.eq_ignore_ascii_case(name))
}

/// Position of the physical key that reports `code`.
pub fn position_for_code(code: u16) -> Option<usize> {
    DEVICE_KEYS
        .iter()
        .position(|k| k.default.os_code() == Some(code))
}

/// Built-in sequences for every position: each key sends its own code.
pub fn default_sequences() -> [KeySequence; DEVICE_KEY_COUNT] {
    DEVICE_KEYS.map(|k| KeySequence::single(k.default))
}
