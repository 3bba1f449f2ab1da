//! Virtual keyboard and replay of translated key sequences.

use crate::error::InputError;
use crate::keys::{injectable_codes, KeyCode, KeySequence};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, EventType, InputEvent, InputId, Key};

pub const KEY_RELEASE: i32 = 0;
pub const KEY_PRESS: i32 = 1;

const DEVICE_NAME: &str = "tartarusd keyboard";

/// Somewhere to write synthesized key events.
pub trait KeySink {
    /// Write one key event followed by a sync marker.
    fn send_key(&mut self, code: u16, value: i32) -> Result<(), InputError>;
}

/// The uinput keyboard all replayed keys come out of.
pub struct VirtualKeyboard {
    device: VirtualDevice,
}

impl VirtualKeyboard {
    pub fn new() -> Result<Self, InputError> {
        let mut keys = AttributeSet::<Key>::new();
        for code in injectable_codes() {
            keys.insert(Key::new(code));
        }

        let device = VirtualDeviceBuilder::new()
            .map_err(InputError::Create)?
            .name(DEVICE_NAME)
            .input_id(InputId::new(BusType::BUS_VIRTUAL, 0x1337, 0xb33f, 1))
            .with_keys(&keys)
            .map_err(InputError::Capability)?
            .build()
            .map_err(InputError::Build)?;

        Ok(Self { device })
    }
}

impl KeySink for VirtualKeyboard {
    fn send_key(&mut self, code: u16, value: i32) -> Result<(), InputError> {
        // emit() appends the SYN_REPORT
        self.device
            .emit(&[InputEvent::new(EventType::KEY, code, value)])
            .map_err(|source| InputError::Write { code, source })
    }
}

fn send<S, F>(code: KeyCode, value: i32, sink: &mut S, internal: &mut F) -> Result<(), InputError>
where
    S: KeySink,
    F: FnMut(KeyCode),
{
    match code.os_code() {
        Some(os) => sink.send_key(os, value),
        None => {
            // Layout commands act once per press
            if value == KEY_PRESS {
                internal(code);
            }
            Ok(())
        }
    }
}

/// Replay `seq` for a physical key event with the given value.
///
/// A single chord follows the physical key: press, repeat and release are
/// passed through. A macro fires every chord on press and ignores the rest.
/// Internal codes go to `internal` instead of the sink.
pub fn replay<S, F>(seq: &KeySequence, value: i32, sink: &mut S, mut internal: F) -> Result<(), InputError>
where
    S: KeySink,
    F: FnMut(KeyCode),
{
    if !seq.is_macro() {
        for &code in seq.combos().iter().flat_map(|c| c.codes()) {
            send(code, value, sink, &mut internal)?;
        }
        return Ok(());
    }

    if value != KEY_PRESS {
        return Ok(());
    }
    for combo in seq.combos() {
        for &code in combo.codes() {
            send(code, KEY_PRESS, sink, &mut internal)?;
        }
        for &code in combo.codes().iter().rev() {
            send(code, KEY_RELEASE, sink, &mut internal)?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every event instead of writing to uinput
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Vec<(u16, i32)>,
    }

    impl KeySink for RecordingSink {
        fn send_key(&mut self, code: u16, value: i32) -> Result<(), InputError> {
            self.events.push((code, value));
            Ok(())
        }
    }

    fn replay_collect(text: &str, value: i32) -> (Vec<(u16, i32)>, Vec<KeyCode>) {
        let seq = KeySequence::parse(text).unwrap();
        let mut sink = RecordingSink::default();
        let mut internal = Vec::new();
        replay(&seq, value, &mut sink, |c| internal.push(c)).unwrap();
        (sink.events, internal)
    }

    #[test]
    fn single_chord_follows_physical_value() {
        let (events, _) = replay_collect("ctrl+c", KEY_PRESS);
        assert_eq!(events, vec![(29, 1), (46, 1)]);

        let (events, _) = replay_collect("ctrl+c", KEY_RELEASE);
        assert_eq!(events, vec![(29, 0), (46, 0)]);

        let (events, _) = replay_collect("a", 2);
        assert_eq!(events, vec![(30, 2)]);
    }

    #[test]
    fn macro_fires_on_press_only() {
        let (events, _) = replay_collect("shift+a b", KEY_PRESS);
        assert_eq!(events, vec![(42, 1), (30, 1), (30, 0), (42, 0), (48, 1), (48, 0)]);

        let (events, _) = replay_collect("shift+a b", KEY_RELEASE);
        assert!(events.is_empty());
        let (events, _) = replay_collect("shift+a b", 2);
        assert!(events.is_empty());
    }

    #[test]
    fn internal_codes_are_intercepted() {
        let (events, internal) = replay_collect("layout_next", KEY_PRESS);
        assert!(events.is_empty());
        assert_eq!(internal, vec![KeyCode::NEXT_LAYOUT]);

        let (events, internal) = replay_collect("layout_next", KEY_RELEASE);
        assert!(events.is_empty());
        assert!(internal.is_empty());

        let (events, internal) = replay_collect("a layout_prev", KEY_PRESS);
        assert_eq!(events, vec![(30, 1), (30, 0)]);
        assert_eq!(internal, vec![KeyCode::PREV_LAYOUT]);
    }
}
