//! Fan-out of external triggers to the process watcher, layout engine and
//! lights. Owns the shared state and the current config snapshot.

use crate::config::Config;
use crate::error::InputError;
use crate::input::{replay, KeySink};
use crate::layout;
use crate::proc::{ProcessTable, ProcessWatcher};
use crate::state::SharedState;
use tracing::debug;

/// Whatever shows the state on the keypad.
pub trait Lights {
    /// Send the full lighting batch for the current state.
    fn resync(&mut self, state: &SharedState, config: &Config);
    /// Handle pending hotplug events and retry a lost connection.
    fn service(&mut self, state: &SharedState, config: &Config);
}

pub struct Hub<P: ProcessTable, L: Lights> {
    state: SharedState,
    config: Config,
    watcher: ProcessWatcher<P>,
    lights: L,
}

impl<P: ProcessTable, L: Lights> Hub<P, L> {
    /// Starts idle with an empty config; feed the first snapshot through
    /// `config_updated`.
    pub fn new(table: P, lights: L) -> Self {
        Self {
            state: SharedState::new(),
            config: Config::default(),
            watcher: ProcessWatcher::new(table),
            lights,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn lights_mut(&mut self) -> &mut L {
        &mut self.lights
    }

    /// Periodic work: process liveness, USB reconnects, then a resync if
    /// anything moved.
    pub fn poll_tick(&mut self) {
        let before = self.state.program();
        self.watcher.on_tick(&mut self.state, &self.config);
        match self.state.program() {
            None => layout::on_prog_end(&mut self.state),
            // A different program starts over at its first layout
            Some(now) if before.is_some() && before != Some(now) => self.state.set_layout(1),
            Some(_) => layout::on_prog_start(&mut self.state),
        }
        self.lights.service(&self.state, &self.config);
        self.check_state();
    }

    /// USB descriptors woke up.
    pub fn usb_ready(&mut self) {
        self.lights.service(&self.state, &self.config);
        self.check_state();
    }

    /// Swap in a freshly loaded snapshot. Always resyncs exactly once.
    pub fn config_updated(&mut self, config: Config) {
        self.config = config;
        self.watcher.on_config_updated(&mut self.state, &self.config);
        if self.state.program().is_some() {
            layout::on_prog_start(&mut self.state);
        } else {
            layout::on_prog_end(&mut self.state);
        }
        layout::on_config_updated(&mut self.state, &self.config);
        self.state.has_changed();
        debug!(programs = self.config.programs.len(), "config applied");
        self.lights.resync(&self.state, &self.config);
    }

    /// Resync the lights if the state changed since the last check.
    pub fn check_state(&mut self) {
        if self.state.has_changed() {
            self.lights.resync(&self.state, &self.config);
        }
    }

    /// Translate and replay one raw key event from the keypad.
    pub fn key_event<S: KeySink>(&mut self, code: u16, value: i32, sink: &mut S) -> Result<(), InputError> {
        let Some(seq) = layout::translate(&self.state, &self.config, code) else {
            return Ok(());
        };
        let state = &mut self.state;
        let config = &self.config;
        replay(seq, value, sink, |internal| layout::handle_internal(state, config, internal))?;
        self.check_state();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Brightness;
    use crate::input::tests::RecordingSink;
    use crate::input::{KEY_PRESS, KEY_RELEASE};
    use crate::keys::KeySequence;
    use crate::proc::tests::{program, FakeTable};
    use crate::usb::commands::{build_batch, Command, BATCH_LEN};

    #[derive(Default)]
    struct RecordingLights {
        batches: Vec<[Command; BATCH_LEN]>,
        serviced: usize,
    }

    impl Lights for RecordingLights {
        fn resync(&mut self, state: &SharedState, config: &Config) {
            self.batches.push(build_batch(state, config));
        }

        fn service(&mut self, _state: &SharedState, _config: &Config) {
            self.serviced += 1;
        }
    }

    fn args(cmd: &Command) -> (u8, u8) {
        (cmd[10], cmd[88])
    }

    fn editor_config() -> Config {
        Config {
            brightness: Brightness::High,
            pulse: true,
            programs: vec![program("editor", &[], &["/usr/bin/editor"], 2)],
            ..Config::default()
        }
    }

    #[test]
    fn editor_becomes_active_with_one_resync() {
        let table = FakeTable::with(&[(1, "init", "/sbin/init"), (100, "editor", "/usr/bin/editor")]);
        let mut hub = Hub::new(&table, RecordingLights::default());

        hub.config_updated(editor_config());
        assert_eq!(hub.state().program(), Some(0));
        assert_eq!(hub.state().pid(), Some(100));
        assert_eq!(hub.state().layout(), 1);

        hub.poll_tick();
        let batches = &hub.lights_mut().batches;
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(args(&batch[0]), (0x01, 0x0c));
        assert_eq!(args(&batch[1]), (0x00, 0x0c));
        assert_eq!(args(&batch[2]), (0x00, 0x0f));
        assert_eq!(args(&batch[3]), (0xff, 0xf8));
        assert_eq!(args(&batch[4]), (0x02, 0x04));
    }

    #[test]
    fn no_match_turns_lights_off() {
        let table = FakeTable::with(&[(1, "init", "/sbin/init")]);
        let mut hub = Hub::new(&table, RecordingLights::default());

        hub.config_updated(editor_config());
        assert_eq!(hub.state().program(), None);
        assert_eq!(hub.state().layout(), 0);

        let batches = &hub.lights_mut().batches;
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(args(&batch[0]), (0x00, 0x0d));
        assert_eq!(args(&batch[1]), (0x00, 0x0c));
        assert_eq!(args(&batch[2]), (0x01, 0x0e));
        assert_eq!(args(&batch[3]), (0x00, 0x07));
        assert_eq!(args(&batch[4]), (0x00, 0x06));
    }

    #[test]
    fn tick_follows_program_start_and_exit() {
        let table = FakeTable::with(&[(1, "init", "/sbin/init")]);
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(editor_config());

        hub.poll_tick();
        assert_eq!(hub.lights_mut().batches.len(), 1);

        table.spawn(100, "editor", "/usr/bin/editor");
        hub.poll_tick();
        assert_eq!(hub.state().layout(), 1);
        assert_eq!(hub.lights_mut().batches.len(), 2);

        table.exit(100);
        hub.poll_tick();
        assert_eq!(hub.state().layout(), 0);
        assert_eq!(hub.state().program(), None);
        assert_eq!(hub.lights_mut().batches.len(), 3);
        assert_eq!(hub.lights_mut().serviced, 3);
    }

    #[test]
    fn switching_programs_starts_at_first_layout() {
        let table = FakeTable::with(&[(100, "editor", "/usr/bin/editor"), (200, "game", "/usr/bin/game")]);
        let mut config = editor_config();
        config.programs.push(program("game", &[], &["/usr/bin/game"], 3));
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(config);
        assert_eq!(hub.state().program(), Some(0));

        let mut sink = RecordingSink::default();
        // Position 1 reports tab; bind it to layout_next on both layouts
        hub.config.programs[0].layouts[0].keys[0] = KeySequence::parse("layout_next").unwrap();
        hub.key_event(15, KEY_PRESS, &mut sink).unwrap();
        assert_eq!(hub.state().layout(), 2);

        table.exit(100);
        hub.poll_tick();
        assert_eq!(hub.state().program(), Some(1));
        assert_eq!(hub.state().layout(), 1);
    }

    #[test]
    fn layout_keys_resync_and_wrap() {
        let table = FakeTable::with(&[(100, "editor", "/usr/bin/editor")]);
        let mut config = editor_config();
        for layout in &mut config.programs[0].layouts {
            layout.keys[0] = KeySequence::parse("layout_next").unwrap();
        }
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(config);
        let mut sink = RecordingSink::default();

        hub.key_event(15, KEY_PRESS, &mut sink).unwrap();
        assert_eq!(hub.state().layout(), 2);
        hub.key_event(15, KEY_RELEASE, &mut sink).unwrap();
        assert_eq!(hub.state().layout(), 2);
        hub.key_event(15, KEY_PRESS, &mut sink).unwrap();
        assert_eq!(hub.state().layout(), 1);

        assert!(sink.events.is_empty());
        let batches = &hub.lights_mut().batches;
        assert_eq!(batches.len(), 3);
        assert_eq!(args(&batches[1][0]), (0x00, 0x0d));
        assert_eq!(args(&batches[1][1]), (0x01, 0x0d));
    }

    #[test]
    fn mapped_keys_are_replayed() {
        let table = FakeTable::with(&[(100, "editor", "/usr/bin/editor")]);
        let mut config = editor_config();
        config.programs[0].layouts[0].keys[0] = KeySequence::parse("ctrl+c").unwrap();
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(config);
        let mut sink = RecordingSink::default();

        hub.key_event(15, KEY_PRESS, &mut sink).unwrap();
        hub.key_event(15, KEY_RELEASE, &mut sink).unwrap();
        // Unmapped position passes through as its default key
        hub.key_event(16, KEY_PRESS, &mut sink).unwrap();
        // Not a keypad key
        hub.key_event(59, KEY_PRESS, &mut sink).unwrap();

        assert_eq!(sink.events, vec![(29, 1), (46, 1), (29, 0), (46, 0), (16, 1)]);
        assert_eq!(hub.lights_mut().batches.len(), 1);
    }

    #[test]
    fn idle_keys_are_dropped() {
        let table = FakeTable::default();
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(editor_config());
        let mut sink = RecordingSink::default();

        hub.key_event(15, KEY_PRESS, &mut sink).unwrap();
        assert!(sink.events.is_empty());
    }

    #[test]
    fn reload_clamps_layout() {
        let table = FakeTable::with(&[(100, "editor", "/usr/bin/editor")]);
        let mut config = editor_config();
        config.programs[0] = program("editor", &[], &["/usr/bin/editor"], 5);
        let mut hub = Hub::new(&table, RecordingLights::default());
        hub.config_updated(config);
        hub.state.set_layout(5);
        hub.check_state();

        let mut smaller = editor_config();
        smaller.programs[0] = program("editor", &[], &["/usr/bin/editor"], 3);
        hub.config_updated(smaller);
        assert_eq!(hub.state().layout(), 3);
        assert_eq!(hub.lights_mut().batches.len(), 3);
    }
}
