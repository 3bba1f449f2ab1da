//! Wires the hub, devices and watchers into the poll loop.

use crate::error::InputError;
use crate::evdev_util::{find_keypad_devices, KeypadDevice, INPUT_DIR};
use crate::hub::Hub;
use crate::input::VirtualKeyboard;
use crate::poll::{Interest, Pollable, Poller, Readiness, Tick, Token};
use crate::proc::ProcFs;
use crate::settings;
use crate::usb::{pollfd_changes, UsbLights, UsbPollFd, PRODUCT_ID, VENDOR_ID};
use anyhow::Context;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on the multiplexer wait, so ticks run without any events.
const TICK: Duration = Duration::from_secs(1);

/// Everything a handler may touch while it runs.
pub struct Runtime {
    hub: Hub<ProcFs, UsbLights>,
    keyboard: VirtualKeyboard,
    config_dir: PathBuf,
    config_watch: ConfigWatch,
    /// libusb descriptors currently registered with the poller
    usb_fds: Vec<(UsbPollFd, Token)>,
    /// Set by a handler when the virtual keyboard stops accepting writes
    fatal: Option<InputError>,
}

impl Runtime {
    /// Bring the poller's libusb registrations in line with what libusb
    /// currently wants watched.
    fn sync_usb_fds(&mut self, poller: &mut Poller<Runtime>) {
        let current = self.hub.lights_mut().pollfds();
        let known: Vec<UsbPollFd> = self.usb_fds.iter().map(|(fd, _)| *fd).collect();
        let (added, removed) = pollfd_changes(&known, &current);

        for fd in removed {
            if let Some(i) = self.usb_fds.iter().position(|(known, _)| *known == fd) {
                let (_, token) = self.usb_fds.swap_remove(i);
                poller.deregister(token);
                debug!(fd = fd.fd, "usb fd removed");
            }
        }
        for fd in added {
            let interest = Interest { readable: fd.readable, writable: fd.writable };
            match poller.register(fd.fd, interest, Box::new(UsbEvents)) {
                Ok(token) => {
                    debug!(fd = fd.fd, "usb fd added");
                    self.usb_fds.push((fd, token));
                }
                Err(e) => warn!("{e}"),
            }
        }
    }

    fn reload(&mut self) {
        match settings::load(&self.config_dir) {
            Ok(config) => {
                info!(dir = %self.config_dir.display(), "config reloaded");
                self.hub.config_updated(config);
            }
            Err(e) => error!("failed to reload config, keeping the previous one: {e}"),
        }
    }
}

impl Tick for Runtime {
    type Error = anyhow::Error;

    fn tick(&mut self, poller: &mut Poller<Runtime>) -> anyhow::Result<()> {
        if let Some(e) = self.fatal.take() {
            return Err(e.into());
        }
        self.hub.poll_tick();
        self.sync_usb_fds(poller);
        if self.config_watch.rearm() {
            self.reload();
        }
        Ok(())
    }
}

fn config_events() -> AddWatchFlags {
    AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF
}

/// Inotify on the config directory. The watch is lost when the directory
/// goes away and is added again once it is back.
struct ConfigWatch {
    inotify: Inotify,
    dir: PathBuf,
    watching: bool,
}

impl ConfigWatch {
    fn new(dir: &Path) -> nix::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(dir, config_events())?;
        Ok(Self { inotify, dir: dir.to_path_buf(), watching: true })
    }

    /// Consume queued events. Returns whether there were any.
    fn drain(&mut self) -> bool {
        let mut seen = false;
        while let Ok(events) = self.inotify.read_events() {
            if events.is_empty() {
                break;
            }
            seen = true;
            for event in events {
                if event.mask.contains(AddWatchFlags::IN_MOVE_SELF) {
                    // Follow the path, not the renamed directory
                    let _ = self.inotify.rm_watch(event.wd);
                }
                if event.mask.contains(AddWatchFlags::IN_IGNORED) && self.watching {
                    self.watching = false;
                    warn!(dir = %self.dir.display(), "config directory went away, hot reload paused until it returns");
                }
            }
        }
        seen
    }

    /// Watch the directory again if it reappeared. Returns true when the
    /// watch was restored.
    fn rearm(&mut self) -> bool {
        if self.watching || !self.dir.is_dir() {
            return false;
        }
        match self.inotify.add_watch(&self.dir, config_events()) {
            Ok(_) => {
                self.watching = true;
                info!(dir = %self.dir.display(), "watching config directory again");
                true
            }
            Err(e) => {
                debug!("failed to watch config directory: {e}");
                false
            }
        }
    }
}

fn drain_inotify(inotify: &Inotify) -> usize {
    let mut seen = 0;
    // Non-blocking: EAGAIN once the queue is empty
    while let Ok(events) = inotify.read_events() {
        if events.is_empty() {
            break;
        }
        seen += events.len();
    }
    seen
}

// ============================================================================
// Handlers
// ============================================================================

struct ConfigEvents;

impl Pollable<Runtime> for ConfigEvents {
    fn ready(&mut self, ctx: &mut Runtime, _token: Token, _readiness: Readiness, _poller: &mut Poller<Runtime>) {
        if ctx.config_watch.drain() {
            ctx.reload();
        }
    }
}

/// Re-enumerates keypads whenever `/dev/input` changes.
struct InputDirWatch {
    inotify: Inotify,
    devices: Vec<Token>,
}

impl InputDirWatch {
    fn rescan(&mut self, poller: &mut Poller<Runtime>) {
        // Dropping a source releases its grab
        for token in self.devices.drain(..) {
            drop(poller.deregister(token));
        }

        for (path, device) in find_keypad_devices(Path::new(INPUT_DIR), VENDOR_ID, PRODUCT_ID) {
            let device = match KeypadDevice::open(path.clone(), device) {
                Ok(device) => device,
                Err(e) => {
                    warn!(path = %path.display(), "failed to grab keypad: {e}");
                    continue;
                }
            };
            let fd = device.as_raw_fd();
            match poller.register(fd, Interest::READABLE, Box::new(KeypadSource { device })) {
                Ok(token) => self.devices.push(token),
                Err(e) => warn!("{e}"),
            }
        }
        info!(count = self.devices.len(), "keypad input devices");
    }
}

impl Pollable<Runtime> for InputDirWatch {
    fn ready(&mut self, _ctx: &mut Runtime, _token: Token, _readiness: Readiness, poller: &mut Poller<Runtime>) {
        if drain_inotify(&self.inotify) > 0 {
            self.rescan(poller);
        }
    }
}

struct KeypadSource {
    device: KeypadDevice,
}

impl Pollable<Runtime> for KeypadSource {
    fn ready(&mut self, ctx: &mut Runtime, token: Token, readiness: Readiness, poller: &mut Poller<Runtime>) {
        let mut events = Vec::new();
        let result = self.device.drain(|code, value| events.push((code, value)));

        for (code, value) in events {
            if let Err(e) = ctx.hub.key_event(code, value, &mut ctx.keyboard) {
                ctx.fatal = Some(e);
                return;
            }
        }

        if let Err(e) = result {
            debug!(path = %self.device.path().display(), "keypad gone: {e}");
            poller.deregister(token);
        } else if readiness.closed {
            poller.deregister(token);
        }
    }
}

/// libusb's own descriptors: hotplug notifications and transfer completion.
struct UsbEvents;

impl Pollable<Runtime> for UsbEvents {
    fn ready(&mut self, ctx: &mut Runtime, _token: Token, _readiness: Readiness, poller: &mut Poller<Runtime>) {
        ctx.hub.lights_mut().handle_events();
        ctx.hub.usb_ready();
        ctx.sync_usb_fds(poller);
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Bring everything up and run the loop. Only returns on a fatal error.
pub fn run(config_dir: PathBuf) -> anyhow::Result<()> {
    let config = settings::load(&config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;
    let keyboard = VirtualKeyboard::new().context("failed to create virtual keyboard")?;
    let lights = UsbLights::new().context("failed to initialize libusb")?;
    let mut poller = Poller::new()?;

    let config_watch = ConfigWatch::new(&config_dir)
        .with_context(|| format!("failed to watch {}", config_dir.display()))?;
    let fd = config_watch.inotify.as_fd().as_raw_fd();
    let mut runtime = Runtime {
        hub: Hub::new(ProcFs::new(), lights),
        keyboard,
        config_dir: config_dir.clone(),
        config_watch,
        usb_fds: Vec::new(),
        fatal: None,
    };
    poller.register(fd, Interest::READABLE, Box::new(ConfigEvents))?;

    let input_watch = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
        .context("failed to init inotify")?;
    input_watch
        .add_watch(
            INPUT_DIR,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_ATTRIB,
        )
        .with_context(|| format!("failed to watch {INPUT_DIR}"))?;
    let fd = input_watch.as_fd().as_raw_fd();
    let mut input_watch = InputDirWatch { inotify: input_watch, devices: Vec::new() };
    input_watch.rescan(&mut poller);
    poller.register(fd, Interest::READABLE, Box::new(input_watch))?;

    runtime.sync_usb_fds(&mut poller);
    debug!(registered = poller.len(), "poller ready");

    runtime.hub.config_updated(config);
    info!(dir = %config_dir.display(), "tartarusd running");
    poller.run(&mut runtime, TICK)
}
