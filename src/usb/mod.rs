//! USB lighting controller for the keypad.

pub mod commands;

use crate::config::Config;
use crate::error::UsbError;
use crate::hub::Lights;
use crate::state::SharedState;
use commands::{build_batch, Command};
use rusb::{
    constants::{LIBUSB_REQUEST_CLEAR_FEATURE, LIBUSB_REQUEST_SET_CONFIGURATION},
    Context, Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, UsbContext,
};
use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const VENDOR_ID: u16 = 0x1532;
pub const PRODUCT_ID: u16 = 0x0201;

const INTERFACE: u8 = 2;
const W_VALUE: u16 = 0x0300;
const W_INDEX: u16 = INTERFACE as u16;
const TIMEOUT: Duration = Duration::from_millis(4000);

const REQ_OUT: u8 = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
const REQ_IN: u8 = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);

/// Opens the keypad. Implemented by the libusb context.
pub trait UsbBus {
    type Handle: UsbHandle;

    fn open(&self) -> Option<Self::Handle>;
}

/// The device operations a lighting resync needs.
pub trait UsbHandle {
    /// Configuration value and interface numbers of the first configuration
    fn first_config(&mut self) -> rusb::Result<(u8, Vec<u8>)>;
    fn driver_active(&mut self, iface: u8) -> rusb::Result<bool>;
    fn detach_driver(&mut self, iface: u8) -> rusb::Result<()>;
    fn attach_driver(&mut self, iface: u8) -> rusb::Result<()>;
    fn set_configuration(&mut self, config: u8) -> rusb::Result<()>;
    fn claim(&mut self, iface: u8) -> rusb::Result<()>;
    fn release(&mut self, iface: u8) -> rusb::Result<()>;
    fn control_out(&mut self, request_type: u8, request: u8, value: u16, index: u16, buf: &[u8]) -> rusb::Result<usize>;
    fn control_in(&mut self, request_type: u8, request: u8, value: u16, index: u16, buf: &mut [u8]) -> rusb::Result<usize>;
}

impl UsbBus for Context {
    type Handle = DeviceHandle<Context>;

    fn open(&self) -> Option<Self::Handle> {
        self.open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
    }
}

impl UsbHandle for DeviceHandle<Context> {
    fn first_config(&mut self) -> rusb::Result<(u8, Vec<u8>)> {
        let config = self.device().config_descriptor(0)?;
        Ok((config.number(), config.interfaces().map(|i| i.number()).collect()))
    }

    fn driver_active(&mut self, iface: u8) -> rusb::Result<bool> {
        self.kernel_driver_active(iface)
    }

    fn detach_driver(&mut self, iface: u8) -> rusb::Result<()> {
        self.detach_kernel_driver(iface)
    }

    fn attach_driver(&mut self, iface: u8) -> rusb::Result<()> {
        self.attach_kernel_driver(iface)
    }

    fn set_configuration(&mut self, config: u8) -> rusb::Result<()> {
        self.set_active_configuration(config)
    }

    fn claim(&mut self, iface: u8) -> rusb::Result<()> {
        self.claim_interface(iface)
    }

    fn release(&mut self, iface: u8) -> rusb::Result<()> {
        self.release_interface(iface)
    }

    fn control_out(&mut self, request_type: u8, request: u8, value: u16, index: u16, buf: &[u8]) -> rusb::Result<usize> {
        self.write_control(request_type, request, value, index, buf, TIMEOUT)
    }

    fn control_in(&mut self, request_type: u8, request: u8, value: u16, index: u16, buf: &mut [u8]) -> rusb::Result<usize> {
        self.read_control(request_type, request, value, index, buf, TIMEOUT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HotplugEvent {
    Arrived,
    Left,
}

/// libusb forbids synchronous I/O inside hotplug callbacks, so they only
/// queue an event for the loop to act on.
struct HotplugForwarder {
    events: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, _device: Device<Context>) {
        let _ = self.events.send(HotplugEvent::Arrived);
    }

    fn device_left(&mut self, _device: Device<Context>) {
        let _ = self.events.send(HotplugEvent::Left);
    }
}

/// Releases the claimed interface and reattaches kernel drivers on every
/// exit path of a resync.
struct InterfaceGuard<'a, H: UsbHandle> {
    handle: &'a mut H,
    interfaces: Vec<u8>,
    claimed: bool,
}

impl<H: UsbHandle> Drop for InterfaceGuard<'_, H> {
    fn drop(&mut self) {
        if self.claimed {
            let _ = self.handle.release(INTERFACE);
        }
        for &iface in &self.interfaces {
            if !self.handle.driver_active(iface).unwrap_or(true) {
                let _ = self.handle.attach_driver(iface);
            }
        }
    }
}

/// A libusb file descriptor and the readiness it wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbPollFd {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Split two pollfd snapshots into `(added, removed)`. A descriptor whose
/// wanted readiness changed shows up in both.
pub fn pollfd_changes(old: &[UsbPollFd], new: &[UsbPollFd]) -> (Vec<UsbPollFd>, Vec<UsbPollFd>) {
    let added = new.iter().filter(|fd| !old.contains(fd)).copied().collect();
    let removed = old.iter().filter(|fd| !new.contains(fd)).copied().collect();
    (added, removed)
}

pub struct UsbLights<B: UsbBus = Context> {
    bus: B,
    handle: Option<B::Handle>,
    /// A matching device was reported present by hotplug
    should_have_dev: bool,
    events: Receiver<HotplugEvent>,
    _registration: Option<Registration<Context>>,
}

impl UsbLights<Context> {
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (tx, rx) = mpsc::channel();

        let registration = if rusb::has_hotplug() {
            let mut builder = HotplugBuilder::new();
            builder.vendor_id(VENDOR_ID).product_id(PRODUCT_ID).enumerate(true);
            let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugForwarder { events: tx });
            Some(builder.register(context.clone(), callback)?)
        } else {
            warn!("libusb has no hotplug support, looking for the keypad on every tick");
            None
        };

        let should_have_dev = registration.is_none();
        let mut lights = UsbLights::with_bus(context, rx, should_have_dev);
        lights._registration = registration;
        Ok(lights)
    }

    /// Descriptors libusb needs watched for hotplug and transfer events.
    ///
    /// The set grows when a device is opened and shrinks when it is closed,
    /// so callers diff successive snapshots with `pollfd_changes`.
    pub fn pollfds(&self) -> Vec<UsbPollFd> {
        let mut fds = Vec::new();
        // SAFETY: the context outlives this call, the list is null terminated
        // and freed exactly once below.
        unsafe {
            let list = rusb::ffi::libusb_get_pollfds(self.bus.as_raw());
            if list.is_null() {
                return fds;
            }
            let mut i = 0;
            loop {
                let entry = *list.add(i);
                if entry.is_null() {
                    break;
                }
                let events = (*entry).events;
                fds.push(UsbPollFd {
                    fd: (*entry).fd,
                    readable: events & libc::POLLIN != 0,
                    writable: events & libc::POLLOUT != 0,
                });
                i += 1;
            }
            rusb::ffi::libusb_free_pollfds(list);
        }
        fds
    }

    /// Let libusb process whatever woke its descriptors, without blocking.
    pub fn handle_events(&mut self) {
        if let Err(e) = self.bus.handle_events(Some(Duration::ZERO)) {
            warn!("failed to handle usb events: {e}");
        }
    }
}

impl<B: UsbBus> UsbLights<B> {
    fn with_bus(bus: B, events: Receiver<HotplugEvent>, should_have_dev: bool) -> Self {
        Self {
            bus,
            handle: None,
            should_have_dev,
            events,
            _registration: None,
        }
    }

    fn open(&mut self) -> bool {
        match self.bus.open() {
            Some(handle) => {
                info!("keypad connected");
                self.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            info!("keypad disconnected");
        }
    }

    /// Act on queued hotplug events. Returns whether there were any.
    fn drain_hotplug(&mut self, state: &SharedState, config: &Config) -> bool {
        let mut drained = false;
        while let Ok(event) = self.events.try_recv() {
            drained = true;
            debug!(?event, "usb hotplug");
            self.close();
            match event {
                HotplugEvent::Arrived => {
                    self.should_have_dev = true;
                    if self.open() {
                        self.resync(state, config);
                    }
                }
                HotplugEvent::Left => self.should_have_dev = false,
            }
        }
        drained
    }
}

fn send_batch<H: UsbHandle>(handle: &mut H, batch: &[Command]) -> Result<(), UsbError> {
    let (config, interfaces) = handle.first_config().map_err(UsbError::ConfigDescriptor)?;
    let mut guard = InterfaceGuard { handle, interfaces, claimed: false };

    for i in 0..guard.interfaces.len() {
        let iface = guard.interfaces[i];
        if guard.handle.driver_active(iface).unwrap_or(false) {
            guard
                .handle
                .detach_driver(iface)
                .map_err(|source| UsbError::DetachDriver { iface, source })?;
        }
    }

    guard.handle.set_configuration(config).map_err(UsbError::SetConfiguration)?;
    guard
        .handle
        .claim(INTERFACE)
        .map_err(|source| UsbError::ClaimInterface { iface: INTERFACE, source })?;
    guard.claimed = true;

    for (index, cmd) in batch.iter().enumerate() {
        let mut buf = *cmd;
        guard
            .handle
            .control_out(REQ_OUT, LIBUSB_REQUEST_SET_CONFIGURATION, W_VALUE, W_INDEX, &buf)
            .map_err(|source| UsbError::TransferOut { index, source })?;
        // The vendor tool reads back after every command and the device expects it
        guard
            .handle
            .control_in(REQ_IN, LIBUSB_REQUEST_CLEAR_FEATURE, W_VALUE, W_INDEX, &mut buf)
            .map_err(|source| UsbError::TransferIn { index, source })?;
    }

    Ok(())
}

impl<B: UsbBus> Lights for UsbLights<B> {
    fn resync(&mut self, state: &SharedState, config: &Config) {
        let Some(handle) = &mut self.handle else {
            return;
        };

        let batch = build_batch(state, config);
        debug!(layout = state.layout(), "resyncing lights");
        if let Err(e) = send_batch(handle, &batch) {
            error!("lighting resync failed: {e}");
            self.close();
        }
    }

    fn service(&mut self, state: &SharedState, config: &Config) {
        // A connection lost while handling hotplug is retried next time
        let drained = self.drain_hotplug(state, config);
        if !drained && self.should_have_dev && self.handle.is_none() && self.open() {
            self.resync(state, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::proc::tests::program;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Detach(u8),
        Attach(u8),
        SetConfig(u8),
        Claim(u8),
        Release(u8),
        Out(usize),
        In(usize),
    }

    #[derive(Default)]
    struct Keypad {
        present: bool,
        opens: usize,
        /// Index of the outbound transfer that fails, counted per handle
        fail_out_at: Option<usize>,
        ops: Vec<Op>,
    }

    #[derive(Clone, Default)]
    struct FakeBus(Rc<RefCell<Keypad>>);

    struct FakeHandle {
        keypad: Rc<RefCell<Keypad>>,
        attached: BTreeSet<u8>,
        outs: usize,
        ins: usize,
    }

    impl FakeHandle {
        fn log(&self, op: Op) {
            self.keypad.borrow_mut().ops.push(op);
        }
    }

    impl UsbBus for FakeBus {
        type Handle = FakeHandle;

        fn open(&self) -> Option<FakeHandle> {
            let mut keypad = self.0.borrow_mut();
            if !keypad.present {
                return None;
            }
            keypad.opens += 1;
            Some(FakeHandle {
                keypad: self.0.clone(),
                attached: BTreeSet::from([0, 1, 2]),
                outs: 0,
                ins: 0,
            })
        }
    }

    impl UsbHandle for FakeHandle {
        fn first_config(&mut self) -> rusb::Result<(u8, Vec<u8>)> {
            Ok((1, vec![0, 1, 2]))
        }

        fn driver_active(&mut self, iface: u8) -> rusb::Result<bool> {
            Ok(self.attached.contains(&iface))
        }

        fn detach_driver(&mut self, iface: u8) -> rusb::Result<()> {
            self.attached.remove(&iface);
            self.log(Op::Detach(iface));
            Ok(())
        }

        fn attach_driver(&mut self, iface: u8) -> rusb::Result<()> {
            self.attached.insert(iface);
            self.log(Op::Attach(iface));
            Ok(())
        }

        fn set_configuration(&mut self, config: u8) -> rusb::Result<()> {
            self.log(Op::SetConfig(config));
            Ok(())
        }

        fn claim(&mut self, iface: u8) -> rusb::Result<()> {
            self.log(Op::Claim(iface));
            Ok(())
        }

        fn release(&mut self, iface: u8) -> rusb::Result<()> {
            self.log(Op::Release(iface));
            Ok(())
        }

        fn control_out(&mut self, request_type: u8, request: u8, _value: u16, _index: u16, buf: &[u8]) -> rusb::Result<usize> {
            assert_eq!((request_type, request), (REQ_OUT, LIBUSB_REQUEST_SET_CONFIGURATION));
            let n = self.outs;
            self.outs += 1;
            if self.keypad.borrow().fail_out_at == Some(n) {
                return Err(rusb::Error::Io);
            }
            self.log(Op::Out(n));
            Ok(buf.len())
        }

        fn control_in(&mut self, request_type: u8, request: u8, _value: u16, _index: u16, buf: &mut [u8]) -> rusb::Result<usize> {
            assert_eq!((request_type, request), (REQ_IN, LIBUSB_REQUEST_CLEAR_FEATURE));
            let n = self.ins;
            self.ins += 1;
            self.log(Op::In(n));
            Ok(buf.len())
        }
    }

    fn active() -> (SharedState, Config) {
        let mut state = SharedState::new();
        state.set_program(Some(0), Some(100));
        state.set_layout(1);
        let config = Config {
            programs: vec![program("editor", &[], &["/usr/bin/editor"], 2)],
            ..Config::default()
        };
        (state, config)
    }

    fn connected(bus: &FakeBus) -> (UsbLights<FakeBus>, Sender<HotplugEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut lights = UsbLights::with_bus(bus.clone(), rx, false);
        tx.send(HotplugEvent::Arrived).unwrap();
        let (state, config) = active();
        lights.service(&state, &config);
        (lights, tx)
    }

    fn outs(ops: &[Op]) -> Vec<usize> {
        ops.iter()
            .filter_map(|op| match op {
                Op::Out(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn request_types() {
        assert_eq!(REQ_OUT, 0x21);
        assert_eq!(REQ_IN, 0xa1);
        assert_eq!(LIBUSB_REQUEST_SET_CONFIGURATION, 0x09);
        assert_eq!(LIBUSB_REQUEST_CLEAR_FEATURE, 0x01);
    }

    #[test]
    fn arrival_sends_full_batch_and_restores_drivers() {
        let bus = FakeBus::default();
        bus.0.borrow_mut().present = true;
        let (lights, _tx) = connected(&bus);

        assert!(lights.handle.is_some());
        let ops = bus.0.borrow().ops.clone();
        let mut expected = vec![Op::Detach(0), Op::Detach(1), Op::Detach(2), Op::SetConfig(1), Op::Claim(2)];
        for n in 0..5 {
            expected.push(Op::Out(n));
            expected.push(Op::In(n));
        }
        expected.extend([Op::Release(2), Op::Attach(0), Op::Attach(1), Op::Attach(2)]);
        assert_eq!(ops, expected);
    }

    #[test]
    fn failed_transfer_aborts_batch_and_cleans_up() {
        let bus = FakeBus::default();
        {
            let mut keypad = bus.0.borrow_mut();
            keypad.present = true;
            keypad.fail_out_at = Some(2);
        }
        let (lights, _tx) = connected(&bus);

        let ops = bus.0.borrow().ops.clone();
        assert_eq!(outs(&ops), vec![0, 1]);
        assert!(!ops.contains(&Op::In(2)));
        assert!(ops.ends_with(&[Op::Release(2), Op::Attach(0), Op::Attach(1), Op::Attach(2)]));
        assert!(lights.handle.is_none());
    }

    #[test]
    fn next_service_reconnects_after_failure() {
        let bus = FakeBus::default();
        {
            let mut keypad = bus.0.borrow_mut();
            keypad.present = true;
            keypad.fail_out_at = Some(0);
        }
        let (mut lights, _tx) = connected(&bus);
        assert!(lights.handle.is_none());
        assert_eq!(bus.0.borrow().opens, 1);

        {
            let mut keypad = bus.0.borrow_mut();
            keypad.fail_out_at = None;
            keypad.ops.clear();
        }
        let (state, config) = active();
        lights.service(&state, &config);

        assert!(lights.handle.is_some());
        assert_eq!(bus.0.borrow().opens, 2);
        assert_eq!(outs(&bus.0.borrow().ops), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn departure_stops_reconnects() {
        let bus = FakeBus::default();
        bus.0.borrow_mut().present = true;
        let (mut lights, tx) = connected(&bus);
        assert_eq!(bus.0.borrow().opens, 1);

        tx.send(HotplugEvent::Left).unwrap();
        let (state, config) = active();
        lights.service(&state, &config);
        assert!(lights.handle.is_none());

        lights.service(&state, &config);
        assert_eq!(bus.0.borrow().opens, 1);
    }

    #[test]
    fn resync_without_device_is_noop() {
        let bus = FakeBus::default();
        let (tx, rx) = mpsc::channel();
        let mut lights = UsbLights::with_bus(bus.clone(), rx, false);
        let (state, config) = active();

        lights.resync(&state, &config);
        tx.send(HotplugEvent::Arrived).unwrap();
        lights.service(&state, &config);

        assert!(lights.handle.is_none());
        assert!(bus.0.borrow().ops.is_empty());
    }

    #[test]
    fn pollfd_changes_track_opened_devices() {
        let event = UsbPollFd { fd: 5, readable: true, writable: false };
        let timer = UsbPollFd { fd: 6, readable: true, writable: false };
        let device = UsbPollFd { fd: 9, readable: false, writable: true };

        let (added, removed) = pollfd_changes(&[event, timer], &[event, timer, device]);
        assert_eq!(added, vec![device]);
        assert!(removed.is_empty());

        let (added, removed) = pollfd_changes(&[event, timer, device], &[event, timer]);
        assert!(added.is_empty());
        assert_eq!(removed, vec![device]);

        let both = UsbPollFd { writable: true, ..event };
        let (added, removed) = pollfd_changes(&[event], &[both]);
        assert_eq!(added, vec![both]);
        assert_eq!(removed, vec![event]);
    }
}
