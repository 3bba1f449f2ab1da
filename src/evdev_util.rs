//! Evdev utilities: keypad discovery, exclusive grabs and non-blocking reads.

use evdev::{Device, EventType};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const INPUT_DIR: &str = "/dev/input";

/// Sets a device to non-blocking mode.
pub fn set_nonblocking(device: &Device) -> io::Result<()> {
    let fd = device.as_raw_fd();
    // SAFETY: fd is owned by `device` and stays open for the duration of the calls
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Opens every event node under `dir` whose USB id matches.
pub fn find_keypad_devices(dir: &Path, vendor: u16, product: u16) -> Vec<(PathBuf, Device)> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!(dir = %dir.display(), "failed to read input directory");
        return found;
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("event"))
        })
        .collect();
    paths.sort();

    for path in paths {
        // Permission errors are expected for unrelated devices
        let Ok(device) = Device::open(&path) else {
            continue;
        };
        let id = device.input_id();
        if id.vendor() == vendor && id.product() == product {
            found.push((path, device));
        }
    }
    found
}

/// A grabbed keypad event node.
pub struct KeypadDevice {
    device: Device,
    path: PathBuf,
}

impl KeypadDevice {
    /// Grab the device exclusively and switch it to non-blocking reads.
    pub fn open(path: PathBuf, mut device: Device) -> io::Result<Self> {
        device.grab()?;
        set_nonblocking(&device)?;
        debug!(path = %path.display(), "grabbed keypad");
        Ok(Self { device, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every pending key event. `WouldBlock` ends the batch quietly.
    pub fn drain<F>(&mut self, mut callback: F) -> io::Result<()>
    where
        F: FnMut(u16, i32),
    {
        match self.device.fetch_events() {
            Ok(events) => {
                for ev in events.filter(|ev| ev.event_type() == EventType::KEY) {
                    callback(ev.code(), ev.value());
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for KeypadDevice {
    fn drop(&mut self) {
        // Fails once the node is gone; closing the fd releases the grab anyway
        if let Err(e) = self.device.ungrab() {
            debug!(path = %self.path.display(), "ungrab failed: {e}");
        }
    }
}

impl AsRawFd for KeypadDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_finds_nothing() {
        let found = find_keypad_devices(Path::new("/nonexistent/input"), 0x1532, 0x0201);
        assert!(found.is_empty());
    }

    #[test]
    fn non_event_nodes_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("mouse0"), b"").unwrap();
        std::fs::write(tmp.path().join("event0"), b"not a device").unwrap();
        let found = find_keypad_devices(tmp.path(), 0x1532, 0x0201);
        assert!(found.is_empty());
    }
}
