//! Error types for each subsystem of the daemon.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A key sequence string could not be turned into key codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("empty key sequence")]
    Empty,

    #[error("invalid key in combo {combo:?}: {key:?}")]
    UnknownKey { combo: String, key: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to create config directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write default config {path}: {source}")]
    WriteDefault { path: PathBuf, source: io::Error },

    #[error("failed to read config directory {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("failed to fetch device config: {0}")]
    ConfigDescriptor(rusb::Error),

    #[error("failed to detach kernel driver from interface {iface}: {source}")]
    DetachDriver { iface: u8, source: rusb::Error },

    #[error("failed to set device configuration: {0}")]
    SetConfiguration(rusb::Error),

    #[error("failed to claim interface {iface}: {source}")]
    ClaimInterface { iface: u8, source: rusb::Error },

    #[error("out control transfer {index} failed: {source}")]
    TransferOut { index: usize, source: rusb::Error },

    #[error("in control transfer {index} failed: {source}")]
    TransferIn { index: usize, source: rusb::Error },
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("uinput device not found; is the uinput module loaded? ({0})")]
    Create(io::Error),

    #[error("failed to set up virtual keyboard keys: {0}")]
    Capability(io::Error),

    #[error("failed to build virtual keyboard: {0}")]
    Build(io::Error),

    #[error("failed to send key code {code}: {source}")]
    Write { code: u16, source: io::Error },
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("failed to create readiness multiplexer: {0}")]
    Create(nix::Error),

    #[error("failed to register fd {fd}: {source}")]
    Register { fd: i32, source: nix::Error },

    #[error("wait on readiness multiplexer failed: {0}")]
    Wait(nix::Error),
}
