//! MIDI transport abstraction
//!
//! Discovery and sessions talk to the MIDI system only through the
//! [`Transport`] trait: named ports, open/close, send, and two broadcast
//! event streams (received bytes, connect/disconnect). Subscriptions are
//! `tokio::sync::broadcast` receivers; the receiver is the cancellation
//! handle and dropping it unsubscribes, so a request/reply path can never
//! leave a stale listener behind.

use thiserror::Error;
use tokio::sync::broadcast;

pub mod midir;

pub use self::midir::MidirTransport;

/// Stable identifier for a port; the backend's port name
pub type PortId = String;

/// One enumerated MIDI port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Identifier used for open/close/send
    pub id: PortId,
    /// Human-readable name (for the midir backend, identical to the id)
    pub name: String,
}

/// Bytes received on an open input port
#[derive(Debug, Clone)]
pub struct MidiEvent {
    /// Port the message arrived on
    pub port: PortId,
    /// Raw message bytes
    pub data: Vec<u8>,
}

/// Port list change noticed by the backend
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A port appeared
    Connected { name: String },
    /// A port went away
    Disconnected { name: String },
}

/// Transport-level failures
///
/// These stay local to the call site: protocol code logs them with context
/// and treats the operation as yielding no result (a device being unplugged
/// mid-session is an expected runtime condition).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown port {0:?}")]
    UnknownPort(String),
    #[error("port {0:?} is not open")]
    NotOpen(String),
    #[error("midi backend: {0}")]
    Backend(String),
}

/// Contract the protocol layer consumes
pub trait Transport: Send + Sync {
    /// Currently visible input ports
    fn input_ports(&self) -> Vec<PortInfo>;

    /// Currently visible output ports
    fn output_ports(&self) -> Vec<PortInfo>;

    fn is_input_open(&self, port: &str) -> bool;

    fn is_output_open(&self, port: &str) -> bool;

    /// Open an input port; a no-op if it is already open
    fn open_input(&self, port: &str) -> Result<(), TransportError>;

    /// Open an output port; a no-op if it is already open
    fn open_output(&self, port: &str) -> Result<(), TransportError>;

    fn close_input(&self, port: &str);

    fn close_output(&self, port: &str);

    /// Send raw bytes to an open output port
    fn send(&self, port: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Receive stream covering every open input
    ///
    /// Dropping the receiver is the unsubscribe.
    fn subscribe(&self) -> broadcast::Receiver<MidiEvent>;

    /// Connect/disconnect notifications
    fn subscribe_hotplug(&self) -> broadcast::Receiver<HotplugEvent>;
}
