//! zoomlink - protocol and codec layer for Zoom effects pedals
//!
//! Discovers pedals on a MIDI transport, negotiates each device's command
//! dialect, and codecs the proprietary binary patch format plus a chunked
//! container format for captured sysex traffic.
//!
//! The moving parts, leaves first:
//! - [`sysex`]: stateless 7-bit / 8-bit payload transforms
//! - [`patch`]: patch decode/encode for both wire layouts
//! - [`transport`]: port abstraction with a `midir` backend
//! - [`discovery`]: identity probing and input/output pairing
//! - [`session`]: per-device command protocol with capability probing
//! - [`container`]: capture/replay container format
//!
//! Embedding applications own the tracing subscriber; everything here logs
//! through `tracing` and raises only where a caller cannot continue.

pub mod config;
pub mod container;
pub mod device_ids;
pub mod discovery;
pub mod midi;
pub mod patch;
pub mod session;
pub mod sysex;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::AppConfig;
pub use container::{Container, ContainerFormat};
pub use discovery::{DeviceDescription, DeviceIdentity, DeviceScanner};
pub use patch::{ChunkedPatch, EffectSlot, LegacyPatch, Patch};
pub use session::{CapabilityTable, CommandKey, DeviceSession, PatchGeometry, Support};
pub use transport::{MidirTransport, Transport};
