//! Per-device command session
//!
//! A [`DeviceSession`] owns the runtime state for one paired pedal: the
//! capability table built by probing at open, the patch geometry the device
//! reports, and cached command frames. Commands are framed as
//! `F0 52 00 <deviceID> <payload…> F7` with the device id being the family
//! code learned at discovery.
//!
//! Transport failures never propagate out of a session operation: a device
//! being unplugged mid-session is an expected condition, so sends degrade
//! to logged no-ops and request/reply resolves to "no reply".

use crate::config::SessionConfig;
use crate::discovery::DeviceDescription;
use crate::midi;
use crate::patch::Patch;
use crate::sysex;
use crate::transport::Transport;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

/// Command bytes of the pedal dialect, reverse-engineered from traffic
mod command {
    /// Legacy-family current patch request
    pub const REQUEST_CURRENT_PATCH_LEGACY: &[u8] = &[0x29];
    /// Legacy-family current patch dump (reply and upload command)
    pub const CURRENT_PATCH_LEGACY_DUMP: &[u8] = &[0x28];
    /// Newer-family current patch request
    pub const REQUEST_CURRENT_PATCH: &[u8] = &[0x64, 0x13];
    /// Newer-family current patch dump (reply and upload command)
    pub const CURRENT_PATCH_DUMP: &[u8] = &[0x64, 0x12];
    /// Bank/patch metadata request
    pub const REQUEST_BANK_INFO: &[u8] = &[0x44];
    /// Bank/patch metadata reply
    pub const BANK_INFO: &[u8] = &[0x43];
    /// Memory-slot patch request prefix, both families
    pub const REQUEST_SLOT_PATCH: &[u8] = &[0x09, 0x00, 0x00];
    /// Legacy-family slot patch dump
    pub const SLOT_PATCH_LEGACY_DUMP: &[u8] = &[0x08];
    /// Newer-family slot patch dump (reply and upload command)
    pub const SLOT_PATCH_DUMP: &[u8] = &[0x45, 0x00];
}

/// Commands whose support is probed per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    /// Legacy current-patch request (`29`)
    CurrentPatchLegacy,
    /// Newer current-patch request (`64 13`)
    CurrentPatchChunked,
    /// Bank/patch metadata request (`44`)
    BankInfo,
    /// Memory-slot patch request (`09 00 00 …`)
    SlotPatch,
}

/// Probe order at session open
const PROBE_ORDER: [CommandKey; 4] = [
    CommandKey::CurrentPatchLegacy,
    CommandKey::CurrentPatchChunked,
    CommandKey::BankInfo,
    CommandKey::SlotPatch,
];

/// Known support state for a command
///
/// There is deliberately no negative state: a timeout proves nothing, so an
/// unanswered probe leaves the entry `Unknown` and a later successful reply
/// may still flip it to `Supported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Support {
    #[default]
    Unknown,
    Supported,
}

/// Per-session capability table
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<CommandKey, Support>,
}

impl CapabilityTable {
    pub fn get(&self, key: CommandKey) -> Support {
        self.entries.get(&key).copied().unwrap_or_default()
    }

    pub fn is_supported(&self, key: CommandKey) -> bool {
        self.get(key) == Support::Supported
    }

    fn mark_supported(&mut self, key: CommandKey) {
        self.entries.insert(key, Support::Supported);
    }
}

/// Patch storage geometry reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGeometry {
    /// Total patch slots
    pub patch_count: u16,
    /// Bytes per stored patch
    pub patch_bytes: u16,
    /// Slots per bank
    pub patches_per_bank: u16,
}

impl PatchGeometry {
    /// Parse the metadata reply: three 7-bit little-endian pairs after the
    /// command byte
    fn parse(reply: &[u8]) -> Option<Self> {
        if reply.len() < 12 {
            return None;
        }
        let pair = |lo: u8, hi: u8| (lo & 0x7F) as u16 | ((hi & 0x7F) as u16) << 7;
        Some(Self {
            patch_count: pair(reply[5], reply[6]),
            patch_bytes: pair(reply[7], reply[8]),
            patches_per_bank: pair(reply[9], reply[10]),
        })
    }
}

/// Bitwise complement of CRC-32 over the patch bytes, split into five 7-bit
/// groups, low group first
fn upload_checksum(data: &[u8]) -> [u8; 5] {
    let crc = !crc32fast::hash(data);
    [
        (crc & 0x7F) as u8,
        ((crc >> 7) & 0x7F) as u8,
        ((crc >> 14) & 0x7F) as u8,
        ((crc >> 21) & 0x7F) as u8,
        ((crc >> 28) & 0x0F) as u8,
    ]
}

/// Open session with one paired device
pub struct DeviceSession<T: Transport + ?Sized> {
    transport: Arc<T>,
    description: DeviceDescription,
    device_id: u8,
    config: SessionConfig,
    capabilities: Mutex<CapabilityTable>,
    geometry: Mutex<Option<PatchGeometry>>,
    /// Command frames cached by total length
    frame_cache: Mutex<HashMap<usize, Vec<u8>>>,
    /// FIFO one-at-a-time gate over patch operations
    gate: tokio::sync::Mutex<()>,
    opened_input: bool,
    opened_output: bool,
    closed: AtomicBool,
}

impl<T: Transport + ?Sized> DeviceSession<T> {
    /// Open a session and probe the device's command dialect
    ///
    /// Fails for descriptions paired by name only: without an identity
    /// there is no device id to frame commands with.
    pub async fn open(
        transport: Arc<T>,
        description: DeviceDescription,
        config: SessionConfig,
    ) -> Result<Self> {
        let device_id = description.device_id().with_context(|| {
            format!(
                "cannot open session on {:?}: device was paired by name and reported no identity",
                description.input_name
            )
        })?;

        let opened_input = !transport.is_input_open(&description.input_id);
        if opened_input {
            transport
                .open_input(&description.input_id)
                .with_context(|| format!("opening input port {:?}", description.input_name))?;
        }
        let opened_output = !transport.is_output_open(&description.output_id);
        if opened_output {
            transport
                .open_output(&description.output_id)
                .with_context(|| format!("opening output port {:?}", description.output_name))?;
        }

        let session = Self {
            transport,
            device_id,
            config,
            capabilities: Mutex::new(CapabilityTable::default()),
            geometry: Mutex::new(None),
            frame_cache: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
            opened_input,
            opened_output,
            closed: AtomicBool::new(false),
            description,
        };

        info!(device = %session.description.display_name(), "session opened, probing capabilities");
        for key in PROBE_ORDER {
            session.run_probe(key).await;
        }
        Ok(session)
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    /// Snapshot of the capability table
    pub fn capabilities(&self) -> CapabilityTable {
        self.capabilities.lock().clone()
    }

    /// Geometry learned from the metadata probe, if the device answered
    pub fn geometry(&self) -> Option<PatchGeometry> {
        *self.geometry.lock()
    }

    /// Close the ports this session opened; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.opened_input {
            self.transport.close_input(&self.description.input_id);
        }
        if self.opened_output {
            self.transport.close_output(&self.description.output_id);
        }
        info!(device = %self.description.display_name(), "session closed");
    }

    /// Frame and send a command; failures are logged, never raised
    ///
    /// The output port being gone is an expected condition: the device may
    /// have been unplugged mid-session.
    pub fn send_command(&self, payload: &[u8]) {
        if !self.transport.is_output_open(&self.description.output_id) {
            warn!(
                port = %self.description.output_name,
                "output port not open, dropping command"
            );
            return;
        }
        let frame = self.frame_command(payload);
        trace!(bytes = %midi::format_hex(&frame), "send");
        if let Err(err) = self.transport.send(&self.description.output_id, &frame) {
            warn!(port = %self.description.output_name, %err, "command send failed");
        }
    }

    /// Send a framed command and wait for the first reply on this device's
    /// input satisfying `matches`, or `None` at the timeout
    ///
    /// The transient receive subscription is dropped on both paths, so no
    /// listener survives resolution.
    pub async fn send_command_and_get_reply(
        &self,
        payload: &[u8],
        matches: impl Fn(&[u8]) -> bool,
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        let mut rx = self.transport.subscribe();
        self.send_command(payload);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.port == self.description.input_id && matches(&event.data) {
                        trace!(bytes = %midi::format_hex(&event.data), "reply");
                        return Some(event.data);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "receive stream lagged waiting for reply");
                }
                Ok(Err(RecvError::Closed)) => return None,
                Err(_) => {
                    debug!(
                        bytes = %midi::format_hex(payload),
                        "no reply before timeout"
                    );
                    return None;
                }
            }
        }
    }

    /// Re-probe one command; a reply upgrades it to `Supported`
    pub async fn refresh_capability(&self, key: CommandKey) -> Support {
        let _gate = self.gate.lock().await;
        self.run_probe(key).await
    }

    /// Request the edit-buffer patch, picking the command family the
    /// capability table knows about
    pub async fn request_current_patch(&self) -> Option<Patch> {
        let _gate = self.gate.lock().await;
        let timeout = self.config.reply_timeout();

        if self.uses_chunked_family() {
            let reply = self
                .send_command_and_get_reply(
                    command::REQUEST_CURRENT_PATCH,
                    self.reply_matcher(command::CURRENT_PATCH_DUMP),
                    timeout,
                )
                .await?;
            let data = sysex::seven_to_eight(&reply, 6, reply.len() - 1);
            Some(Patch::decode(&data))
        } else {
            let reply = self
                .send_command_and_get_reply(
                    command::REQUEST_CURRENT_PATCH_LEGACY,
                    self.reply_matcher(command::CURRENT_PATCH_LEGACY_DUMP),
                    timeout,
                )
                .await?;
            let data = sysex::seven_to_eight(&reply, 5, reply.len() - 1);
            Some(Patch::decode(&data))
        }
    }

    /// Request the patch stored in a memory slot
    pub async fn request_patch_from_slot(&self, bank: u16, program: u16) -> Option<Patch> {
        let _gate = self.gate.lock().await;
        let timeout = self.config.reply_timeout();

        if self.uses_chunked_family() {
            let mut payload = command::REQUEST_SLOT_PATCH.to_vec();
            push_pair(&mut payload, bank);
            push_pair(&mut payload, program);
            let reply = self
                .send_command_and_get_reply(
                    &payload,
                    self.reply_matcher(command::SLOT_PATCH_DUMP),
                    timeout,
                )
                .await?;
            // 45 00 <bank ×2> <program ×2> <length ×2> <data…> <crc ×5>
            if reply.len() < 18 {
                warn!(len = reply.len(), "slot dump too short");
                return None;
            }
            let data = sysex::seven_to_eight(&reply, 12, reply.len() - 6);
            Some(Patch::decode(&data))
        } else {
            let slot = self.flat_slot(bank, program);
            let mut payload = command::REQUEST_SLOT_PATCH.to_vec();
            payload.push((slot & 0x7F) as u8);
            let reply = self
                .send_command_and_get_reply(
                    &payload,
                    self.reply_matcher(command::SLOT_PATCH_LEGACY_DUMP),
                    timeout,
                )
                .await?;
            // 08 00 00 <slot> <data…>
            if reply.len() < 10 {
                warn!(len = reply.len(), "slot dump too short");
                return None;
            }
            let data = sysex::seven_to_eight(&reply, 8, reply.len() - 1);
            Some(Patch::decode(&data))
        }
    }

    /// Replace the edit-buffer patch
    pub async fn upload_current_patch(&self, patch_bytes: &[u8]) {
        let _gate = self.gate.lock().await;

        let mut payload = if self.uses_chunked_family() {
            command::CURRENT_PATCH_DUMP.to_vec()
        } else {
            command::CURRENT_PATCH_LEGACY_DUMP.to_vec()
        };
        payload.extend_from_slice(&sysex::eight_to_seven(patch_bytes, 0, patch_bytes.len()));
        self.send_command(&payload);
    }

    /// Write a patch into a memory slot (newer command family)
    ///
    /// The buffer is zero-padded or truncated to the geometry-reported
    /// patch length before the checksum and 7-bit conversion.
    pub async fn upload_patch_to_slot(&self, patch_bytes: &[u8], bank: u16, program: u16) {
        let _gate = self.gate.lock().await;

        let mut data = patch_bytes.to_vec();
        if let Some(geometry) = *self.geometry.lock() {
            let target = geometry.patch_bytes as usize;
            if data.len() != target {
                debug!(
                    from = data.len(),
                    to = target,
                    "resizing patch to device geometry"
                );
                data.resize(target, 0);
            }
        }

        let checksum = upload_checksum(&data);
        let mut payload = command::SLOT_PATCH_DUMP.to_vec();
        push_pair(&mut payload, bank);
        push_pair(&mut payload, program);
        push_pair(&mut payload, data.len() as u16);
        payload.extend_from_slice(&sysex::eight_to_seven(&data, 0, data.len()));
        payload.extend_from_slice(&checksum);
        self.send_command(&payload);
    }

    fn uses_chunked_family(&self) -> bool {
        self.capabilities
            .lock()
            .is_supported(CommandKey::CurrentPatchChunked)
    }

    fn flat_slot(&self, bank: u16, program: u16) -> u16 {
        match *self.geometry.lock() {
            Some(geometry) if geometry.patches_per_bank > 0 => {
                bank * geometry.patches_per_bank + program
            }
            _ => program,
        }
    }

    fn frame_command(&self, payload: &[u8]) -> Vec<u8> {
        let total = payload.len() + 5;
        let mut cache = self.frame_cache.lock();
        let buf = cache.entry(total).or_insert_with(|| {
            let mut frame = vec![0u8; total];
            frame[0] = midi::SYSEX_START;
            frame[1] = midi::ZOOM_MANUFACTURER_ID;
            frame[2] = 0x00;
            frame[3] = self.device_id;
            frame[total - 1] = midi::SYSEX_END;
            frame
        });
        buf[4..total - 1].copy_from_slice(payload);
        buf.clone()
    }

    fn reply_matcher(&self, prefix: &'static [u8]) -> impl Fn(&[u8]) -> bool {
        let device_id = self.device_id;
        move |data: &[u8]| {
            data.len() > 5 + prefix.len()
                && data[0] == midi::SYSEX_START
                && data[1] == midi::ZOOM_MANUFACTURER_ID
                && data[2] == 0x00
                && data[3] == device_id
                && data[data.len() - 1] == midi::SYSEX_END
                && data[4..4 + prefix.len()] == *prefix
        }
    }

    /// Run one capability probe
    ///
    /// Only an observed reply mutates the table; a timeout leaves the
    /// current state in place.
    async fn run_probe(&self, key: CommandKey) -> Support {
        let timeout = self.config.probe_timeout();
        let reply = match key {
            CommandKey::CurrentPatchLegacy => {
                self.send_command_and_get_reply(
                    command::REQUEST_CURRENT_PATCH_LEGACY,
                    self.reply_matcher(command::CURRENT_PATCH_LEGACY_DUMP),
                    timeout,
                )
                .await
            }
            CommandKey::CurrentPatchChunked => {
                self.send_command_and_get_reply(
                    command::REQUEST_CURRENT_PATCH,
                    self.reply_matcher(command::CURRENT_PATCH_DUMP),
                    timeout,
                )
                .await
            }
            CommandKey::BankInfo => {
                let reply = self
                    .send_command_and_get_reply(
                        command::REQUEST_BANK_INFO,
                        self.reply_matcher(command::BANK_INFO),
                        timeout,
                    )
                    .await;
                if let Some(reply) = &reply {
                    match PatchGeometry::parse(reply) {
                        Some(geometry) => {
                            info!(
                                patches = geometry.patch_count,
                                bytes = geometry.patch_bytes,
                                per_bank = geometry.patches_per_bank,
                                "patch geometry learned"
                            );
                            *self.geometry.lock() = Some(geometry);
                        }
                        None => warn!("metadata reply too short for geometry"),
                    }
                }
                reply
            }
            CommandKey::SlotPatch => {
                let mut payload = command::REQUEST_SLOT_PATCH.to_vec();
                if self.uses_chunked_family() {
                    push_pair(&mut payload, 0);
                    push_pair(&mut payload, 0);
                } else {
                    payload.push(0);
                }
                let legacy = self.reply_matcher(command::SLOT_PATCH_LEGACY_DUMP);
                let chunked = self.reply_matcher(command::SLOT_PATCH_DUMP);
                self.send_command_and_get_reply(
                    &payload,
                    move |data| legacy(data) || chunked(data),
                    timeout,
                )
                .await
            }
        };

        match reply {
            Some(_) => {
                debug!(?key, "probe answered");
                self.capabilities.lock().mark_supported(key);
                Support::Supported
            }
            None => self.capabilities.lock().get(key),
        }
    }
}

impl<T: Transport + ?Sized> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Append a value as a 7-bit little-endian pair
fn push_pair(payload: &mut Vec<u8>, value: u16) {
    payload.push((value & 0x7F) as u8);
    payload.push(((value >> 7) & 0x7F) as u8);
}
