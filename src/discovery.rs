//! Device discovery and pairing
//!
//! Walks the transport's port lists, probes every output with the MIDI
//! Identity Request and pairs each answering input/output into a
//! [`DeviceDescription`]. Probing is serial on purpose: several devices can
//! sit on one physical MIDI loop, and simultaneous replies to a broadcast
//! would be unattributable.

use crate::config::DiscoveryConfig;
use crate::device_ids;
use crate::midi::{self, IdentityReply};
use crate::transport::{PortId, PortInfo, Transport};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Identity learned from a device's Identity Reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Manufacturer id, 1 or 3 bytes
    pub manufacturer_id: Vec<u8>,
    /// Family code; the first byte doubles as the sysex device id
    pub family_code: [u8; 2],
    /// Model number within the family
    pub model_number: [u8; 2],
    /// Firmware version bytes
    pub firmware_version: [u8; 4],
    /// Manufacturer display name, when the id is known
    pub manufacturer_name: Option<&'static str>,
    /// Derived device display name
    pub device_name: String,
    /// Raw identity reply including the sysex envelope
    pub raw: Vec<u8>,
}

impl From<IdentityReply> for DeviceIdentity {
    fn from(reply: IdentityReply) -> Self {
        Self {
            manufacturer_name: device_ids::manufacturer_name(&reply.manufacturer_id),
            device_name: device_ids::device_name(&reply.manufacturer_id, reply.family_code),
            manufacturer_id: reply.manufacturer_id,
            family_code: reply.family_code,
            model_number: reply.model_number,
            firmware_version: reply.firmware_version,
            raw: reply.raw,
        }
    }
}

/// One paired device, produced by a scan
///
/// Immutable: a later scan produces fresh descriptions, and disconnection
/// discards them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub input_id: PortId,
    pub input_name: String,
    pub output_id: PortId,
    pub output_name: String,
    /// `None` when the device never answered the identity request and was
    /// paired by port name equality instead
    pub identity: Option<DeviceIdentity>,
}

impl DeviceDescription {
    /// Sysex device id used for command framing
    pub fn device_id(&self) -> Option<u8> {
        self.identity.as_ref().map(|id| id.family_code[0])
    }

    /// Best available display name
    pub fn display_name(&self) -> &str {
        self.identity
            .as_ref()
            .map(|id| id.device_name.as_str())
            .unwrap_or(&self.input_name)
    }
}

struct Candidate {
    input: PortInfo,
    output: PortInfo,
    identity: IdentityReply,
}

/// Port scanner and device pairer
///
/// All mutable scan state is owned by the instance; construct one per
/// transport and share it by handle.
pub struct DeviceScanner<T: Transport + ?Sized> {
    transport: Arc<T>,
    config: DiscoveryConfig,
    /// Rejects a scan requested while one is in flight
    scanning: AtomicBool,
    /// Depth of nested rescan triggers currently on the stack
    rescan_depth: AtomicU32,
}

/// Clears the busy flag / depth counter even when a scan errors out
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct DepthGuard<'a>(&'a AtomicU32);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Transport + ?Sized> DeviceScanner<T> {
    pub fn new(transport: Arc<T>, config: DiscoveryConfig) -> Self {
        Self {
            transport,
            config,
            scanning: AtomicBool::new(false),
            rescan_depth: AtomicU32::new(0),
        }
    }

    /// Scan all ports and pair devices
    ///
    /// Re-entrant invocation while a scan is running is refused: concurrent
    /// open/close would corrupt pairing state.
    pub async fn scan(&self) -> Result<Vec<DeviceDescription>> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            error!("device scan already running, refusing re-entrant scan");
            bail!("device scan already in progress");
        }
        let _guard = FlagGuard(&self.scanning);

        let inputs = self.transport.input_ports();
        let outputs = self.transport.output_ports();
        info!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            "scanning for devices"
        );

        // Open every input we can listen on, remembering which were ours
        let mut opened_inputs: Vec<PortId> = Vec::new();
        for port in &inputs {
            if !self.transport.is_input_open(&port.id) {
                match self.transport.open_input(&port.id) {
                    Ok(()) => opened_inputs.push(port.id.clone()),
                    Err(err) => warn!(port = %port.name, %err, "could not open input for scan"),
                }
            }
        }

        let mut rx = self.transport.subscribe();
        let timeout = self.config.identity_timeout();
        let mut opened_outputs: Vec<PortId> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        // One output at a time; the first reply on any open input wins
        for output in &outputs {
            if !self.transport.is_output_open(&output.id) {
                match self.transport.open_output(&output.id) {
                    Ok(()) => opened_outputs.push(output.id.clone()),
                    Err(err) => {
                        warn!(port = %output.name, %err, "could not open output for scan");
                        continue;
                    }
                }
            }
            if let Err(err) = self.transport.send(&output.id, &midi::IDENTITY_REQUEST) {
                warn!(port = %output.name, %err, "identity request failed");
                continue;
            }

            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Ok(event)) => {
                        let Some(reply) = IdentityReply::parse(&event.data) else {
                            continue;
                        };
                        let Some(input) = inputs.iter().find(|p| p.id == event.port) else {
                            continue;
                        };
                        debug!(
                            input = %input.name,
                            output = %output.name,
                            bytes = %midi::format_hex(&event.data),
                            "identity reply"
                        );
                        candidates.push(Candidate {
                            input: input.clone(),
                            output: output.clone(),
                            identity: reply,
                        });
                        break;
                    }
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        warn!(skipped, "receive stream lagged during scan");
                    }
                    Ok(Err(RecvError::Closed)) => break,
                    Err(_) => {
                        debug!(port = %output.name, "no identity reply");
                        break;
                    }
                }
            }
        }
        drop(rx);

        // A device on a shared loop answers several outputs through the one
        // input it owns; keep a single pairing per input
        let mut used_inputs: HashSet<PortId> = HashSet::new();
        let mut used_outputs: HashSet<PortId> = HashSet::new();
        let mut descriptions: Vec<DeviceDescription> = Vec::new();

        for candidate in &candidates {
            if used_inputs.contains(&candidate.input.id) {
                continue;
            }
            let group: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| c.input.id == candidate.input.id)
                .collect();
            let chosen = group
                .iter()
                .find(|c| c.output.name == c.input.name)
                .copied()
                .unwrap_or(group[0]);
            if group.len() > 1 {
                info!(
                    input = %chosen.input.name,
                    output = %chosen.output.name,
                    answered = group.len(),
                    "device answered on multiple outputs, deduplicated"
                );
            }

            used_inputs.insert(chosen.input.id.clone());
            used_outputs.insert(chosen.output.id.clone());
            let identity: DeviceIdentity = chosen.identity.clone().into();
            info!(
                device = %identity.device_name,
                input = %chosen.input.name,
                output = %chosen.output.name,
                firmware = %chosen.identity.firmware_string(),
                "device discovered"
            );
            descriptions.push(DeviceDescription {
                input_id: chosen.input.id.clone(),
                input_name: chosen.input.name.clone(),
                output_id: chosen.output.id.clone(),
                output_name: chosen.output.name.clone(),
                identity: Some(identity),
            });
        }

        // Ports already open before the scan stay open
        for id in &opened_outputs {
            self.transport.close_output(id);
        }
        for id in &opened_inputs {
            self.transport.close_input(id);
        }

        // Devices that never answer the identity request still pair when
        // their port names match exactly
        for input in &inputs {
            if used_inputs.contains(&input.id) {
                continue;
            }
            let Some(output) = outputs
                .iter()
                .find(|o| !used_outputs.contains(&o.id) && o.name == input.name)
            else {
                continue;
            };
            info!(port = %input.name, "paired by name, no identity reply");
            used_inputs.insert(input.id.clone());
            used_outputs.insert(output.id.clone());
            descriptions.push(DeviceDescription {
                input_id: input.id.clone(),
                input_name: input.name.clone(),
                output_id: output.id.clone(),
                output_name: output.name.clone(),
                identity: None,
            });
        }

        info!(devices = descriptions.len(), "scan complete");
        Ok(descriptions)
    }

    /// Depth-guarded scan for hotplug-driven rescans
    ///
    /// A rescan triggered from within a rescan's completion (connect and
    /// disconnect bursts re-trigger each other) is allowed only up to the
    /// configured depth; past it the request is refused, not queued.
    pub async fn rescan(&self) -> Option<Vec<DeviceDescription>> {
        let depth = self.rescan_depth.fetch_add(1, Ordering::SeqCst);
        let _guard = DepthGuard(&self.rescan_depth);
        if depth >= self.config.max_rescan_depth {
            error!(depth, "rescan depth limit reached, refusing rescan");
            return None;
        }

        match self.scan().await {
            Ok(devices) => Some(devices),
            // Already logged; a refused or failed rescan yields nothing
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;
    use std::time::Duration;

    fn config(timeout_ms: u64) -> DiscoveryConfig {
        DiscoveryConfig {
            identity_timeout_ms: timeout_ms,
            max_rescan_depth: 5,
        }
    }

    /// Identity reply bytes for an MS-50G, firmware 1.2.3.4
    fn ms50g_reply() -> Vec<u8> {
        vec![
            0xF0, 0x7E, 0x00, 0x06, 0x02, 0x52, 0x58, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04,
            0xF7,
        ]
    }

    #[tokio::test]
    async fn test_scan_pairs_answering_device() {
        let transport = MockTransport::new(&["A"], &["B"]);
        transport.reply_with(&midi::IDENTITY_REQUEST, "B", "A", &ms50g_reply());

        let scanner = DeviceScanner::new(transport.clone(), config(50));
        let devices = scanner.scan().await.unwrap();

        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.input_id, "A");
        assert_eq!(device.output_id, "B");
        let identity = device.identity.as_ref().unwrap();
        assert_eq!(identity.manufacturer_id, vec![0x52]);
        assert_eq!(identity.family_code, [0x58, 0x00]);
        assert_eq!(identity.device_name, "MS-50G");
        assert_eq!(device.device_id(), Some(0x58));
    }

    #[tokio::test]
    async fn test_scan_closes_only_ports_it_opened() {
        let transport = MockTransport::new(&["A"], &["B"]);
        transport.reply_with(&midi::IDENTITY_REQUEST, "B", "A", &ms50g_reply());
        transport.open_input("A").unwrap();

        let scanner = DeviceScanner::new(transport.clone(), config(50));
        scanner.scan().await.unwrap();

        // "A" was open before the scan and must stay open; "B" was not
        assert!(transport.is_input_open("A"));
        assert!(!transport.is_output_open("B"));
    }

    #[tokio::test]
    async fn test_multi_output_answers_deduplicated() {
        // One device loops back on outputs B and C, answering both through
        // its single input
        let transport = MockTransport::new(&["A"], &["B", "C"]);
        transport.reply_with(&midi::IDENTITY_REQUEST, "B", "A", &ms50g_reply());
        transport.reply_with(&midi::IDENTITY_REQUEST, "C", "A", &ms50g_reply());

        let scanner = DeviceScanner::new(transport.clone(), config(50));
        let devices = scanner.scan().await.unwrap();

        assert_eq!(devices.len(), 1);
        // No textual match, so the first answering output wins
        assert_eq!(devices[0].output_id, "B");
    }

    #[tokio::test]
    async fn test_dedup_prefers_matching_names() {
        let transport = MockTransport::new(&["Pedal"], &["Other", "Pedal"]);
        transport.reply_with(&midi::IDENTITY_REQUEST, "Other", "Pedal", &ms50g_reply());
        transport.reply_with(&midi::IDENTITY_REQUEST, "Pedal", "Pedal", &ms50g_reply());

        let scanner = DeviceScanner::new(transport.clone(), config(50));
        let devices = scanner.scan().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].output_name, "Pedal");
    }

    #[tokio::test]
    async fn test_no_shared_ports_across_descriptions() {
        let transport = MockTransport::new(&["A", "Quiet"], &["B", "C", "Quiet"]);
        transport.reply_with(&midi::IDENTITY_REQUEST, "B", "A", &ms50g_reply());
        transport.reply_with(&midi::IDENTITY_REQUEST, "C", "A", &ms50g_reply());

        let scanner = DeviceScanner::new(transport.clone(), config(50));
        let devices = scanner.scan().await.unwrap();

        let mut seen_inputs = HashSet::new();
        let mut seen_outputs = HashSet::new();
        for device in &devices {
            assert!(seen_inputs.insert(device.input_id.clone()));
            assert!(seen_outputs.insert(device.output_id.clone()));
        }
        // The silent name-matched pair is still discovered
        assert!(devices.iter().any(|d| d.input_name == "Quiet" && d.identity.is_none()));
    }

    #[tokio::test]
    async fn test_name_pairing_without_identity() {
        let transport = MockTransport::new(&["Zoom MS-50G"], &["Zoom MS-50G", "Unrelated"]);

        let scanner = DeviceScanner::new(transport.clone(), config(10));
        let devices = scanner.scan().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].input_name, "Zoom MS-50G");
        assert_eq!(devices[0].output_name, "Zoom MS-50G");
        assert!(devices[0].identity.is_none());
        assert_eq!(devices[0].device_id(), None);
        assert_eq!(devices[0].display_name(), "Zoom MS-50G");
    }

    #[tokio::test]
    async fn test_reentrant_scan_refused() {
        // No reply rules: the scan sits in the identity timeout long enough
        // for a second scan to collide with it
        let transport = MockTransport::new(&["A"], &["B"]);
        let scanner = Arc::new(DeviceScanner::new(transport, config(200)));

        let background = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.scan().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(scanner.scan().await.is_err());
        assert!(background.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rescan_depth_limit() {
        let transport = MockTransport::new(&[], &[]);
        let scanner = DeviceScanner::new(
            transport,
            DiscoveryConfig {
                identity_timeout_ms: 10,
                max_rescan_depth: 0,
            },
        );

        // Depth 0 means every nested rescan is past the limit
        assert!(scanner.rescan().await.is_none());
    }

    #[tokio::test]
    async fn test_rescan_depth_unwinds() {
        let transport = MockTransport::new(&[], &[]);
        let scanner = DeviceScanner::new(
            transport,
            DiscoveryConfig {
                identity_timeout_ms: 10,
                max_rescan_depth: 1,
            },
        );

        // Sequential rescans are not nested; each one must succeed
        assert!(scanner.rescan().await.is_some());
        assert!(scanner.rescan().await.is_some());
    }
}
