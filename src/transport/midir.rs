//! midir-backed transport
//!
//! Production implementation of [`Transport`] over the `midir` crate.
//! Connections are held per port name; input callbacks forward raw bytes
//! into the shared broadcast channel. midir has no hotplug notification
//! API, so a polling watcher diffs the port lists and emits
//! connect/disconnect events.

use super::{HotplugEvent, MidiEvent, PortInfo, Transport, TransportError};
use ::midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Buffered events per subscriber before older ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// midir-backed [`Transport`]
pub struct MidirTransport {
    /// Client name announced to the MIDI system
    client_name: String,
    /// Open input connections by port name
    inputs: Mutex<HashMap<String, MidiInputConnection<()>>>,
    /// Open output connections by port name
    outputs: Mutex<HashMap<String, MidiOutputConnection>>,
    /// Fan-out for received bytes
    event_tx: broadcast::Sender<MidiEvent>,
    /// Fan-out for port list changes
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl MidirTransport {
    pub fn new(client_name: &str) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (hotplug_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            client_name: client_name.to_string(),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            event_tx,
            hotplug_tx,
        })
    }

    fn scanner_input(&self) -> Result<MidiInput, TransportError> {
        MidiInput::new(&format!("{}-scan", self.client_name))
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    fn scanner_output(&self) -> Result<MidiOutput, TransportError> {
        MidiOutput::new(&format!("{}-scan", self.client_name))
            .map_err(|e| TransportError::Backend(e.to_string()))
    }

    /// Start the hotplug watcher task
    ///
    /// Polls the port lists on `interval`, emitting one event per
    /// appeared/vanished port name. The task runs until the transport is
    /// dropped.
    pub fn watch_hotplug(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let transport = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut known: HashSet<String> = HashSet::new();
            let mut first = true;

            loop {
                tokio::time::sleep(interval).await;
                let Some(transport) = transport.upgrade() else {
                    debug!("transport dropped, hotplug watcher exiting");
                    return;
                };

                let mut current = HashSet::new();
                for port in transport.input_ports() {
                    current.insert(port.name);
                }
                for port in transport.output_ports() {
                    current.insert(port.name);
                }

                if !first {
                    for name in current.difference(&known) {
                        info!(port = %name, "MIDI port connected");
                        let _ = transport.hotplug_tx.send(HotplugEvent::Connected {
                            name: name.clone(),
                        });
                    }
                    for name in known.difference(&current) {
                        info!(port = %name, "MIDI port disconnected");
                        let _ = transport.hotplug_tx.send(HotplugEvent::Disconnected {
                            name: name.clone(),
                        });
                    }
                }
                known = current;
                first = false;
            }
        })
    }
}

impl Transport for MidirTransport {
    fn input_ports(&self) -> Vec<PortInfo> {
        let Ok(midi_in) = self.scanner_input() else {
            error!("failed to create MIDI input scanner");
            return Vec::new();
        };
        midi_in
            .ports()
            .iter()
            .filter_map(|port| midi_in.port_name(port).ok())
            .map(|name| PortInfo {
                id: name.clone(),
                name,
            })
            .collect()
    }

    fn output_ports(&self) -> Vec<PortInfo> {
        let Ok(midi_out) = self.scanner_output() else {
            error!("failed to create MIDI output scanner");
            return Vec::new();
        };
        midi_out
            .ports()
            .iter()
            .filter_map(|port| midi_out.port_name(port).ok())
            .map(|name| PortInfo {
                id: name.clone(),
                name,
            })
            .collect()
    }

    fn is_input_open(&self, port: &str) -> bool {
        self.inputs.lock().contains_key(port)
    }

    fn is_output_open(&self, port: &str) -> bool {
        self.outputs.lock().contains_key(port)
    }

    fn open_input(&self, port: &str) -> Result<(), TransportError> {
        if self.is_input_open(port) {
            return Ok(());
        }

        let midi_in = MidiInput::new(&format!("{}-in", self.client_name))
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let in_port = midi_in
            .ports()
            .into_iter()
            .find(|p| midi_in.port_name(p).map(|n| n == port).unwrap_or(false))
            .ok_or_else(|| TransportError::UnknownPort(port.to_string()))?;

        let event_tx = self.event_tx.clone();
        let port_name = port.to_string();

        let conn = midi_in
            .connect(
                &in_port,
                &self.client_name,
                move |_timestamp, data, _| {
                    // No receivers is fine; sessions subscribe on demand
                    let _ = event_tx.send(MidiEvent {
                        port: port_name.clone(),
                        data: data.to_vec(),
                    });
                },
                (),
            )
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        debug!(port, "input port opened");
        self.inputs.lock().insert(port.to_string(), conn);
        Ok(())
    }

    fn open_output(&self, port: &str) -> Result<(), TransportError> {
        if self.is_output_open(port) {
            return Ok(());
        }

        let midi_out = MidiOutput::new(&format!("{}-out", self.client_name))
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        let out_port = midi_out
            .ports()
            .into_iter()
            .find(|p| midi_out.port_name(p).map(|n| n == port).unwrap_or(false))
            .ok_or_else(|| TransportError::UnknownPort(port.to_string()))?;

        let conn = midi_out
            .connect(&out_port, &self.client_name)
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        debug!(port, "output port opened");
        self.outputs.lock().insert(port.to_string(), conn);
        Ok(())
    }

    fn close_input(&self, port: &str) {
        if self.inputs.lock().remove(port).is_some() {
            debug!(port, "input port closed");
        }
    }

    fn close_output(&self, port: &str) {
        if self.outputs.lock().remove(port).is_some() {
            debug!(port, "output port closed");
        }
    }

    fn send(&self, port: &str, data: &[u8]) -> Result<(), TransportError> {
        let mut outputs = self.outputs.lock();
        let conn = outputs
            .get_mut(port)
            .ok_or_else(|| TransportError::NotOpen(port.to_string()))?;
        conn.send(data).map_err(|e| {
            warn!(port, err = %e, "send failed");
            TransportError::Backend(e.to_string())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<MidiEvent> {
        self.event_tx.subscribe()
    }

    fn subscribe_hotplug(&self) -> broadcast::Receiver<HotplugEvent> {
        self.hotplug_tx.subscribe()
    }
}
