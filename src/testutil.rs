//! Test doubles
//!
//! A scripted in-process [`Transport`]: reply rules map bytes sent on an
//! output port to messages injected on an input port, through the same
//! broadcast channel the real backend uses. Replies are only delivered
//! while the target input is open, matching real port semantics.

use crate::transport::{HotplugEvent, MidiEvent, PortInfo, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

type Matcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct ReplyRule {
    on_port: String,
    matches: Matcher,
    reply_port: String,
    reply: Vec<u8>,
}

pub struct MockTransport {
    input_names: Vec<String>,
    output_names: Vec<String>,
    open_inputs: Mutex<HashSet<String>>,
    open_outputs: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    rules: Mutex<Vec<ReplyRule>>,
    event_tx: broadcast::Sender<MidiEvent>,
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl MockTransport {
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let (hotplug_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            input_names: inputs.iter().map(|s| s.to_string()).collect(),
            output_names: outputs.iter().map(|s| s.to_string()).collect(),
            open_inputs: Mutex::new(HashSet::new()),
            open_outputs: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            event_tx,
            hotplug_tx,
        })
    }

    /// Reply with `reply` on `reply_port` whenever bytes equal to `request`
    /// are sent to `on_port`
    pub fn reply_with(&self, request: &[u8], on_port: &str, reply_port: &str, reply: &[u8]) {
        let request = request.to_vec();
        self.add_rule(on_port, move |data| data == request, reply_port, reply);
    }

    /// Reply when the sent bytes satisfy an arbitrary predicate
    pub fn add_rule(
        &self,
        on_port: &str,
        matches: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
        reply_port: &str,
        reply: &[u8],
    ) {
        self.rules.lock().push(ReplyRule {
            on_port: on_port.to_string(),
            matches: Box::new(matches),
            reply_port: reply_port.to_string(),
            reply: reply.to_vec(),
        });
    }

    /// Everything sent so far, as (port, bytes) pairs
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }

    /// Inject bytes as if they arrived on an input port
    pub fn inject(&self, port: &str, data: &[u8]) {
        if self.open_inputs.lock().contains(port) {
            let _ = self.event_tx.send(MidiEvent {
                port: port.to_string(),
                data: data.to_vec(),
            });
        }
    }

    /// Simulate a port list change
    #[allow(dead_code)]
    pub fn emit_hotplug(&self, event: HotplugEvent) {
        let _ = self.hotplug_tx.send(event);
    }

    fn infos(names: &[String]) -> Vec<PortInfo> {
        names
            .iter()
            .map(|name| PortInfo {
                id: name.clone(),
                name: name.clone(),
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn input_ports(&self) -> Vec<PortInfo> {
        Self::infos(&self.input_names)
    }

    fn output_ports(&self) -> Vec<PortInfo> {
        Self::infos(&self.output_names)
    }

    fn is_input_open(&self, port: &str) -> bool {
        self.open_inputs.lock().contains(port)
    }

    fn is_output_open(&self, port: &str) -> bool {
        self.open_outputs.lock().contains(port)
    }

    fn open_input(&self, port: &str) -> Result<(), TransportError> {
        if !self.input_names.iter().any(|n| n == port) {
            return Err(TransportError::UnknownPort(port.to_string()));
        }
        self.open_inputs.lock().insert(port.to_string());
        Ok(())
    }

    fn open_output(&self, port: &str) -> Result<(), TransportError> {
        if !self.output_names.iter().any(|n| n == port) {
            return Err(TransportError::UnknownPort(port.to_string()));
        }
        self.open_outputs.lock().insert(port.to_string());
        Ok(())
    }

    fn close_input(&self, port: &str) {
        self.open_inputs.lock().remove(port);
    }

    fn close_output(&self, port: &str) {
        self.open_outputs.lock().remove(port);
    }

    fn send(&self, port: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.open_outputs.lock().contains(port) {
            return Err(TransportError::NotOpen(port.to_string()));
        }
        self.sent.lock().push((port.to_string(), data.to_vec()));

        // Scripted replies land through the same channel as real input
        let rules = self.rules.lock();
        for rule in rules.iter() {
            if rule.on_port == port && (rule.matches)(data) {
                self.inject(&rule.reply_port, &rule.reply);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MidiEvent> {
        self.event_tx.subscribe()
    }

    fn subscribe_hotplug(&self) -> broadcast::Receiver<HotplugEvent> {
        self.hotplug_tx.subscribe()
    }
}
