//! Scripted protocol engine for exercising viewers and the console
//! controller without a display server. Tests inject [`EngineEvent`]s
//! through the factory and assert on the calls the engine recorded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::GraphicsProtocol;

use super::engine::{CredentialKind, EngineEvent, EngineFactory, ProtocolEngine};

#[derive(Default)]
struct Recorded {
    open_host: Vec<(String, Option<u16>, Option<u16>)>,
    streams: Vec<UnixStream>,
    channel_streams: Vec<(u64, UnixStream)>,
    credentials: Vec<(CredentialKind, String)>,
    sent_keys: Vec<Vec<String>>,
    scaling: bool,
    resize_guest: bool,
}

struct MockEngine {
    recorded: Arc<Mutex<Recorded>>,
    shutdowns: Arc<AtomicUsize>,
    has_agent: bool,
    has_usb: bool,
}

impl ProtocolEngine for MockEngine {
    fn open_host(&mut self, host: &str, port: Option<u16>, tlsport: Option<u16>) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .open_host
            .push((host.to_string(), port, tlsport));
        Ok(())
    }

    fn open_stream(&mut self, stream: UnixStream) -> Result<()> {
        self.recorded.lock().unwrap().streams.push(stream);
        Ok(())
    }

    fn open_channel_stream(&mut self, channel_id: u64, stream: UnixStream) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .channel_streams
            .push((channel_id, stream));
        Ok(())
    }

    fn set_credential(&mut self, kind: CredentialKind, value: &str) -> Result<()> {
        self.recorded
            .lock()
            .unwrap()
            .credentials
            .push((kind, value.to_string()));
        Ok(())
    }

    fn send_keys(&mut self, keys: &[String]) -> Result<()> {
        self.recorded.lock().unwrap().sent_keys.push(keys.to_vec());
        Ok(())
    }

    fn desktop_resolution(&self) -> Option<(u32, u32)> {
        None
    }

    fn scaling(&self) -> bool {
        self.recorded.lock().unwrap().scaling
    }

    fn set_scaling(&mut self, scaling: bool) {
        self.recorded.lock().unwrap().scaling = scaling;
    }

    fn resize_guest(&self) -> bool {
        self.recorded.lock().unwrap().resize_guest
    }

    fn set_resize_guest(&mut self, enabled: bool) {
        self.recorded.lock().unwrap().resize_guest = enabled;
    }

    fn has_usb_redirection(&self) -> bool {
        self.has_usb
    }

    fn has_agent(&self) -> bool {
        self.has_agent
    }

    fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`MockEngine`]s and keeps the event sender of the most recently
/// created one so tests can script the session.
#[derive(Default)]
pub struct MockEngineFactory {
    recorded: Arc<Mutex<Recorded>>,
    shutdowns: Arc<AtomicUsize>,
    events: Mutex<Option<UnboundedSender<EngineEvent>>>,
    created: AtomicUsize,
    pub has_agent: bool,
    pub has_usb: bool,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a scripted event into the viewer's pump.
    pub fn emit(&self, event: EngineEvent) {
        let guard = self.events.lock().unwrap();
        let sender = guard.as_ref().expect("no engine created yet");
        sender.send(event).expect("viewer pump gone");
    }

    pub fn engines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn open_host_calls(&self) -> Vec<(String, Option<u16>, Option<u16>)> {
        self.recorded.lock().unwrap().open_host.clone()
    }

    pub fn stream_count(&self) -> usize {
        self.recorded.lock().unwrap().streams.len()
    }

    pub fn channel_stream_ids(&self) -> Vec<u64> {
        self.recorded
            .lock()
            .unwrap()
            .channel_streams
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn credentials(&self) -> Vec<(CredentialKind, String)> {
        self.recorded.lock().unwrap().credentials.clone()
    }

    pub fn sent_keys(&self) -> Vec<Vec<String>> {
        self.recorded.lock().unwrap().sent_keys.clone()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        protocol: &GraphicsProtocol,
        events: UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn ProtocolEngine>> {
        if let GraphicsProtocol::Other(name) = protocol {
            return Err(anyhow!("unsupported protocol '{name}'"));
        }
        *self.events.lock().unwrap() = Some(events);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            recorded: self.recorded.clone(),
            shutdowns: self.shutdowns.clone(),
            has_agent: self.has_agent,
            has_usb: self.has_usb,
        }))
    }
}
