#![allow(dead_code)]

use anyhow::{anyhow, Result};
use base64::Engine;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_relay::broker::{Broker, InboundMessage};
use voice_relay::codec::FrameBuilder;
use voice_relay::error::{RelayError, RelayResult};
use voice_relay::relay::{Publisher, RelayEngine, RelaySettings};
use voice_relay::session::SessionLimits;
use voice_relay::upstream::{StreamOptions, UpstreamEvent, UpstreamEvents, UpstreamFactory, UpstreamStream};
use voice_relay::Config;

// ============================================================================
// In-memory broker
// ============================================================================

/// Broker double: records publishes, hands injected messages to the subscriber
pub struct MemoryBroker {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    /// Number of upcoming publishes that fail
    failures: AtomicU32,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            failures: AtomicU32::new(0),
        })
    }

    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.sender
            .send(InboundMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap();
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn published_json(&self, topic: &str) -> Vec<Value> {
        self.published_on(topic)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    /// Wait until at least `count` messages have been published on `topic`
    pub async fn wait_for(&self, topic: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let messages = self.published_json(topic);
            if messages.len() >= count {
                return messages;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {} message(s) on {}, got {}: {:?}",
                    count,
                    topic,
                    messages.len(),
                    messages
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, _pattern: &str) -> Result<BoxStream<'static, InboundMessage>> {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("already subscribed"))?;

        Ok(futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|m| (m, rx))
        })
        .boxed())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("broker unavailable"));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Scripted upstream
// ============================================================================

/// How every scripted upstream created by a factory behaves
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Units returned per utterance; empty echoes the utterance's audio
    pub units: Vec<Vec<u8>>,
    pub transcript: Option<String>,
    pub fail_handshake: bool,
    /// Emit an upstream error on the first push
    pub fail_on_push: bool,
    /// Accept audio but never answer
    pub never_respond: bool,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub pushes: AtomicUsize,
    pub finishes: AtomicUsize,
    pub open_options: Mutex<Vec<StreamOptions>>,
}

impl Counters {
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub struct ScriptedUpstream {
    script: Script,
    counters: Arc<Counters>,
    tx: Option<mpsc::UnboundedSender<RelayResult<UpstreamEvent>>>,
    rx: Option<mpsc::UnboundedReceiver<RelayResult<UpstreamEvent>>>,
    utterance: Vec<u8>,
}

impl ScriptedUpstream {
    fn send(&self, event: RelayResult<UpstreamEvent>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[async_trait::async_trait]
impl UpstreamStream for ScriptedUpstream {
    async fn open(&mut self, options: &StreamOptions) -> RelayResult<()> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters
            .open_options
            .lock()
            .unwrap()
            .push(options.clone());
        if self.script.fail_handshake {
            return Err(RelayError::UpstreamHandshake("401 unauthorized".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    async fn push_audio(&mut self, audio: &[u8]) -> RelayResult<()> {
        self.counters.pushes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_on_push {
            self.send(Err(RelayError::UpstreamStream("connection reset".into())));
            return Ok(());
        }
        self.utterance.extend_from_slice(audio);
        Ok(())
    }

    async fn finish_input(&mut self) -> RelayResult<()> {
        self.counters.finishes.fetch_add(1, Ordering::SeqCst);
        let utterance = std::mem::take(&mut self.utterance);
        if self.script.never_respond {
            return Ok(());
        }

        if self.script.units.is_empty() {
            self.send(Ok(UpstreamEvent::Audio(utterance)));
        } else {
            for unit in self.script.units.clone() {
                self.send(Ok(UpstreamEvent::Audio(unit)));
            }
        }
        if let Some(transcript) = self.script.transcript.clone() {
            self.send(Ok(UpstreamEvent::Transcript(transcript)));
        }
        self.send(Ok(UpstreamEvent::ResponseDone));
        Ok(())
    }

    fn pull_audio(&mut self) -> Option<UpstreamEvents> {
        let rx = self.rx.take()?;
        Some(
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
        )
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.tx.is_some()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct ScriptedFactory {
    pub script: Script,
    pub counters: Arc<Counters>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            counters: Arc::new(Counters::default()),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn UpstreamStream> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedUpstream {
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
            tx: None,
            rx: None,
            utterance: Vec::new(),
        })
    }

    async fn health_check(&self) -> bool {
        !self.script.fail_handshake
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Relay fixtures
// ============================================================================

pub const REQUEST_TOPIC: &str = "iot/+/audio_request";
pub const HEALTH_TOPIC: &str = "iot/server/health";

pub fn request_topic(device: &str) -> String {
    format!("iot/{}/audio_request", device)
}

pub fn response_topic(device: &str) -> String {
    format!("iot/{}/audio_response", device)
}

/// Defaults with the echo provider and fast timers
pub fn test_config() -> Config {
    let mut cfg = Config::from_defaults().unwrap();
    cfg.upstream.provider = "echo".to_string();
    cfg.server.sweep_interval_ms = 50;
    cfg.server.close_grace_ms = 200;
    cfg.server.enable_health_checks = false;
    cfg.server.http.enabled = false;
    cfg.broker.publish_backoff_ms = 1;
    cfg
}

pub fn engine_with(
    broker: Arc<MemoryBroker>,
    factory: Arc<ScriptedFactory>,
    cfg: &Config,
) -> RelayEngine {
    RelayEngine::with_parts(
        Publisher::from_config(broker, &cfg.broker),
        factory,
        FrameBuilder::new(&cfg.codec),
        SessionLimits::from_config(&cfg.server, &cfg.upstream),
        RelaySettings::from_config(cfg),
    )
}

/// Base64 `audio_request` envelope
pub fn audio_request(
    device: &str,
    session: &str,
    audio: &[u8],
    chunk: Option<(u32, u32)>,
) -> Vec<u8> {
    let mut metadata = json!({ "format": "pcm16", "sample_rate": 16000, "channels": 1 });
    if let Some((chunk_id, total_chunks)) = chunk {
        metadata["chunk_id"] = json!(chunk_id);
        metadata["total_chunks"] = json!(total_chunks);
    }
    serde_json::to_vec(&json!({
        "message_id": uuid::Uuid::new_v4().to_string(),
        "device_id": device,
        "timestamp": 1_700_000_000.0,
        "message_type": "audio_request",
        "session_id": session,
        "audio_data": base64::engine::general_purpose::STANDARD.encode(audio),
        "audio_metadata": metadata,
    }))
    .unwrap()
}

pub fn session_end(device: &str, session: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "message_id": uuid::Uuid::new_v4().to_string(),
        "device_id": device,
        "timestamp": 1_700_000_000.0,
        "message_type": "session_end",
        "session_id": session,
    }))
    .unwrap()
}

/// Decoded audio of an `audio_response` envelope
pub fn response_audio(envelope: &Value) -> Vec<u8> {
    envelope["audio_data"]
        .as_str()
        .map(|s| base64::engine::general_purpose::STANDARD.decode(s).unwrap())
        .unwrap_or_default()
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
