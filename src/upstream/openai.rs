use base64::Engine;
use futures::stream::{self, SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tracing::{debug, info, warn};

use super::{StreamOptions, UpstreamEvent, UpstreamEvents, UpstreamFactory, UpstreamStream};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWriter = SplitSink<WsStream, tungstenite::Message>;
type WsReader = SplitStream<WsStream>;

/// USD per minute of audio, input and output combined
const COST_PER_MINUTE: f64 = 0.24;

/// One OpenAI Realtime websocket per session
pub struct OpenAiRealtimeUpstream {
    config: UpstreamConfig,
    writer: Option<WsWriter>,
    events: Option<UpstreamEvents>,
}

impl OpenAiRealtimeUpstream {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            writer: None,
            events: None,
        }
    }

    async fn send_json(&mut self, value: Value) -> RelayResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::UpstreamStream("realtime session is not open".into()))?;
        writer
            .send(tungstenite::Message::Text(value.to_string()))
            .await
            .map_err(|e| RelayError::UpstreamStream(format!("websocket send failed: {}", e)))
    }

    fn session_update(&self, options: &StreamOptions) -> Value {
        let mut session = json!({
            "modalities": ["text", "audio"],
            "instructions": options.instructions.as_deref().unwrap_or(&self.config.instructions),
            "voice": options.voice.as_deref().unwrap_or(&self.config.voice),
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
        });
        if let Some(language) = &options.language {
            session["input_audio_transcription"]["language"] = json!(language);
        }
        json!({ "type": "session.update", "session": session })
    }
}

async fn connect(config: &UpstreamConfig) -> RelayResult<(WsWriter, WsReader)> {
    let url = format!("{}?model={}", config.base_url, config.model);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::UpstreamHandshake(format!("invalid URL {}: {}", url, e)))?;

    let api_key = config.api_key.as_deref().unwrap_or_default();
    let headers = [
        ("authorization", format!("Bearer {}", api_key)),
        ("openai-beta", "realtime=v1".to_string()),
    ];
    for (name, value) in headers {
        let value = tungstenite::http::HeaderValue::from_str(&value).map_err(|e| {
            RelayError::UpstreamHandshake(format!("invalid header value for {}: {}", name, e))
        })?;
        request.headers_mut().insert(name, value);
    }

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RelayError::UpstreamHandshake(format!("websocket connect failed: {}", e)))?;

    Ok(ws.split())
}

/// Wait until the server confirms the session.
async fn await_session_ready(reader: &mut WsReader) -> RelayResult<()> {
    while let Some(message) = reader.next().await {
        let message = message
            .map_err(|e| RelayError::UpstreamHandshake(format!("websocket read failed: {}", e)))?;
        let tungstenite::Message::Text(text) = message else {
            continue;
        };
        let event: Value = serde_json::from_str(&text)
            .map_err(|e| RelayError::UpstreamHandshake(format!("invalid server event: {}", e)))?;
        match event["type"].as_str() {
            Some("session.created") | Some("session.updated") => return Ok(()),
            Some("error") => {
                return Err(RelayError::UpstreamHandshake(error_message(&event)));
            }
            other => debug!("Ignoring pre-session event {:?}", other),
        }
    }
    Err(RelayError::UpstreamHandshake(
        "connection closed before session was created".into(),
    ))
}

/// Map one server event to an upstream event; `None` for events the relay ignores.
fn map_server_event(event: &Value) -> Option<RelayResult<UpstreamEvent>> {
    match event["type"].as_str()? {
        "response.audio.delta" => {
            let delta = event["delta"].as_str().filter(|d| !d.is_empty())?;
            Some(
                base64::engine::general_purpose::STANDARD
                    .decode(delta)
                    .map(UpstreamEvent::Audio)
                    .map_err(|e| RelayError::UpstreamStream(format!("invalid audio delta: {}", e))),
            )
        }
        "response.audio_transcript.delta" => {
            let delta = event["delta"].as_str().filter(|d| !d.is_empty())?;
            Some(Ok(UpstreamEvent::Transcript(delta.to_string())))
        }
        "response.done" => Some(Ok(UpstreamEvent::ResponseDone)),
        "error" => Some(Err(RelayError::UpstreamStream(error_message(event)))),
        _ => None,
    }
}

fn error_message(event: &Value) -> String {
    event["error"]["message"]
        .as_str()
        .unwrap_or("unknown error")
        .to_string()
}

fn into_events(reader: WsReader) -> UpstreamEvents {
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        loop {
            match reader.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    let event: Value = match serde_json::from_str(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Skipping unparseable realtime event: {}", e);
                            continue;
                        }
                    };
                    match map_server_event(&event) {
                        Some(Ok(item)) => return Some((Ok(item), Some(reader))),
                        // An error ends the sequence
                        Some(Err(e)) => return Some((Err(e), None)),
                        None => continue,
                    }
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    debug!("Realtime websocket closed: {:?}", frame);
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    return Some((
                        Err(RelayError::UpstreamStream(format!("websocket read failed: {}", e))),
                        None,
                    ))
                }
            }
        }
    })
    .boxed()
}

#[async_trait::async_trait]
impl UpstreamStream for OpenAiRealtimeUpstream {
    async fn open(&mut self, options: &StreamOptions) -> RelayResult<()> {
        info!("Opening OpenAI Realtime session (model {})", self.config.model);

        let (mut writer, mut reader) = connect(&self.config).await?;
        let update = self.session_update(options);
        writer
            .send(tungstenite::Message::Text(update.to_string()))
            .await
            .map_err(|e| RelayError::UpstreamHandshake(format!("session.update failed: {}", e)))?;

        await_session_ready(&mut reader).await?;

        self.writer = Some(writer);
        self.events = Some(into_events(reader));
        Ok(())
    }

    async fn push_audio(&mut self, audio: &[u8]) -> RelayResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        self.send_json(json!({ "type": "input_audio_buffer.append", "audio": encoded }))
            .await
    }

    async fn finish_input(&mut self) -> RelayResult<()> {
        self.send_json(json!({ "type": "input_audio_buffer.commit" }))
            .await?;
        self.send_json(json!({ "type": "response.create" })).await
    }

    fn pull_audio(&mut self) -> Option<UpstreamEvents> {
        self.events.take()
    }

    async fn close(&mut self) -> RelayResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if let Err(e) = writer.send(tungstenite::Message::Close(None)).await {
            debug!("Close frame not sent: {}", e);
        }
        writer
            .close()
            .await
            .map_err(|e| RelayError::UpstreamStream(format!("websocket close failed: {}", e)))
    }

    fn is_healthy(&self) -> bool {
        self.writer.is_some()
    }

    fn estimate_cost(&self, audio_seconds: f64) -> f64 {
        let cost = audio_seconds / 60.0 * COST_PER_MINUTE;
        (cost * 10_000.0).round() / 10_000.0
    }

    fn name(&self) -> &str {
        "openai"
    }
}

pub struct OpenAiRealtimeFactory {
    config: UpstreamConfig,
}

impl OpenAiRealtimeFactory {
    pub fn new(config: UpstreamConfig) -> RelayResult<Self> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(RelayError::Config(
                "OpenAI Realtime provider requires an API key".into(),
            ));
        }
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl UpstreamFactory for OpenAiRealtimeFactory {
    fn create(&self) -> Box<dyn UpstreamStream> {
        Box::new(OpenAiRealtimeUpstream::new(self.config.clone()))
    }

    /// Open and immediately close a throwaway session
    async fn health_check(&self) -> bool {
        let mut probe = OpenAiRealtimeUpstream::new(self.config.clone());
        let opened = tokio::time::timeout(
            self.config.handshake_timeout(),
            probe.open(&StreamOptions::default()),
        )
        .await;
        match opened {
            Ok(Ok(())) => {
                let _ = probe.close().await;
                true
            }
            Ok(Err(e)) => {
                warn!("OpenAI Realtime health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!("OpenAI Realtime health check timed out");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_audio_delta() {
        let event = json!({ "type": "response.audio.delta", "delta": "AAEC" });
        assert_eq!(
            map_server_event(&event).unwrap().unwrap(),
            UpstreamEvent::Audio(vec![0, 1, 2])
        );
    }

    #[test]
    fn test_map_ignores_unrelated_events() {
        assert!(map_server_event(&json!({ "type": "rate_limits.updated" })).is_none());
        assert!(map_server_event(&json!({ "type": "response.audio.delta", "delta": "" })).is_none());
    }

    #[test]
    fn test_map_error_event() {
        let event = json!({ "type": "error", "error": { "message": "bad audio" } });
        let err = map_server_event(&event).unwrap().unwrap_err();
        assert!(err.to_string().contains("bad audio"));
    }

    #[test]
    fn test_factory_requires_api_key() {
        let config = UpstreamConfig {
            provider: "openai".into(),
            api_key: None,
            model: "gpt-4o-realtime-preview".into(),
            base_url: "wss://api.openai.com/v1/realtime".into(),
            voice: "alloy".into(),
            instructions: "Be brief.".into(),
            handshake_timeout_ms: 1_000,
        };
        assert!(OpenAiRealtimeFactory::new(config).is_err());
    }

    #[test]
    fn test_session_update_prefers_device_overrides() {
        let config = UpstreamConfig {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            model: "m".into(),
            base_url: "wss://example.invalid".into(),
            voice: "alloy".into(),
            instructions: "default".into(),
            handshake_timeout_ms: 1_000,
        };
        let upstream = OpenAiRealtimeUpstream::new(config);
        let options = StreamOptions {
            voice: Some("verse".into()),
            language: Some("de".into()),
            ..Default::default()
        };
        let update = upstream.session_update(&options);
        assert_eq!(update["session"]["voice"], "verse");
        assert_eq!(update["session"]["instructions"], "default");
        assert_eq!(update["session"]["input_audio_transcription"]["language"], "de");
    }
}
