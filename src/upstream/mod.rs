//! Upstream speech-to-speech providers
//!
//! The relay talks to providers only through [`UpstreamStream`]; one instance
//! is created per session by an [`UpstreamFactory`].
//!
//! Implementations:
//! - `openai`: OpenAI Realtime API over a websocket
//! - `echo`: loopback that returns the device's own audio (bring-up, tests)

mod echo;
mod openai;

pub use echo::{EchoFactory, EchoUpstream};
pub use openai::{OpenAiRealtimeFactory, OpenAiRealtimeUpstream};

use anyhow::Result;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::codec::AudioFragment;
use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};

/// Something the upstream produced for the device
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A unit of synthesized audio
    Audio(Vec<u8>),
    /// A transcript delta of the spoken response
    Transcript(String),
    /// The current response is complete
    ResponseDone,
}

/// Lazy outbound sequence of an upstream.
///
/// Ends (`None`) when the upstream closes; an `Err` item is unrecoverable.
pub type UpstreamEvents = BoxStream<'static, RelayResult<UpstreamEvent>>;

/// Per-session options taken from the first fragment, falling back to config
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

impl StreamOptions {
    pub fn from_fragment(fragment: &AudioFragment) -> Self {
        Self {
            format: fragment.format.clone(),
            sample_rate: fragment.sample_rate,
            channels: fragment.channels,
            language: fragment.language.clone(),
            voice: fragment.voice.clone(),
            instructions: fragment.instructions.clone(),
        }
    }

    /// Bytes per second of 16-bit PCM at these settings
    pub fn byte_rate(&self) -> f64 {
        let rate = self.sample_rate.unwrap_or(16_000) as f64;
        let channels = self.channels.unwrap_or(1).max(1) as f64;
        rate * channels * 2.0
    }
}

/// Bidirectional audio channel to one provider instance
#[async_trait::async_trait]
pub trait UpstreamStream: Send {
    /// Perform the provider handshake
    async fn open(&mut self, options: &StreamOptions) -> RelayResult<()>;

    /// Append device audio to the provider's input
    async fn push_audio(&mut self, audio: &[u8]) -> RelayResult<()>;

    /// Mark the end of one utterance and ask for a response
    async fn finish_input(&mut self) -> RelayResult<()> {
        Ok(())
    }

    /// Take the lazy outbound event stream.
    ///
    /// Available once, after a successful `open`.
    fn pull_audio(&mut self) -> Option<UpstreamEvents>;

    /// Release the provider connection
    async fn close(&mut self) -> RelayResult<()>;

    /// Check if the connection is still usable
    fn is_healthy(&self) -> bool;

    /// Estimated cost of processing `audio_seconds` of input
    fn estimate_cost(&self, _audio_seconds: f64) -> f64 {
        0.0
    }

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Creates one upstream per session
#[async_trait::async_trait]
pub trait UpstreamFactory: Send + Sync {
    fn create(&self) -> Box<dyn UpstreamStream>;

    /// Provider-level health, reported on the health topic
    async fn health_check(&self) -> bool;

    fn name(&self) -> &str;
}

/// Build the configured provider factory
pub fn factory_from_config(config: &UpstreamConfig) -> Result<Arc<dyn UpstreamFactory>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiRealtimeFactory::new(config.clone())?)),
        "echo" => Ok(Arc::new(EchoFactory)),
        other => Err(RelayError::Config(format!("unknown upstream provider '{}'", other)).into()),
    }
}
