use base64::Engine;
use serde::{Deserialize, Serialize};

use super::messages::{
    AudioMetadata, AudioRequestMessage, AudioResponseMessage, ErrorMessage, MessageType,
};
use crate::config::CodecConfig;
use crate::error::{RelayError, RelayResult};

const MAX_ID_LEN: usize = 128;
const HEADER_LEN_PREFIX: usize = 4;

/// How audio bytes travel inside an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    /// JSON envelope, `audio_data` is a base64 string
    #[default]
    Base64,
    /// `[u32 BE header length][JSON header][audio bytes]`
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Audio,
    EndOfStream,
}

/// One parsed inbound unit of audio, addressed to a device/session pair
#[derive(Debug, Clone)]
pub struct AudioFragment {
    pub message_id: String,
    pub device_id: String,
    pub session_id: String,
    pub kind: FragmentKind,
    pub payload: Vec<u8>,
    pub encoding: EncodingMode,
    pub chunk_id: Option<u32>,
    pub total_chunks: Option<u32>,
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

impl AudioFragment {
    /// Whether this fragment closes the device's current utterance.
    ///
    /// A fragment without chunk info is a complete utterance on its own; a
    /// chunk with no known total leaves the utterance open.
    pub fn ends_utterance(&self) -> bool {
        match (self.chunk_id, self.total_chunks) {
            (Some(id), Some(total)) => id.saturating_add(1) >= total,
            (None, Some(total)) => total <= 1,
            (Some(_), None) => false,
            (None, None) => true,
        }
    }
}

/// Identity stamped on every envelope of one session
#[derive(Debug, Clone)]
pub struct EnvelopeTemplate {
    pub device_id: String,
    pub session_id: String,
    pub format: Option<String>,
}

/// One outbound slice before serialization
#[derive(Debug, Clone, Default)]
pub struct OutboundAudio<'a> {
    pub sequence: u64,
    pub chunk_id: u32,
    pub total_chunks: u32,
    pub audio: &'a [u8],
    pub transcript: Option<&'a str>,
    pub processing_time_ms: f64,
    pub cost_estimate: f64,
}

/// Parses inbound envelopes and builds outbound ones
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    encoding: EncodingMode,
    max_payload_bytes: usize,
    target_chunk_bytes: usize,
}

impl FrameBuilder {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            encoding: config.encoding,
            max_payload_bytes: config.max_payload_bytes,
            target_chunk_bytes: config.target_chunk_bytes.max(1),
        }
    }

    pub fn encoding(&self) -> EncodingMode {
        self.encoding
    }

    pub fn target_chunk_bytes(&self) -> usize {
        self.target_chunk_bytes
    }

    /// Parse an inbound message.
    ///
    /// `topic_device` is the device id carried by the topic, if any. It fills
    /// a missing `device_id` field and must agree with a present one.
    pub fn parse(&self, bytes: &[u8], topic_device: Option<&str>) -> RelayResult<AudioFragment> {
        let (header, raw_audio) = match self.encoding {
            EncodingMode::Base64 => {
                let header: AudioRequestMessage = serde_json::from_slice(bytes)
                    .map_err(|e| RelayError::Parse(format!("invalid JSON envelope: {}", e)))?;
                (header, None)
            }
            EncodingMode::Raw => {
                let (header_bytes, audio) = split_raw_frame(bytes)?;
                let header: AudioRequestMessage = serde_json::from_slice(header_bytes)
                    .map_err(|e| RelayError::Parse(format!("invalid JSON header: {}", e)))?;
                (header, Some(audio))
            }
        };

        let kind = match header.message_type {
            MessageType::AudioRequest => FragmentKind::Audio,
            MessageType::SessionEnd => FragmentKind::EndOfStream,
            other => {
                return Err(RelayError::Parse(format!(
                    "unsupported message_type {:?}",
                    other
                )))
            }
        };

        let device_id = match (header.device_id.is_empty(), topic_device) {
            (true, Some(from_topic)) => from_topic.to_string(),
            (true, None) => return Err(RelayError::Parse("missing device_id".into())),
            (false, Some(from_topic)) if from_topic != header.device_id => {
                return Err(RelayError::Parse(format!(
                    "device_id '{}' does not match topic device '{}'",
                    header.device_id, from_topic
                )))
            }
            (false, _) => header.device_id,
        };
        validate_id("device_id", &device_id, true)?;
        validate_id("session_id", &header.session_id, false)?;

        let message_id = if header.message_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            validate_id("message_id", &header.message_id, false)?;
            header.message_id
        };

        let payload = match raw_audio {
            Some(audio) => {
                self.check_size(audio.len())?;
                audio.to_vec()
            }
            None => match header.audio_data.as_deref() {
                Some(encoded) if !encoded.is_empty() => {
                    // Base64 expands by 4/3; refuse before paying for the decode
                    if encoded.len() / 4 * 3 > self.max_payload_bytes + 3 {
                        return Err(self.oversized(encoded.len() / 4 * 3));
                    }
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| RelayError::Parse(format!("invalid base64 audio: {}", e)))?;
                    self.check_size(decoded.len())?;
                    decoded
                }
                _ => Vec::new(),
            },
        };

        let metadata = header.audio_metadata.unwrap_or_default();
        let fragment = AudioFragment {
            message_id,
            device_id,
            session_id: header.session_id,
            kind,
            payload,
            encoding: self.encoding,
            chunk_id: metadata.chunk_id,
            total_chunks: metadata.total_chunks,
            format: metadata.format,
            sample_rate: metadata.sample_rate,
            channels: metadata.channels,
            language: header.language,
            voice: header.voice,
            instructions: header.instructions,
        };

        if fragment.kind == FragmentKind::Audio
            && fragment.payload.is_empty()
            && !fragment.ends_utterance()
        {
            return Err(RelayError::Parse(format!(
                "audio_request {} carries no audio",
                fragment.message_id
            )));
        }

        Ok(fragment)
    }

    /// Slice one upstream audio unit into pieces no larger than the target size.
    pub fn rechunk<'a>(&self, unit: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        unit.chunks(self.target_chunk_bytes)
    }

    /// Build an `audio_response` envelope.
    pub fn serialize(
        &self,
        template: &EnvelopeTemplate,
        outbound: &OutboundAudio<'_>,
    ) -> RelayResult<Vec<u8>> {
        let audio_data = match self.encoding {
            EncodingMode::Base64 => {
                Some(base64::engine::general_purpose::STANDARD.encode(outbound.audio))
            }
            EncodingMode::Raw => None,
        };

        let message = AudioResponseMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            device_id: template.device_id.clone(),
            timestamp: epoch_seconds(),
            message_type: MessageType::AudioResponse,
            session_id: template.session_id.clone(),
            sequence: outbound.sequence,
            audio_data,
            audio_metadata: AudioMetadata {
                format: template.format.clone(),
                chunk_id: Some(outbound.chunk_id),
                total_chunks: Some(outbound.total_chunks),
                ..Default::default()
            },
            transcript: outbound.transcript.map(str::to_string),
            processing_time_ms: outbound.processing_time_ms,
            cost_estimate: outbound.cost_estimate,
        };

        self.encode(&message, outbound.audio)
    }

    /// Build an `error` envelope for a device.
    pub fn error_envelope(
        &self,
        device_id: &str,
        session_id: &str,
        error: &RelayError,
        original_message_id: Option<&str>,
    ) -> RelayResult<Vec<u8>> {
        let message = ErrorMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            timestamp: epoch_seconds(),
            message_type: MessageType::Error,
            session_id: session_id.to_string(),
            error_code: error.error_code().to_string(),
            error_message: error.to_string(),
            original_message_id: original_message_id.map(str::to_string),
        };

        self.encode(&message, &[])
    }

    fn encode<T: Serialize>(&self, header: &T, audio: &[u8]) -> RelayResult<Vec<u8>> {
        let json = serde_json::to_vec(header)
            .map_err(|e| RelayError::Parse(format!("failed to encode envelope: {}", e)))?;

        match self.encoding {
            EncodingMode::Base64 => Ok(json),
            EncodingMode::Raw => {
                let header_len = u32::try_from(json.len()).map_err(|_| {
                    RelayError::Parse(format!("envelope header too large: {} bytes", json.len()))
                })?;
                let mut frame = Vec::with_capacity(HEADER_LEN_PREFIX + json.len() + audio.len());
                frame.extend_from_slice(&header_len.to_be_bytes());
                frame.extend_from_slice(&json);
                frame.extend_from_slice(audio);
                Ok(frame)
            }
        }
    }

    fn check_size(&self, len: usize) -> RelayResult<()> {
        if len > self.max_payload_bytes {
            return Err(self.oversized(len));
        }
        Ok(())
    }

    fn oversized(&self, len: usize) -> RelayError {
        RelayError::Parse(format!(
            "audio payload of {} bytes exceeds limit of {} bytes",
            len, self.max_payload_bytes
        ))
    }
}

/// Split a raw-mode frame into its JSON header and audio tail.
pub fn split_raw_frame(bytes: &[u8]) -> RelayResult<(&[u8], &[u8])> {
    if bytes.len() < HEADER_LEN_PREFIX {
        return Err(RelayError::Parse(format!(
            "raw frame of {} bytes has no header length",
            bytes.len()
        )));
    }
    let (prefix, rest) = bytes.split_at(HEADER_LEN_PREFIX);
    let header_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if header_len > rest.len() {
        return Err(RelayError::Parse(format!(
            "raw frame header length {} exceeds frame size {}",
            header_len,
            rest.len()
        )));
    }
    Ok(rest.split_at(header_len))
}

fn validate_id(field: &str, value: &str, topic_safe: bool) -> RelayResult<()> {
    if value.is_empty() {
        return Err(RelayError::Parse(format!("missing {}", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(RelayError::Parse(format!(
            "{} longer than {} bytes",
            field, MAX_ID_LEN
        )));
    }
    let bad = |c: char| {
        c.is_whitespace()
            || c.is_control()
            || (topic_safe && matches!(c, '/' | '+' | '#' | '.' | '*' | '>'))
    };
    if value.chars().any(bad) {
        return Err(RelayError::Parse(format!(
            "{} '{}' contains characters not allowed in identifiers",
            field, value
        )));
    }
    Ok(())
}

fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
