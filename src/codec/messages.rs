use serde::{Deserialize, Serialize};

/// Message types on the device protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AudioRequest,
    AudioResponse,
    HealthCheck,
    Error,
    SessionStart,
    SessionEnd,
}

/// Audio metadata attached to request and response envelopes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

/// Audio request published by a device
///
/// In raw encoding mode this is the JSON header and `audio_data` is absent.
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioRequestMessage {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: f64,
    pub message_type: MessageType,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>, // Base64-encoded audio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_metadata: Option<AudioMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Audio response published to a device
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioResponseMessage {
    pub message_id: String,
    pub device_id: String,
    pub timestamp: f64,
    pub message_type: MessageType,
    pub session_id: String,
    /// Position of this envelope among every envelope sent for the session
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<String>, // Base64-encoded audio
    pub audio_metadata: AudioMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub processing_time_ms: f64,
    pub cost_estimate: f64,
}

/// Error reported back to a device on its response topic
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message_id: String,
    pub device_id: String,
    pub timestamp: f64,
    pub message_type: MessageType,
    pub session_id: String,
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}
