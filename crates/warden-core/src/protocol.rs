use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One frame on the wire: `{"name": ..., "data": {...}}` followed by `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    pub fn with_data(name: impl Into<String>, data: EventData) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
        }
    }

    pub fn open() -> Self {
        Self::new(EventName::OPEN)
    }

    /// A `status` event without payload asks the service for its current state.
    pub fn status_query() -> Self {
        Self::new(EventName::STATUS)
    }

    pub fn status(data: EventData) -> Self {
        Self::with_data(EventName::STATUS, data)
    }

    pub fn settings(data: EventData) -> Self {
        Self::with_data(EventName::SETTINGS, data)
    }

    pub fn enable() -> Self {
        Self::new(EventName::ENABLE)
    }

    pub fn disable() -> Self {
        Self::new(EventName::DISABLE)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_data(
            EventName::ERROR,
            EventData {
                error: Some(message.into()),
                ..EventData::default()
            },
        )
    }

    pub fn kind(&self) -> EventName {
        EventName::from(self.name.as_str())
    }
}

/// Classified event name. Names outside the known vocabulary are kept
/// verbatim in `Other` rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    Open,
    Status,
    Settings,
    Enable,
    Disable,
    Error,
    Other(String),
}

impl EventName {
    pub const OPEN: &'static str = "open";
    pub const STATUS: &'static str = "status";
    pub const SETTINGS: &'static str = "settings";
    pub const ENABLE: &'static str = "enable";
    pub const DISABLE: &'static str = "disable";
    pub const ERROR: &'static str = "error";

    pub fn as_str(&self) -> &str {
        match self {
            EventName::Open => Self::OPEN,
            EventName::Status => Self::STATUS,
            EventName::Settings => Self::SETTINGS,
            EventName::Enable => Self::ENABLE,
            EventName::Disable => Self::DISABLE,
            EventName::Error => Self::ERROR,
            EventName::Other(name) => name,
        }
    }
}

impl From<&str> for EventName {
    fn from(value: &str) -> Self {
        match value {
            Self::OPEN => EventName::Open,
            Self::STATUS => EventName::Status,
            Self::SETTINGS => EventName::Settings,
            Self::ENABLE => EventName::Enable,
            Self::DISABLE => EventName::Disable,
            Self::ERROR => EventName::Error,
            other => EventName::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional payload. Every field may be absent; an absent boolean is not the
/// same as `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_device_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_updates: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_channel: Option<String>,
}

impl EventData {
    pub fn with_state(state: LifecycleState) -> Self {
        Self {
            state: Some(state.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Lifecycle carried by a `status` payload. `state` wins over the legacy
    /// `enabled` flag when both are present.
    pub fn lifecycle(&self) -> Option<LifecycleState> {
        if let Some(raw) = self.state.as_deref() {
            if let Ok(state) = raw.parse() {
                return Some(state);
            }
        }
        self.enabled.map(LifecycleState::from_enabled)
    }

    /// Error detail, with empty strings treated as "no error".
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Started,
    Reasserting,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Reasserting => "reasserting",
            LifecycleState::Stopping => "stopping",
        }
    }

    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            LifecycleState::Started
        } else {
            LifecycleState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Started | LifecycleState::Reasserting)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lifecycle state '{0}'")]
pub struct UnknownState(pub String);

impl FromStr for LifecycleState {
    type Err = UnknownState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(LifecycleState::Stopped),
            "starting" => Ok(LifecycleState::Starting),
            "started" => Ok(LifecycleState::Started),
            "reasserting" => Ok(LifecycleState::Reasserting),
            "stopping" => Ok(LifecycleState::Stopping),
            _ => Err(UnknownState(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateChannel {
    #[default]
    Stable,
    Beta,
}

impl UpdateChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateChannel::Stable => "Stable",
            UpdateChannel::Beta => "Beta",
        }
    }

    /// Unrecognised channel names fall back to `Stable`.
    pub fn parse_lenient(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("beta") {
            UpdateChannel::Beta
        } else {
            UpdateChannel::Stable
        }
    }
}

impl fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("malformed message: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn encode_event(event: &Event, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if event.name.is_empty() {
        return Err(FrameError::Encode("event name is empty".to_string()));
    }
    encode_frame(event, max_frame_bytes)
}

pub fn decode_event(line: &[u8], max_frame_bytes: usize) -> Result<Event, FrameError> {
    let event: Event = decode_frame(line, max_frame_bytes)?;
    if event.name.is_empty() {
        return Err(FrameError::Decode("event name is empty".to_string()));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_payload() -> EventData {
        EventData {
            enabled: Some(true),
            configuration: Some("abc123".to_string()),
            report_device_name: Some(false),
            check_updates: Some(true),
            update_channel: Some(UpdateChannel::Beta.as_str().to_string()),
            ..EventData::default()
        }
    }

    #[test]
    fn encode_decode_round_trip_for_vocabulary() {
        let events = [
            Event::open(),
            Event::status_query(),
            Event::status(EventData {
                state: Some("reasserting".to_string()),
                enabled: Some(true),
                error: Some("upstream unreachable".to_string()),
                ..EventData::default()
            }),
            Event::settings(settings_payload()),
            Event::enable(),
            Event::disable(),
            Event::error("proxy: address already in use"),
            Event::new("telemetry"),
        ];

        for event in events {
            let frame = encode_event(&event, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            assert_eq!(frame.last(), Some(&b'\n'));
            assert_eq!(frame.iter().filter(|byte| **byte == b'\n').count(), 1);
            let decoded = decode_event(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn open_event_serializes_without_data() {
        let frame = encode_event(&Event::open(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame, b"{\"name\":\"open\"}\n".to_vec());
    }

    #[test]
    fn settings_payload_uses_camel_case_keys() {
        let frame =
            encode_event(&Event::settings(settings_payload()), DEFAULT_MAX_FRAME_BYTES)
                .expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("json");
        let data = &value["data"];
        assert_eq!(data["reportDeviceName"], serde_json::json!(false));
        assert_eq!(data["checkUpdates"], serde_json::json!(true));
        assert_eq!(data["updateChannel"], serde_json::json!("Beta"));
        assert!(data.get("state").is_none());
        assert!(data.get("error").is_none());
    }

    #[test]
    fn decode_rejects_missing_name_and_invalid_json() {
        let missing = decode_event(b"{\"data\":{\"enabled\":true}}\n", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(missing, Err(FrameError::Decode(_))));

        let invalid = decode_event(b"{\"name\":\"status\"\n", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(invalid, Err(FrameError::Decode(_))));

        let empty = decode_event(b"{\"name\":\"\"}\n", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(empty, Err(FrameError::Decode(_))));

        let valid = decode_event(b"{\"name\":\"status\"}\n", DEFAULT_MAX_FRAME_BYTES)
            .expect("valid line after malformed ones");
        assert_eq!(valid.kind(), EventName::Status);
    }

    #[test]
    fn decode_ignores_unknown_fields_and_null_data() {
        let event = decode_event(
            br#"{"name":"status","data":{"state":"started","uptime":42},"seq":7}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(
            event.data.as_ref().and_then(EventData::lifecycle),
            Some(LifecycleState::Started)
        );

        let null_data = decode_event(br#"{"name":"open","data":null}"#, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode null data");
        assert_eq!(null_data, Event::open());
    }

    #[test]
    fn decode_accepts_crlf_terminator() {
        let event = decode_event(b"{\"name\":\"enable\"}\r\n", DEFAULT_MAX_FRAME_BYTES)
            .expect("decode");
        assert_eq!(event, Event::enable());
    }

    #[test]
    fn unknown_names_are_tolerated() {
        let event = decode_event(b"{\"name\":\"ping\"}", DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(event.kind(), EventName::Other("ping".to_string()));
        assert_eq!(event.kind().to_string(), "ping");
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let event = Event::error("x".repeat(256));
        assert!(matches!(
            encode_event(&event, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let frame = encode_event(&event, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            decode_event(&frame, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn state_takes_precedence_over_legacy_enabled() {
        let data = EventData {
            enabled: Some(true),
            state: Some("stopping".to_string()),
            ..EventData::default()
        };
        assert_eq!(data.lifecycle(), Some(LifecycleState::Stopping));

        let legacy = EventData {
            enabled: Some(false),
            ..EventData::default()
        };
        assert_eq!(legacy.lifecycle(), Some(LifecycleState::Stopped));

        let unknown_state = EventData {
            enabled: Some(true),
            state: Some("warming".to_string()),
            ..EventData::default()
        };
        assert_eq!(unknown_state.lifecycle(), Some(LifecycleState::Started));

        assert_eq!(EventData::default().lifecycle(), None);
    }

    #[test]
    fn blank_error_means_no_error() {
        let data = EventData {
            error: Some("  ".to_string()),
            ..EventData::default()
        };
        assert_eq!(data.error_message(), None);
        let data = EventData {
            error: Some("captive portal detected".to_string()),
            ..EventData::default()
        };
        assert_eq!(data.error_message(), Some("captive portal detected"));
    }

    #[test]
    fn lifecycle_parsing_is_case_insensitive() {
        assert_eq!("Started".parse::<LifecycleState>(), Ok(LifecycleState::Started));
        assert_eq!(
            "bogus".parse::<LifecycleState>(),
            Err(UnknownState("bogus".to_string()))
        );
        assert_eq!(UpdateChannel::parse_lenient("BETA"), UpdateChannel::Beta);
        assert_eq!(UpdateChannel::parse_lenient("nightly"), UpdateChannel::Stable);
    }
}
