//! Playback telemetry types.
//!
//! Clients report playback as a stream of events for a (session, item) pair.
//! Payloads are decoded once at the boundary into [`TelemetryEnvelope`];
//! everything downstream works on the typed [`PlaybackEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::identity::{ItemId, SessionId, Timestamp};
use crate::record::{number_field, FieldMap};

/// Field names of the backend stream record.
pub mod stream_fields {
    pub const SESSION_ID: &str = "SessionID";
    pub const ITEM_ID: &str = "TrackRecordID";
    pub const ACCOUNT_ID: &str = "AccountID";
    pub const POSITION_SECONDS: &str = "PositionSec";
    pub const DURATION_SECONDS: &str = "DurationSec";
    pub const TOTAL_PLAYED_SECONDS: &str = "TotalPlayedSec";
    pub const DELTA_SECONDS: &str = "DeltaSec";
    pub const LAST_EVENT: &str = "LastEventType";
    pub const ERROR_MESSAGE: &str = "ErrorMessage";
    pub const STARTED_AT: &str = "TimestampStart";
    pub const UPDATED_AT: &str = "TimestampLastUpdate";
    pub const ENDED_AT: &str = "TimestampEnd";
}

/// Discriminant of a playback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Play,
    Progress,
    Pause,
    Seek,
    End,
    Error,
}

impl EventKind {
    /// Terminal events close the stream record; the next PLAY starts a new one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::End | EventKind::Error)
    }

    /// Wire name as stored on the backend record.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Play => "PLAY",
            EventKind::Progress => "PROGRESS",
            EventKind::Pause => "PAUSE",
            EventKind::Seek => "SEEK",
            EventKind::End => "END",
            EventKind::Error => "ERROR",
        }
    }
}

/// A playback event carrying only the fields valid for its kind.
///
/// All positions and durations are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum PlaybackEvent {
    Play {
        #[serde(default)]
        position_seconds: f64,
        #[serde(default)]
        duration_seconds: Option<f64>,
    },
    Progress {
        position_seconds: f64,
        #[serde(default)]
        delta_seconds: Option<f64>,
        #[serde(default)]
        duration_seconds: Option<f64>,
    },
    Pause {
        position_seconds: f64,
        #[serde(default)]
        delta_seconds: Option<f64>,
    },
    Seek {
        position_seconds: f64,
        #[serde(default)]
        from_seconds: Option<f64>,
    },
    End {
        #[serde(default)]
        position_seconds: Option<f64>,
        #[serde(default)]
        delta_seconds: Option<f64>,
        #[serde(default)]
        duration_seconds: Option<f64>,
    },
    Error {
        #[serde(default)]
        position_seconds: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl PlaybackEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlaybackEvent::Play { .. } => EventKind::Play,
            PlaybackEvent::Progress { .. } => EventKind::Progress,
            PlaybackEvent::Pause { .. } => EventKind::Pause,
            PlaybackEvent::Seek { .. } => EventKind::Seek,
            PlaybackEvent::End { .. } => EventKind::End,
            PlaybackEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Position reported by the client, if the event carries one.
    pub fn position(&self) -> Option<f64> {
        match self {
            PlaybackEvent::Play {
                position_seconds, ..
            }
            | PlaybackEvent::Progress {
                position_seconds, ..
            }
            | PlaybackEvent::Pause {
                position_seconds, ..
            }
            | PlaybackEvent::Seek {
                position_seconds, ..
            } => Some(*position_seconds),
            PlaybackEvent::End {
                position_seconds, ..
            }
            | PlaybackEvent::Error {
                position_seconds, ..
            } => *position_seconds,
        }
    }

    /// Client-reported seconds played since the previous event.
    pub fn explicit_delta(&self) -> Option<f64> {
        match self {
            PlaybackEvent::Progress { delta_seconds, .. }
            | PlaybackEvent::Pause { delta_seconds, .. }
            | PlaybackEvent::End { delta_seconds, .. } => *delta_seconds,
            _ => None,
        }
    }

    /// Media duration reported by the client.
    pub fn reported_duration(&self) -> Option<f64> {
        match self {
            PlaybackEvent::Play {
                duration_seconds, ..
            }
            | PlaybackEvent::Progress {
                duration_seconds, ..
            }
            | PlaybackEvent::End {
                duration_seconds, ..
            } => *duration_seconds,
            _ => None,
        }
    }

    /// Whether playback time may be derived from the position change.
    ///
    /// A seek jumps the playhead without playing the skipped span.
    pub fn derives_delta(&self) -> bool {
        !matches!(
            self,
            PlaybackEvent::Seek { .. } | PlaybackEvent::Error { .. }
        )
    }

    fn validate(&self) -> Result<(), DecodeError> {
        check_seconds("positionSeconds", self.position())?;
        check_seconds("deltaSeconds", self.explicit_delta())?;
        check_seconds("durationSeconds", self.reported_duration())?;
        if let PlaybackEvent::Seek { from_seconds, .. } = self {
            check_seconds("fromSeconds", *from_seconds)?;
        }
        Ok(())
    }
}

fn check_seconds(field: &str, value: Option<f64>) -> Result<(), DecodeError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(DecodeError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be a non-negative number of seconds, got {}", v),
        }),
        _ => Ok(()),
    }
}

/// A decoded telemetry event together with its routing identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub session_id: SessionId,
    pub item_id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<Timestamp>,
    #[serde(flatten)]
    pub event: PlaybackEvent,
}

impl TelemetryEnvelope {
    pub fn new(session_id: SessionId, item_id: ItemId, event: PlaybackEvent) -> Self {
        Self {
            session_id,
            item_id,
            account_id: None,
            client_timestamp: None,
            event,
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Decode and validate a raw client payload.
    pub fn decode(payload: &Value) -> Result<Self, DecodeError> {
        for field in ["sessionId", "itemId", "type"] {
            if payload.get(field).map_or(true, Value::is_null) {
                return Err(DecodeError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        let envelope: TelemetryEnvelope =
            serde_json::from_value(payload.clone()).map_err(|e| DecodeError::Malformed {
                reason: e.to_string(),
            })?;

        if envelope.session_id.is_blank() {
            return Err(DecodeError::InvalidValue {
                field: "sessionId".to_string(),
                reason: "must not be blank".to_string(),
            });
        }
        if envelope.item_id.is_blank() {
            return Err(DecodeError::InvalidValue {
                field: "itemId".to_string(),
                reason: "must not be blank".to_string(),
            });
        }
        envelope.event.validate()?;
        Ok(envelope)
    }
}

/// Accumulated values stored on a stream record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub position_seconds: f64,
    pub total_played_seconds: f64,
    pub duration_seconds: f64,
}

impl StreamSnapshot {
    /// Read a snapshot from backend fields; unset fields read as zero.
    pub fn from_fields(fields: &FieldMap) -> Self {
        Self {
            position_seconds: number_field(fields, stream_fields::POSITION_SECONDS)
                .unwrap_or(0.0)
                .max(0.0),
            total_played_seconds: number_field(fields, stream_fields::TOTAL_PLAYED_SECONDS)
                .unwrap_or(0.0)
                .max(0.0),
            duration_seconds: number_field(fields, stream_fields::DURATION_SECONDS)
                .unwrap_or(0.0)
                .max(0.0),
        }
    }
}
