//! ENCORE Test Utilities
//!
//! Shared test infrastructure for the ENCORE workspace:
//! - `MockBackend`, an in-memory record store behind the `Backend` port
//! - Proptest generators for identifiers and playback telemetry
//! - Fixtures for configs and common event sequences

mod mock_backend;

pub use mock_backend::{Fault, MockBackend};

// Re-export core types for convenience
pub use encore_core::{
    stream_fields, EventKind, FieldMap, GatewayError, GatewayResult, ItemId, PlaybackEvent,
    RecordId, SessionId, StreamSnapshot, TelemetryEnvelope,
};

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for telemetry.

    use super::*;
    use proptest::prelude::*;

    /// Whole and fractional seconds within a two-hour item.
    pub fn arb_seconds() -> impl Strategy<Value = f64> {
        prop_oneof![
            (0u32..7_200).prop_map(f64::from),
            0.0f64..7_200.0,
        ]
    }

    pub fn arb_session_id() -> impl Strategy<Value = SessionId> {
        "[a-z0-9]{8}".prop_map(SessionId::new)
    }

    pub fn arb_item_id() -> impl Strategy<Value = ItemId> {
        "trk-[0-9]{1,6}".prop_map(ItemId::new)
    }

    /// Any event except PLAY.
    pub fn arb_follow_up_event() -> impl Strategy<Value = PlaybackEvent> {
        let delta = proptest::option::of(0.0f64..120.0);
        prop_oneof![
            4 => (arb_seconds(), delta.clone(), proptest::option::of(arb_seconds()))
                .prop_map(|(p, d, dur)| PlaybackEvent::Progress {
                    position_seconds: p,
                    delta_seconds: d,
                    duration_seconds: dur,
                }),
            2 => (arb_seconds(), delta.clone()).prop_map(|(p, d)| PlaybackEvent::Pause {
                position_seconds: p,
                delta_seconds: d,
            }),
            2 => (arb_seconds(), proptest::option::of(arb_seconds())).prop_map(|(p, from)| {
                PlaybackEvent::Seek {
                    position_seconds: p,
                    from_seconds: from,
                }
            }),
            1 => (
                proptest::option::of(arb_seconds()),
                delta,
                proptest::option::of(arb_seconds()),
            )
                .prop_map(|(p, d, dur)| PlaybackEvent::End {
                    position_seconds: p,
                    delta_seconds: d,
                    duration_seconds: dur,
                }),
            1 => (proptest::option::of(arb_seconds()), proptest::option::of("[a-z ]{0,24}"))
                .prop_map(|(p, message)| PlaybackEvent::Error {
                    position_seconds: p,
                    message,
                }),
        ]
    }

    pub fn arb_playback_event() -> impl Strategy<Value = PlaybackEvent> {
        prop_oneof![
            1 => (arb_seconds(), proptest::option::of(arb_seconds())).prop_map(|(p, dur)| {
                PlaybackEvent::Play {
                    position_seconds: p,
                    duration_seconds: dur,
                }
            }),
            5 => arb_follow_up_event(),
        ]
    }

    /// A PLAY followed by up to `max_len` other events.
    pub fn arb_stream_events(max_len: usize) -> impl Strategy<Value = Vec<PlaybackEvent>> {
        (
            arb_seconds(),
            prop::collection::vec(arb_follow_up_event(), 0..=max_len),
        )
            .prop_map(|(start, rest)| {
                let mut events = vec![PlaybackEvent::Play {
                    position_seconds: start,
                    duration_seconds: None,
                }];
                events.extend(rest);
                events
            })
    }

    pub fn arb_telemetry_envelope() -> impl Strategy<Value = TelemetryEnvelope> {
        (
            arb_session_id(),
            arb_item_id(),
            proptest::option::of("acct-[0-9]{3}"),
            arb_playback_event(),
        )
            .prop_map(|(session, item, account, event)| {
                let envelope = TelemetryEnvelope::new(session, item, event);
                match account {
                    Some(account) => envelope.with_account(account),
                    None => envelope,
                }
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configs and events.

    use super::*;
    use encore_core::{BackendConfig, ThrottleConfig, TokenConfig};
    use encore_gateway::{GatewayConfig, JanitorConfig};
    use std::time::Duration;

    pub const STREAM_LAYOUT: &str = "StreamEvents";

    pub fn backend_config() -> BackendConfig {
        BackendConfig::new("http://records.test", "Encore", "api", "secret")
    }

    /// Defaults with the janitor off and no start gap.
    pub fn gateway_config() -> GatewayConfig {
        GatewayConfig::new(backend_config())
            .with_janitor(JanitorConfig::disabled())
            .with_throttle(ThrottleConfig::default().with_min_start_gap(Duration::ZERO))
            .with_token(TokenConfig {
                lifetime: Duration::from_secs(15 * 60),
                safety_margin: Duration::from_secs(60),
            })
    }

    pub fn play(position: f64) -> PlaybackEvent {
        PlaybackEvent::Play {
            position_seconds: position,
            duration_seconds: None,
        }
    }

    pub fn progress(position: f64, delta: Option<f64>) -> PlaybackEvent {
        PlaybackEvent::Progress {
            position_seconds: position,
            delta_seconds: delta,
            duration_seconds: None,
        }
    }

    pub fn pause(position: f64) -> PlaybackEvent {
        PlaybackEvent::Pause {
            position_seconds: position,
            delta_seconds: None,
        }
    }

    pub fn seek(position: f64) -> PlaybackEvent {
        PlaybackEvent::Seek {
            position_seconds: position,
            from_seconds: None,
        }
    }

    pub fn end(position: f64) -> PlaybackEvent {
        PlaybackEvent::End {
            position_seconds: Some(position),
            delta_seconds: None,
            duration_seconds: None,
        }
    }

    pub fn error(message: &str) -> PlaybackEvent {
        PlaybackEvent::Error {
            position_seconds: None,
            message: Some(message.to_string()),
        }
    }

    /// Envelope for the stream `("session-1", "track-1")`.
    pub fn event(event: PlaybackEvent) -> TelemetryEnvelope {
        stream_event("session-1", "track-1", event)
    }

    pub fn stream_event(session: &str, item: &str, event: PlaybackEvent) -> TelemetryEnvelope {
        TelemetryEnvelope::new(SessionId::new(session), ItemId::new(item), event)
    }
}
