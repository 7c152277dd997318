//! Folding one playback event into a stream record's accumulated values.
//!
//! Pure functions; the accumulator supplies the stored snapshot and writes
//! the result back.

use chrono::{DateTime, Utc};
use encore_core::{stream_fields, FieldMap, PlaybackEvent, StreamSnapshot, TelemetryEnvelope};
use serde_json::{json, Value};

/// Backend timestamp layout.
const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Result of applying one event to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    pub snapshot: StreamSnapshot,
    /// Seconds of playback credited for this event.
    pub delta_seconds: f64,
}

/// Apply `event` to the stored snapshot, if any.
///
/// - position never regresses, so a late or duplicate event cannot move
///   the playhead backwards
/// - the credited delta is the client's own non-zero delta when it sends
///   one, otherwise the forward position change since the stored snapshot
/// - with no stored snapshot there is no baseline and nothing is derived
/// - total played only grows; duration keeps the largest non-zero value
pub fn reconcile(existing: Option<&StreamSnapshot>, event: &PlaybackEvent) -> Reconciled {
    let base = existing.copied().unwrap_or_default();
    let reported = event.position();

    let position_seconds = match reported {
        Some(p) if existing.is_some() => base.position_seconds.max(p),
        Some(p) => p,
        None => base.position_seconds,
    };

    let delta_seconds = match (event.explicit_delta(), reported) {
        (Some(delta), _) if delta > 0.0 => delta,
        (_, Some(p)) if existing.is_some() && event.derives_delta() => {
            (p - base.position_seconds).max(0.0)
        }
        _ => 0.0,
    };

    let duration_seconds = base
        .duration_seconds
        .max(event.reported_duration().unwrap_or(0.0));

    Reconciled {
        snapshot: StreamSnapshot {
            position_seconds,
            total_played_seconds: base.total_played_seconds + delta_seconds,
            duration_seconds,
        },
        delta_seconds,
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Fields written for an event, on create or update.
pub fn event_fields(
    envelope: &TelemetryEnvelope,
    reconciled: &Reconciled,
    at: DateTime<Utc>,
) -> FieldMap {
    let mut fields = FieldMap::new();
    let snapshot = &reconciled.snapshot;
    let now = Value::String(format_timestamp(at));

    fields.insert(stream_fields::POSITION_SECONDS.into(), json!(snapshot.position_seconds));
    fields.insert(
        stream_fields::TOTAL_PLAYED_SECONDS.into(),
        json!(snapshot.total_played_seconds),
    );
    fields.insert(stream_fields::DELTA_SECONDS.into(), json!(reconciled.delta_seconds));
    if snapshot.duration_seconds > 0.0 {
        fields.insert(stream_fields::DURATION_SECONDS.into(), json!(snapshot.duration_seconds));
    }
    fields.insert(
        stream_fields::LAST_EVENT.into(),
        json!(envelope.event.kind().as_str()),
    );
    fields.insert(stream_fields::UPDATED_AT.into(), now.clone());

    if let PlaybackEvent::Error {
        message: Some(message),
        ..
    } = &envelope.event
    {
        fields.insert(stream_fields::ERROR_MESSAGE.into(), json!(message));
    }
    if envelope.event.kind().is_terminal() {
        fields.insert(stream_fields::ENDED_AT.into(), now);
    }
    fields
}

/// Identity fields of a new stream record.
pub fn identity_fields(envelope: &TelemetryEnvelope, at: DateTime<Utc>) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(stream_fields::SESSION_ID.into(), json!(envelope.session_id.as_str()));
    fields.insert(stream_fields::ITEM_ID.into(), json!(envelope.item_id.as_str()));
    if let Some(account) = &envelope.account_id {
        fields.insert(stream_fields::ACCOUNT_ID.into(), json!(account));
    }
    fields.insert(
        stream_fields::STARTED_AT.into(),
        Value::String(format_timestamp(at)),
    );
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use encore_core::{ItemId, SessionId};
    use proptest::prelude::*;

    fn progress(position: f64, delta: Option<f64>) -> PlaybackEvent {
        PlaybackEvent::Progress {
            position_seconds: position,
            delta_seconds: delta,
            duration_seconds: None,
        }
    }

    fn apply(events: &[PlaybackEvent]) -> StreamSnapshot {
        let mut current: Option<StreamSnapshot> = None;
        for event in events {
            current = Some(reconcile(current.as_ref(), event).snapshot);
        }
        current.unwrap_or_default()
    }

    #[test]
    fn test_out_of_order_progress_keeps_position() {
        let snapshot = apply(&[
            PlaybackEvent::Play {
                position_seconds: 0.0,
                duration_seconds: None,
            },
            progress(30.0, Some(30.0)),
            progress(20.0, Some(5.0)),
        ]);
        assert_eq!(snapshot.position_seconds, 30.0);
        assert_eq!(snapshot.total_played_seconds, 35.0);
    }

    #[test]
    fn test_delta_derived_from_position_when_absent() {
        let base = StreamSnapshot {
            position_seconds: 10.0,
            total_played_seconds: 10.0,
            duration_seconds: 0.0,
        };
        let r = reconcile(Some(&base), &progress(25.0, None));
        assert_eq!(r.delta_seconds, 15.0);
        assert_eq!(r.snapshot.total_played_seconds, 25.0);

        // A zero client delta counts as absent.
        let r = reconcile(Some(&base), &progress(25.0, Some(0.0)));
        assert_eq!(r.delta_seconds, 15.0);

        // Going backwards derives nothing.
        let r = reconcile(Some(&base), &progress(4.0, None));
        assert_eq!(r.delta_seconds, 0.0);
        assert_eq!(r.snapshot.position_seconds, 10.0);
    }

    #[test]
    fn test_seek_moves_position_without_crediting_time() {
        let base = StreamSnapshot {
            position_seconds: 10.0,
            total_played_seconds: 10.0,
            duration_seconds: 300.0,
        };
        let r = reconcile(
            Some(&base),
            &PlaybackEvent::Seek {
                position_seconds: 200.0,
                from_seconds: Some(10.0),
            },
        );
        assert_eq!(r.snapshot.position_seconds, 200.0);
        assert_eq!(r.delta_seconds, 0.0);
        assert_eq!(r.snapshot.total_played_seconds, 10.0);
    }

    #[test]
    fn test_no_baseline_derives_nothing() {
        let r = reconcile(None, &progress(120.0, None));
        assert_eq!(r.snapshot.position_seconds, 120.0);
        assert_eq!(r.delta_seconds, 0.0);
    }

    #[test]
    fn test_duration_keeps_largest_non_zero() {
        let base = StreamSnapshot {
            duration_seconds: 240.0,
            ..Default::default()
        };
        let end = PlaybackEvent::End {
            position_seconds: None,
            delta_seconds: None,
            duration_seconds: Some(0.0),
        };
        assert_eq!(reconcile(Some(&base), &end).snapshot.duration_seconds, 240.0);

        let longer = PlaybackEvent::Play {
            position_seconds: 0.0,
            duration_seconds: Some(250.0),
        };
        assert_eq!(reconcile(Some(&base), &longer).snapshot.duration_seconds, 250.0);
    }

    #[test]
    fn test_error_without_position_keeps_stored_position() {
        let base = StreamSnapshot {
            position_seconds: 42.0,
            total_played_seconds: 40.0,
            duration_seconds: 0.0,
        };
        let r = reconcile(
            Some(&base),
            &PlaybackEvent::Error {
                position_seconds: None,
                message: Some("decoder crashed".into()),
            },
        );
        assert_eq!(r.snapshot, base);
    }

    #[test]
    fn test_event_fields_for_terminal_error() {
        let envelope = TelemetryEnvelope::new(
            SessionId::new("s"),
            ItemId::new("i"),
            PlaybackEvent::Error {
                position_seconds: Some(3.0),
                message: Some("boom".into()),
            },
        );
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("valid date");
        let r = reconcile(None, &envelope.event);
        let fields = event_fields(&envelope, &r, at);

        assert_eq!(fields[stream_fields::LAST_EVENT], json!("ERROR"));
        assert_eq!(fields[stream_fields::ERROR_MESSAGE], json!("boom"));
        assert_eq!(fields[stream_fields::ENDED_AT], json!("03/04/2026 05:06:07"));
        assert!(!fields.contains_key(stream_fields::DURATION_SECONDS));
    }

    #[test]
    fn test_identity_fields() {
        let envelope = TelemetryEnvelope::new(
            SessionId::new("s-1"),
            ItemId::new("t-9"),
            PlaybackEvent::Play {
                position_seconds: 0.0,
                duration_seconds: None,
            },
        )
        .with_account("acct-3");
        let fields = identity_fields(&envelope, Utc::now());
        assert_eq!(fields[stream_fields::SESSION_ID], json!("s-1"));
        assert_eq!(fields[stream_fields::ITEM_ID], json!("t-9"));
        assert_eq!(fields[stream_fields::ACCOUNT_ID], json!("acct-3"));
    }

    fn arb_event() -> impl Strategy<Value = PlaybackEvent> {
        let secs = 0.0f64..10_000.0;
        prop_oneof![
            (secs.clone(), proptest::option::of(secs.clone())).prop_map(|(p, d)| {
                PlaybackEvent::Progress {
                    position_seconds: p,
                    delta_seconds: d,
                    duration_seconds: None,
                }
            }),
            (secs.clone(), proptest::option::of(secs.clone())).prop_map(|(p, d)| {
                PlaybackEvent::Pause {
                    position_seconds: p,
                    delta_seconds: d,
                }
            }),
            secs.clone().prop_map(|p| PlaybackEvent::Seek {
                position_seconds: p,
                from_seconds: None,
            }),
            proptest::option::of(secs.clone()).prop_map(|p| PlaybackEvent::Error {
                position_seconds: p,
                message: None,
            }),
            (proptest::option::of(secs.clone()), proptest::option::of(secs)).prop_map(
                |(p, d)| PlaybackEvent::End {
                    position_seconds: p,
                    delta_seconds: None,
                    duration_seconds: d,
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn prop_position_and_total_never_decrease(
            events in prop::collection::vec(arb_event(), 1..40),
        ) {
            let mut current: Option<StreamSnapshot> = None;
            for event in &events {
                let next = reconcile(current.as_ref(), event);
                prop_assert!(next.delta_seconds >= 0.0);
                if let Some(prev) = current {
                    prop_assert!(next.snapshot.position_seconds >= prev.position_seconds);
                    prop_assert!(next.snapshot.total_played_seconds >= prev.total_played_seconds);
                    prop_assert!(next.snapshot.duration_seconds >= prev.duration_seconds);
                }
                current = Some(next.snapshot);
            }
        }

        #[test]
        fn prop_replaying_a_derived_event_credits_nothing(
            position in 0.0f64..10_000.0,
            events in prop::collection::vec(arb_event(), 1..10),
        ) {
            let mut current = apply(&events);
            let event = progress(position, None);
            current = reconcile(Some(&current), &event).snapshot;
            let replay = reconcile(Some(&current), &event);
            prop_assert_eq!(replay.delta_seconds, 0.0);
            prop_assert_eq!(replay.snapshot, current);
        }
    }
}
