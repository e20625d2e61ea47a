//! Late-joiner history replay and unchanged-payload write suppression.

mod common;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use controlbus_client::topics::WriteTopic;
use controlbus_client::{Error, Remote, TopicKind};

use common::{within, Harness};

const CONFIG_EVENT_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "settingsApplied",
    "fields": [{"name": "version", "type": "int"}]
}
"#;

const TELEMETRY_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "position",
    "fields": [
        {"name": "angle", "type": "double"},
        {"name": "velocity", "type": "double"}
    ]
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SettingsApplied {
    version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Position {
    angle: f64,
    velocity: f64,
}

#[tokio::test]
async fn late_joiner_sees_most_recent_event() {
    let harness = Harness::new();

    // Publisher session: write two event samples before any reader exists.
    let writer_session = harness.session("Camera");
    let writer = within(WriteTopic::<SettingsApplied>::new(
        &writer_session,
        TopicKind::Event,
        "settingsApplied",
        CONFIG_EVENT_SCHEMA,
    ))
    .await
    .expect("writer");
    writer
        .write_forced(&SettingsApplied { version: 1 })
        .await
        .expect("write v1");
    writer
        .write_forced(&SettingsApplied { version: 2 })
        .await
        .expect("write v2");

    // The late joiner's event reader replays only the most recent sample.
    let remote = Remote::new(harness.session("Camera")).expect("remote");
    let reader = remote
        .event_reader::<SettingsApplied>("settingsApplied", CONFIG_EVENT_SCHEMA)
        .expect("reader");
    within(remote.start()).await.expect("remote start");

    // next() consumes the queue, so a second sample would still be visible.
    let replayed = within(reader.next(false)).await.expect("history sample");
    assert_eq!(replayed.data, SettingsApplied { version: 2 });
    assert!(
        reader.get_oldest().expect("queue").is_none(),
        "only one historical sample expected"
    );

    remote.close().await;
    writer_session.close().await;
}

#[tokio::test]
async fn telemetry_reader_gets_no_history() {
    let harness = Harness::new();

    let writer_session = harness.session("Camera");
    let writer = within(WriteTopic::<Position>::new(
        &writer_session,
        TopicKind::Telemetry,
        "position",
        TELEMETRY_SCHEMA,
    ))
    .await
    .expect("writer");
    writer
        .write_forced(&Position {
            angle: 1.0,
            velocity: 0.0,
        })
        .await
        .expect("pre-start write");

    let remote = Remote::new(harness.session("Camera")).expect("remote");
    let reader = remote
        .telemetry_reader::<Position>("position", TELEMETRY_SCHEMA)
        .expect("reader");
    within(remote.start()).await.expect("remote start");

    assert!(!reader.has_data(), "telemetry must not replay history");

    // Live samples still flow.
    writer
        .write_forced(&Position {
            angle: 2.0,
            velocity: 0.5,
        })
        .await
        .expect("live write");
    let live = within(reader.next(false)).await.expect("live sample");
    assert_eq!(live.data.angle, 2.0);

    remote.close().await;
    writer_session.close().await;
}

#[tokio::test]
async fn unchanged_payload_is_suppressed_and_force_republishes() {
    let harness = Harness::new();

    let writer_session = harness.session("Camera");
    let writer = within(WriteTopic::<Position>::new(
        &writer_session,
        TopicKind::Telemetry,
        "position",
        TELEMETRY_SCHEMA,
    ))
    .await
    .expect("writer");

    let remote = Remote::new(harness.session("Camera")).expect("remote");
    let reader = remote
        .telemetry_reader::<Position>("position", TELEMETRY_SCHEMA)
        .expect("reader");
    within(remote.start()).await.expect("remote start");

    // NaN payloads must compare equal to themselves, or a periodic
    // publisher would republish forever.
    let sample = Position {
        angle: f64::NAN,
        velocity: 3.5,
    };
    let first = writer.write(&sample).await.expect("first write");
    assert!(first.is_some());
    let second = writer.write(&sample).await.expect("second write");
    assert!(second.is_none(), "unchanged payload must be suppressed");
    let forced = writer.write_forced(&sample).await.expect("forced write");
    assert!(forced > first.unwrap());

    let a = within(reader.next(false)).await.expect("first sample");
    assert!(a.data.angle.is_nan());
    let b = within(reader.next(false)).await.expect("forced sample");
    assert_eq!(b.seq_num, forced);
    assert!(
        reader.get_oldest().expect("queue").is_none(),
        "suppressed write must not reach the reader"
    );

    // A changed payload goes out again.
    let moved = writer
        .write(&Position {
            angle: 1.0,
            velocity: 3.5,
        })
        .await
        .expect("changed write");
    assert!(moved.is_some());

    remote.close().await;
    writer_session.close().await;
}

#[tokio::test]
async fn reader_after_close_fails_with_closed() {
    let harness = Harness::new();

    let remote = Remote::new(harness.session("Camera")).expect("remote");
    let reader = remote
        .telemetry_reader::<Position>("position", TELEMETRY_SCHEMA)
        .expect("reader");
    within(remote.start()).await.expect("remote start");
    remote.close().await;

    let err = reader.next(false).await.expect_err("closed");
    assert!(matches!(err, Error::Closed));
}
