//! End-to-end command protocol tests over the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use apache_avro::Schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use controlbus_client::topics::{CommandHandler, TypedSample};
use controlbus_client::{AckCode, Controller, Error, Remote, Result};
use controlbus_core::{Ack, Envelope, TopicKey, ACK_SCHEMA_JSON};

use common::{within, Harness};

const SET_LEVEL_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "setLevel",
    "fields": [{"name": "level", "type": "int"}]
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetLevel {
    level: i32,
}

struct SetLevelHandler {
    delay: Duration,
    fail_above: i32,
}

#[async_trait]
impl CommandHandler<SetLevel> for SetLevelHandler {
    async fn handle(&self, command: TypedSample<SetLevel>) -> Result<Option<String>> {
        tokio::time::sleep(self.delay).await;
        if command.data.level > self.fail_above {
            return Err(Error::Expected(format!(
                "level {} out of range",
                command.data.level
            )));
        }
        Ok(Some(format!("level set to {}", command.data.level)))
    }
}

/// Read every acknowledgement published for a component, in publish order.
async fn ack_log(harness: &Harness, component: &str) -> Vec<Ack> {
    let topic = TopicKey::ackcmd(component).broker_name("utest");
    let broker: Arc<dyn controlbus_client::broker::Broker> =
        Arc::new(Arc::clone(&harness.broker));
    let mut sub = broker.subscribe(vec![topic.clone()]).await.expect("subscribe");
    sub.seek(&topic, 0).await.expect("seek");
    let schema = Schema::parse_str(ACK_SCHEMA_JSON).expect("ack schema");
    let mut acks = Vec::new();
    for record in sub.poll(100, Duration::from_millis(50)).await.expect("poll") {
        let (_, envelope) = Envelope::decode(&record.payload).expect("envelope");
        let value = envelope.decode_payload(&schema).expect("payload");
        acks.push(apache_avro::from_value::<Ack>(&value).expect("ack"));
    }
    acks
}

#[tokio::test]
async fn command_completes_with_result() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::ZERO,
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
        .await
        .expect("command endpoint");
    within(remote.start()).await.expect("remote start");

    let ack = within(cmd.start(&SetLevel { level: 3 }, Duration::from_secs(5)))
        .await
        .expect("command succeeds");
    assert_eq!(ack.code, AckCode::Complete);
    assert_eq!(ack.result, "level set to 3");

    remote.close().await;
    controller.close().await;
}

#[tokio::test]
async fn handler_error_becomes_failed_ack() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::ZERO,
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
        .await
        .expect("command endpoint");
    within(remote.start()).await.expect("remote start");

    let err = within(cmd.start(&SetLevel { level: 99 }, Duration::from_secs(5)))
        .await
        .expect_err("command fails");
    match err {
        Error::CommandFailed(ack) => {
            assert_eq!(ack.code, AckCode::Failed);
            assert!(ack.result.contains("out of range"), "result: {}", ack.result);
        }
        other => panic!("expected CommandFailed, got {other}"),
    }

    remote.close().await;
    controller.close().await;
}

#[tokio::test]
async fn slow_command_acks_in_progress_then_one_terminal() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::from_millis(50),
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
        .await
        .expect("command endpoint");
    within(remote.start()).await.expect("remote start");

    let ack = within(cmd.start(&SetLevel { level: 1 }, Duration::from_secs(5)))
        .await
        .expect("command succeeds");
    assert_eq!(ack.code, AckCode::Complete);

    // The wire log must show in-progress strictly before the single
    // terminal code.
    let acks = ack_log(&harness, "Dome").await;
    let seq_num = ack.seq_num;
    let for_cmd: Vec<&Ack> = acks.iter().filter(|a| a.seq_num == seq_num).collect();
    assert_eq!(for_cmd.len(), 2, "acks: {for_cmd:?}");
    assert_eq!(for_cmd[0].code, AckCode::InProgress);
    assert_eq!(for_cmd[1].code, AckCode::Complete);
    assert_eq!(
        for_cmd.iter().filter(|a| a.code.is_terminal()).count(),
        1,
        "exactly one terminal ack"
    );

    remote.close().await;
    controller.close().await;
}

#[tokio::test]
async fn overlapping_command_is_rejected_while_first_runs() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::from_millis(200),
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = Arc::new(
        within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
            .await
            .expect("command endpoint"),
    );
    within(remote.start()).await.expect("remote start");

    let first = {
        let cmd = Arc::clone(&cmd);
        tokio::spawn(async move { cmd.start(&SetLevel { level: 1 }, Duration::from_secs(5)).await })
    };
    // Give the first instance time to reach the handler.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = within(cmd.start(&SetLevel { level: 2 }, Duration::from_secs(5))).await;

    match second {
        Err(Error::CommandFailed(ack)) => {
            assert!(
                ack.result.contains("already executing"),
                "result: {}",
                ack.result
            );
        }
        other => panic!("expected busy rejection, got {other:?}"),
    }
    let first = within(first).await.expect("join").expect("first succeeds");
    assert_eq!(first.code, AckCode::Complete);

    remote.close().await;
    controller.close().await;
}

#[tokio::test]
async fn close_mid_handler_acks_aborted() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::from_secs(30),
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = Arc::new(
        within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
            .await
            .expect("command endpoint"),
    );
    within(remote.start()).await.expect("remote start");

    let issued = {
        let cmd = Arc::clone(&cmd);
        tokio::spawn(async move { cmd.start(&SetLevel { level: 1 }, Duration::from_secs(60)).await })
    };
    // Let the command reach the handler before tearing the controller down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    within(controller.close()).await;

    // The cancelled handler must still settle with a terminal aborted ack.
    let err = within(issued).await.expect("join").expect_err("aborted");
    let seq_num = match err {
        Error::CommandFailed(ack) => {
            assert_eq!(ack.code, AckCode::Aborted);
            ack.seq_num
        }
        other => panic!("expected CommandFailed, got {other}"),
    };

    let acks = ack_log(&harness, "Dome").await;
    let for_cmd: Vec<&Ack> = acks.iter().filter(|a| a.seq_num == seq_num).collect();
    assert_eq!(
        for_cmd.iter().filter(|a| a.code.is_terminal()).count(),
        1,
        "exactly one terminal ack: {for_cmd:?}"
    );
    assert_eq!(for_cmd.last().expect("acks").code, AckCode::Aborted);

    remote.close().await;
}

#[tokio::test]
async fn rejected_command_name_gets_terminal_failed() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller.reject_command("park").expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = within(remote.command::<SetLevel>("park", SET_LEVEL_SCHEMA))
        .await
        .expect("command endpoint");
    within(remote.start()).await.expect("remote start");

    let err = within(cmd.start(&SetLevel { level: 0 }, Duration::from_secs(5)))
        .await
        .expect_err("rejected");
    match err {
        Error::CommandFailed(ack) => {
            assert!(ack.result.contains("park"), "result: {}", ack.result);
        }
        other => panic!("expected CommandFailed, got {other}"),
    }

    remote.close().await;
    controller.close().await;
}

#[tokio::test]
async fn duplicate_command_registration_fails_fast() {
    let harness = Harness::new();
    let controller = Controller::new(harness.session("Dome"));
    let handler = Arc::new(SetLevelHandler {
        delay: Duration::ZERO,
        fail_above: 10,
    }) as Arc<dyn CommandHandler<SetLevel>>;
    controller
        .add_command("setLevel", SET_LEVEL_SCHEMA, Arc::clone(&handler))
        .expect("first registration");
    let err = controller
        .add_command("setLevel", SET_LEVEL_SCHEMA, handler)
        .expect_err("second registration");
    assert!(matches!(err, Error::Startup(_)));
}

#[tokio::test]
async fn command_after_close_fails_with_closed() {
    let harness = Harness::new();

    let controller = Controller::new(harness.session("Dome"));
    controller
        .add_command(
            "setLevel",
            SET_LEVEL_SCHEMA,
            Arc::new(SetLevelHandler {
                delay: Duration::ZERO,
                fail_above: 10,
            }) as Arc<dyn CommandHandler<SetLevel>>,
        )
        .expect("register");
    within(controller.start()).await.expect("controller start");

    let remote = Remote::new(harness.session("Dome")).expect("remote");
    let cmd = within(remote.command::<SetLevel>("setLevel", SET_LEVEL_SCHEMA))
        .await
        .expect("command endpoint");
    within(remote.start()).await.expect("remote start");
    remote.close().await;

    let err = cmd
        .start(&SetLevel { level: 1 }, Duration::from_secs(1))
        .await
        .expect_err("closed session");
    assert!(matches!(err, Error::Closed));

    controller.close().await;
}
