//! Session controller tests against the loopback broker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::client::{Connector, LoopbackBroker, PublishOptions};
use crate::fingerprint::ExpectedUniverse;
use crate::stats::RunStats;

const TOPIC: &str = "verify/session";

fn context(connector: Arc<dyn Connector>) -> RunContext {
    RunContext::new(connector, Arc::new(RunStats::new().unwrap()))
}

fn spec(identity: &str, group: Option<&str>, session_expiry: u32) -> SessionSpec {
    SessionSpec {
        identity: identity.to_string(),
        group: group.map(str::to_string),
        base_topic: TOPIC.to_string(),
        qos: QoS::AtLeastOnce,
        session_expiry,
    }
}

async fn publisher(broker: &LoopbackBroker) -> Box<dyn Connection> {
    let (sink, _rx) = EventSink::channel(1);
    broker
        .connect(ConnectOptions::new("test-pub"), sink)
        .await
        .unwrap()
}

async fn publish_range(conn: &dyn Connection, range: std::ops::RangeInclusive<u64>) {
    for seq in range {
        conn.publish(
            TOPIC,
            Fingerprint::new("test-pub", seq).to_payload(),
            PublishOptions {
                qos: QoS::AtLeastOnce,
                message_expiry: None,
            },
        )
        .await
        .unwrap();
    }
}

/// Let the router task drain everything queued so far
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_subscribes_and_records() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx.clone());

    assert_eq!(controller.state(), SessionState::Disconnected);
    controller.connect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Active);
    assert_eq!(broker.subscribe_log("s-0"), vec![TOPIC.to_string()]);

    let publisher = publisher(&broker).await;
    publish_range(publisher.as_ref(), 1..=5).await;
    settle().await;

    let universe = ExpectedUniverse::new(["test-pub"], 5);
    assert!(ctx.ledger.missing_for("s-0", &universe).is_empty());
    assert_eq!(ctx.stats.received.get(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx);

    controller.connect().await.unwrap();
    controller.connect().await.unwrap();
    assert_eq!(controller.connects(), 1);
    assert_eq!(controller.subscribe_attempts(), 1);
    assert_eq!(broker.subscribe_log("s-0").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shared_member_subscribes_to_share_filter() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller =
        SessionController::new(spec("g-0-sub-0", Some("g-0"), 60), SessionSettings::default(), ctx);

    assert_eq!(controller.filter(), "$share/g-0/verify/session");
    controller.connect().await.unwrap();
    controller.disconnect().await;
    controller.reconnect().await.unwrap();
    assert_eq!(
        broker.subscribe_log("g-0-sub-0"),
        vec!["$share/g-0/verify/session".to_string(); 2]
    );
    assert_eq!(controller.last_filter().as_deref(), Some("$share/g-0/verify/session"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_expiry_receives_queued_messages() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 5), SessionSettings::default(), ctx.clone());
    let publisher = publisher(&broker).await;

    controller.connect().await.unwrap();
    publish_range(publisher.as_ref(), 1..=3).await;
    controller.disconnect().await;
    assert_eq!(controller.state(), SessionState::Disconnected);

    publish_range(publisher.as_ref(), 4..=6).await;
    assert_eq!(broker.queued_for("s-0"), 3);

    tokio::time::sleep(Duration::from_secs(3)).await;
    controller.reconnect().await.unwrap();
    settle().await;

    let universe = ExpectedUniverse::new(["test-pub"], 6);
    assert!(ctx.ledger.missing_for("s-0", &universe).is_empty());
    assert!(!controller.expiry_exceeded());
    assert_eq!(controller.connects(), 2);
    assert_eq!(ctx.stats.reconnects.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_beyond_expiry_is_flagged() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 5), SessionSettings::default(), ctx.clone());
    let publisher = publisher(&broker).await;

    controller.connect().await.unwrap();
    controller.disconnect().await;
    publish_range(publisher.as_ref(), 1..=3).await;

    tokio::time::sleep(Duration::from_secs(8)).await;
    controller.reconnect().await.unwrap();
    settle().await;

    let universe = ExpectedUniverse::new(["test-pub"], 3);
    assert_eq!(ctx.ledger.missing_for("s-0", &universe).len(), 3);
    assert!(controller.expiry_exceeded());
    assert_eq!(controller.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_and_reconnect_are_idempotent() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx);

    controller.disconnect().await;
    assert_eq!(controller.state(), SessionState::Disconnected);

    controller.connect().await.unwrap();
    controller.reconnect().await.unwrap();
    assert_eq!(controller.connects(), 1);

    controller.disconnect().await;
    controller.disconnect().await;
    assert!(!broker.is_online("s-0"));
    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_reports_identity() {
    let broker = LoopbackBroker::new();
    broker.refuse("s-0");
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx.clone());

    let err = controller.connect().await.unwrap_err();
    assert_eq!(err.identity(), "s-0");
    assert!(matches!(
        err,
        SessionError::Connect {
            source: ClientError::ConnectionRefused(_),
            ..
        }
    ));
    assert_eq!(controller.state(), SessionState::Disconnected);
    assert_eq!(ctx.stats.connect_failures.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_state_times_out() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx);

    let err = controller
        .wait_for_state(SessionState::Active, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Timeout {
            waiting_for: SessionState::Active,
            current: SessionState::Disconnected,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_triggers_auto_reconnect() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let settings = SessionSettings {
        auto_reconnect: true,
        reconnect_backoff: Duration::from_millis(100),
        ..Default::default()
    };
    let controller = SessionController::new(spec("s-0", None, 60), settings, ctx.clone());
    let mut states = controller.state_receiver();

    controller.connect().await.unwrap();
    assert!(broker.sever("s-0"));

    states
        .wait_for(|s| *s == SessionState::ConnectionLost)
        .await
        .unwrap();
    controller
        .wait_for_state(SessionState::Active, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(controller.connects(), 2);
    assert_eq!(ctx.stats.reconnects.get(), 1);
    assert!(broker.is_online("s-0"));
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_without_auto_reconnect_stays_lost() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx);

    controller.connect().await.unwrap();
    broker.sever("s-0");
    controller
        .wait_for_state(SessionState::ConnectionLost, Duration::from_secs(1))
        .await
        .unwrap();
    settle().await;
    assert_eq!(controller.state(), SessionState::ConnectionLost);

    controller.reconnect().await.unwrap();
    assert_eq!(controller.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_payload_recorded_as_anomaly() {
    let broker = LoopbackBroker::new();
    let ctx = context(Arc::new(broker.clone()));
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx.clone());
    controller.connect().await.unwrap();

    let publisher = publisher(&broker).await;
    publisher
        .publish(TOPIC, Bytes::from_static(b"not-a-fingerprint"), PublishOptions::default())
        .await
        .unwrap();
    settle().await;

    assert_eq!(ctx.ledger.anomalies_for("s-0").len(), 1);
    assert_eq!(ctx.stats.anomalies.get(), 1);
}

/// Connector that hands out inert connections and keeps every sink
#[derive(Default)]
struct CapturingConnector {
    sinks: Mutex<Vec<EventSink>>,
}

struct InertConnection;

#[async_trait]
impl Connection for InertConnection {
    async fn subscribe(&self, _filter: &str, qos: QoS) -> Result<QoS, ClientError> {
        Ok(qos)
    }

    async fn publish(&self, _: &str, _: Bytes, _: PublishOptions) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

#[async_trait]
impl Connector for CapturingConnector {
    fn describe(&self) -> String {
        "capturing".to_string()
    }

    async fn connect(
        &self,
        _options: ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Connection>, ClientError> {
        self.sinks.lock().push(events);
        Ok(Box::new(InertConnection))
    }
}

#[tokio::test(start_paused = true)]
async fn test_loss_on_superseded_connection_is_ignored() {
    let connector = Arc::new(CapturingConnector::default());
    let ctx = context(connector.clone());
    let controller = SessionController::new(spec("s-0", None, 60), SessionSettings::default(), ctx.clone());

    controller.connect().await.unwrap();
    controller.disconnect().await;
    controller.reconnect().await.unwrap();

    let (old, current) = {
        let sinks = connector.sinks.lock();
        (sinks[0].clone(), sinks[1].clone())
    };
    assert!(old.generation() < current.generation());

    // A late loss report and a late message from the first connection
    old.emit(ClientEvent::Error("late reset".to_string()));
    old.emit(ClientEvent::Message(InboundMessage {
        topic: Arc::from(TOPIC),
        payload: Fingerprint::new("p", 1).to_payload(),
        qos: QoS::AtLeastOnce,
        dup: false,
    }));
    settle().await;

    assert_eq!(controller.state(), SessionState::Active);
    assert_eq!(ctx.ledger.received_count("s-0"), 1);

    current.emit(ClientEvent::Error("reset".to_string()));
    controller
        .wait_for_state(SessionState::ConnectionLost, Duration::from_secs(1))
        .await
        .unwrap();
}
