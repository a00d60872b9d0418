// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: broker message to remote run, through the subscriber,
//! the deduplicator, the invoker and the status monitor.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use trigflow::broker::{MockBroker, MockBrokerHandle};
use trigflow::dedup::{CounterKind, TriggerDeduplicator};
use trigflow::descriptor::{OperationDescriptor, VariableBinding};
use trigflow::lifecycle::Service;
use trigflow::monitor::{ChannelListener, LifecycleEvent, OperationStatusMonitor};
use trigflow::subscriber::ReconnectingSubscriber;
use trigflow::trigger::{TriggerAction, TriggerController};
use trigflow_platform::{MockPlatform, OperationOutputs, RunHandle, StartRecord};

const TOPIC: &str = "mdt/welder/Count";
const WAIT: Duration = Duration::from_secs(5);

struct Pipeline {
    subscriber: ReconnectingSubscriber,
    broker: MockBrokerHandle,
    controller: Arc<TriggerController>,
    events: UnboundedReceiver<(RunHandle, LifecycleEvent)>,
}

impl Pipeline {
    async fn start(platform: Arc<MockPlatform>, action: TriggerAction) -> Self {
        let (listener, events) = ChannelListener::new();
        let monitor = OperationStatusMonitor::new(platform.clone());
        let controller = Arc::new(
            TriggerController::new(platform, monitor, action, Arc::new(listener))
                .with_poll_interval(Duration::from_millis(10))
                .with_dedup(TriggerDeduplicator::new(CounterKind::Integer)),
        );

        let (transport, broker) = MockBroker::new();
        let mut subscriber = ReconnectingSubscriber::new(Box::new(transport));
        subscriber.subscribe(TOPIC, controller.clone());
        subscriber.start().await.unwrap();

        broker.connect().await;
        assert!(broker.wait_for_subscribe_calls(1, WAIT).await);

        Self {
            subscriber,
            broker,
            controller,
            events,
        }
    }

    /// Collect events until `terminal` runs have ended.
    async fn events_until_terminal(&mut self, terminal: usize) -> Vec<(RunHandle, LifecycleEvent)> {
        let mut seen = Vec::new();
        let mut ended = 0;
        while ended < terminal {
            let next = tokio::time::timeout(WAIT, self.events.recv()).await;
            let Ok(Some(event)) = next else {
                panic!("only {} of {} runs ended: {:?}", ended, terminal, seen);
            };
            if event.1.is_terminal() {
                ended += 1;
            }
            seen.push(event);
        }
        seen
    }

    async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.controller.in_flight() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "runs still in flight");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn stop(mut self) {
        self.subscriber.stop(WAIT).await.unwrap();
        assert!(self.controller.shutdown(WAIT).await);
    }
}

fn workflow() -> TriggerAction {
    TriggerAction::Workflow {
        template_id: "weld-report".to_string(),
    }
}

// ============================================================================
// Deduplicated Triggers
// ============================================================================

#[tokio::test]
async fn test_repeated_counter_starts_one_run() {
    let platform = Arc::new(MockPlatform::new());
    let mut pipeline = Pipeline::start(platform.clone(), workflow()).await;

    for payload in ["1", "1", "2"] {
        assert!(pipeline.broker.publish(TOPIC, payload).await);
    }
    pipeline.events_until_terminal(2).await;

    assert_eq!(platform.start_count().await, 2);
    assert_eq!(pipeline.controller.accepted_count(), 2);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_between_valid_counters() {
    let platform = Arc::new(MockPlatform::new());
    let mut pipeline = Pipeline::start(platform.clone(), workflow()).await;

    for payload in ["5", "five", "", "6"] {
        assert!(pipeline.broker.publish(TOPIC, payload).await);
    }
    pipeline.events_until_terminal(2).await;

    assert_eq!(platform.start_count().await, 2);
    pipeline.stop().await;
}

#[tokio::test]
async fn test_each_run_reports_lifecycle_once_in_order() {
    let platform = Arc::new(MockPlatform::new());
    let mut pipeline = Pipeline::start(platform.clone(), workflow()).await;

    assert!(pipeline.broker.publish(TOPIC, "1").await);
    assert!(pipeline.broker.publish(TOPIC, "2").await);
    let seen = pipeline.events_until_terminal(2).await;

    for record in platform.started().await {
        let events: Vec<_> = seen
            .iter()
            .filter(|(run, _)| run == record.handle())
            .map(|(_, event)| event.clone())
            .collect();
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Starting,
                LifecycleEvent::Started,
                LifecycleEvent::Completed
            ],
            "run {}",
            record.handle()
        );
    }
    pipeline.stop().await;
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_trigger_after_reconnect_starts_run() {
    let platform = Arc::new(MockPlatform::new());
    let mut pipeline = Pipeline::start(platform.clone(), workflow()).await;

    assert!(pipeline.broker.publish(TOPIC, "1").await);
    pipeline.events_until_terminal(1).await;

    pipeline.broker.lose_connection("network down").await;
    pipeline.broker.connect().await;
    assert!(pipeline.broker.wait_for_subscribe_calls(2, WAIT).await);

    // Redelivered old counter, then a new one.
    assert!(pipeline.broker.publish(TOPIC, "1").await);
    assert!(pipeline.broker.publish(TOPIC, "2").await);
    pipeline.events_until_terminal(1).await;

    assert_eq!(platform.start_count().await, 2);
    pipeline.stop().await;
}

// ============================================================================
// Operation Action
// ============================================================================

#[tokio::test]
async fn test_operation_trigger_writes_outputs_back() {
    let mut outputs = OperationOutputs::new();
    outputs.insert("report".to_string(), json!("ok"));
    let platform = Arc::new(
        MockPlatform::new()
            .with_value("param:welder:Quantity", json!(12))
            .with_outputs(outputs),
    );
    let descriptor = OperationDescriptor::builder("weld-check", "op:welder:Check")
        .input(VariableBinding::new("quantity", "param:welder:Quantity"))
        .output(VariableBinding::new("report", "param:welder:Report"))
        .poll_interval(Duration::from_millis(10))
        .label("loglevel", "info")
        .build()
        .unwrap();
    let mut pipeline = Pipeline::start(
        platform.clone(),
        TriggerAction::Operation {
            descriptor: Arc::new(descriptor),
        },
    )
    .await;

    assert!(pipeline.broker.publish(TOPIC, "1").await);
    pipeline.events_until_terminal(1).await;
    pipeline.wait_idle().await;

    match &platform.started().await[0] {
        StartRecord::Operation { request, .. } => {
            assert_eq!(request.inputs["quantity"], json!(12));
            assert_eq!(request.labels["loglevel"], "info");
        }
        other => panic!("unexpected start {:?}", other),
    }
    let writes = platform.writes().await;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0.expression, "param:welder:Report");
    assert_eq!(writes[0].1, json!("ok"));

    pipeline.stop().await;
}
