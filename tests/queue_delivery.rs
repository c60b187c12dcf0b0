//! Behaviour tests for the broker seam: durable log, offsets and delivery failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stockdw_stream::queue::encode_tick;
use stockdw_stream::shutdown;
use stockdw_stream::{
    publish_new_ticks, run_consumer, ConsumerSettings, MemoryBroker, NdjsonBroker,
    PublisherState, QueueError, TopicConsumer, TopicProducer,
};
use stockdw_tests::*;

const TOPIC: &str = "ticks_intraday_v1";
const GROUP: &str = "intraday_loader";

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        batch_size: 2,
        poll_timeout: Duration::from_millis(20),
    }
}

async fn consume_for(
    warehouse: &Warehouse,
    broker: &NdjsonBroker,
    window: Duration,
) -> stockdw_stream::ConsumerReport {
    let mut consumer = broker.consumer(TOPIC, GROUP).expect("consumer");
    let (tx, rx) = shutdown::channel();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(window).await;
        tx.send(true).expect("shutdown");
    });
    let report = run_consumer(warehouse, &mut consumer, settings(), rx)
        .await
        .expect("consume");
    stopper.await.expect("stopper");
    report
}

#[tokio::test]
async fn when_ticks_go_through_the_file_log_a_restarted_consumer_resumes_after_its_commit() {
    // Given: a file-backed topic with a consumer group committed at its start
    let (temp, warehouse) = temp_warehouse();
    let broker = NdjsonBroker::open(temp.path().join("queue")).expect("broker");
    broker
        .consumer(TOPIC, GROUP)
        .and_then(|mut consumer| consumer.commit(0))
        .expect("join group");
    let mut producer = broker.producer(TOPIC).expect("producer");
    let source = ScriptedSource::new();
    source.set_bars(
        "AAPL",
        vec![minute_bar("2024-06-03T14:31:00Z", 190.0, 190.5, 189.8, 190.2, 12_000)],
    );
    source.set_bars(
        "MSFT",
        vec![minute_bar("2024-06-03T14:31:00Z", 410.0, 411.0, 409.0, 410.5, 3_000)],
    );
    let symbols = [symbol("AAPL"), symbol("MSFT")];
    let mut state = PublisherState::default();

    // When: one cycle is published and consumed
    publish_new_ticks(
        source.as_ref(),
        &mut producer,
        &symbols,
        &mut state,
        ts("2024-06-03T14:33:00Z"),
        time::Duration::minutes(2),
    )
    .await
    .expect("publish");
    let first = consume_for(&warehouse, &broker, Duration::from_millis(300)).await;

    // Then: both ticks are staged and the group offset is persisted
    assert_eq!(first.staged, 2);
    assert_eq!(first.committed_offset, Some(2));

    // When: a later minute is published and a fresh consumer joins the same group
    source.set_bars(
        "AAPL",
        vec![minute_bar("2024-06-03T14:32:00Z", 190.2, 190.4, 190.0, 190.3, 9_000)],
    );
    publish_new_ticks(
        source.as_ref(),
        &mut producer,
        &symbols,
        &mut state,
        ts("2024-06-03T14:34:00Z"),
        time::Duration::minutes(2),
    )
    .await
    .expect("publish");
    let second = consume_for(&warehouse, &broker, Duration::from_millis(300)).await;

    // Then: only the new tick is read and nothing is staged twice
    assert_eq!(second.received, 1);
    assert_eq!(second.committed_offset, Some(3));
    assert_eq!(warehouse.staged_row_count().expect("count"), 3);
}

#[tokio::test]
async fn when_the_broker_rejects_a_batch_every_callback_sees_the_failure() {
    // Given: a closed broker
    let broker = MemoryBroker::new();
    let mut producer = broker.producer(TOPIC);
    broker.close();
    let outcomes: Arc<Mutex<Vec<bool>>> = Arc::default();

    // When: two ticks are produced and flushed
    for minute in ["14:31", "14:32"] {
        let tick = tick("AAPL", &format!("2024-06-03T{minute}:00Z"), 1.0, 1.0, 1.0, 1.0, 1);
        let sink = Arc::clone(&outcomes);
        producer.produce(
            minute,
            encode_tick(0, ts("2024-06-03T14:40:00Z"), &tick).expect("encode"),
            Box::new(move |outcome: Result<u64, &QueueError>| {
                sink.lock().expect("outcomes").push(outcome.is_ok());
            }),
        );
    }
    let flushed = producer.flush();

    // Then: the flush fails and each message reports a failed delivery
    assert!(matches!(flushed, Err(QueueError::Closed { .. })));
    assert_eq!(*outcomes.lock().expect("outcomes"), vec![false, false]);
    assert!(broker.is_empty(TOPIC));
}

#[tokio::test]
async fn when_delivery_fails_the_publisher_does_not_retry_the_tick() {
    // Given: a closed broker and a provider with one new bar
    let broker = MemoryBroker::new();
    let mut producer = broker.producer(TOPIC);
    broker.close();
    let source = ScriptedSource::new();
    source.set_bars(
        "AAPL",
        vec![minute_bar("2024-06-03T14:31:00Z", 1.0, 1.0, 1.0, 1.0, 1)],
    );
    let mut state = PublisherState::default();
    let symbols = [symbol("AAPL")];

    // When: two cycles run
    let first = publish_new_ticks(
        source.as_ref(),
        &mut producer,
        &symbols,
        &mut state,
        ts("2024-06-03T14:33:00Z"),
        time::Duration::minutes(2),
    )
    .await
    .expect("a failed delivery does not fail the cycle");
    let second = publish_new_ticks(
        source.as_ref(),
        &mut producer,
        &symbols,
        &mut state,
        ts("2024-06-03T14:34:00Z"),
        time::Duration::minutes(2),
    )
    .await
    .expect("second cycle");

    // Then: the tick counts as published once and never reaches the topic
    assert_eq!((first.published, second.published), (1, 0));
    assert!(broker.is_empty(TOPIC));
}
