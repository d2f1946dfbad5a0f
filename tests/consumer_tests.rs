mod common;

use common::{encode, fast_consumer_config, memory_connection, wait_until, SoilReading, ValveCommand};
use dispatch_core::config::ConsumerConfig;
use dispatch_core::logging::LogLevel;
use dispatch_core::messaging::{
    BrokerTransport, Delivery, DeliveryOutcome, HandlerRegistry, UnroutablePolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "field-events";
const LIMIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn consumer_acknowledges_handled_messages() {
    let (broker, _sink, connection) = memory_connection();
    let registry = Arc::new(HandlerRegistry::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let recorded = seen.clone();
    registry.register_fn::<SoilReading, _, _>(move |reading| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().push(reading.sensor_id);
            Ok(())
        }
    });

    let consumer = connection
        .create_consumer(QUEUE, registry, fast_consumer_config())
        .await
        .unwrap();
    for seq in 0..3 {
        broker.send(QUEUE, encode(&common::reading(seq))).await.unwrap();
    }

    assert!(consumer.begin_processing().unwrap());
    assert!(!consumer.begin_processing().unwrap());
    assert!(wait_until(LIMIT, || broker.completed_count(QUEUE) == 3).await);

    assert_eq!(*seen.lock(), vec!["sensor-0", "sensor-1", "sensor-2"]);
    assert_eq!(broker.in_flight_count(QUEUE), 0);
    assert_eq!(consumer.stats().acknowledged, 3);

    consumer.shutdown(Duration::from_secs(1)).await;
    assert!(!consumer.is_processing());
}

#[tokio::test]
async fn failing_handler_dead_letters_exactly_once() {
    let (broker, sink, connection) = memory_connection();
    let registry = Arc::new(HandlerRegistry::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    registry.register_fn::<ValveCommand, _, _>(move |command| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err(anyhow::anyhow!("valve {} stuck", command.zone)) }
    });

    let consumer = connection
        .create_consumer(QUEUE, registry, fast_consumer_config())
        .await
        .unwrap();
    broker
        .send(QUEUE, encode(&ValveCommand { zone: 4, open: true }))
        .await
        .unwrap();

    consumer.begin_processing().unwrap();
    assert!(wait_until(LIMIT, || broker.dead_letters(QUEUE).len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer.shutdown(Duration::from_secs(1)).await;

    let dead = broker.dead_letters(QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "handler_failure");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.completed_count(QUEUE), 0);
    assert_eq!(broker.in_flight_count(QUEUE), 0);

    let errors: Vec<_> = sink
        .records_from("Consumer")
        .into_iter()
        .filter(|record| record.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("valve 4 stuck"));
}

#[tokio::test]
async fn undecodable_body_is_dead_lettered_with_payload_logged() {
    let (broker, sink, connection) = memory_connection();
    let consumer = connection
        .create_consumer(QUEUE, Arc::new(HandlerRegistry::new()), fast_consumer_config())
        .await
        .unwrap();
    broker.send(QUEUE, b"not an envelope".to_vec()).await.unwrap();

    let delivery = broker
        .receive(QUEUE, Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    let outcome = consumer.process_delivery(delivery).await;

    assert!(outcome.is_dead_lettered());
    assert_eq!(broker.dead_letters(QUEUE)[0].reason, "decode_failure");
    let record = &sink.records_from("Consumer")[0];
    assert_eq!(record.data.as_ref().unwrap()["payload"], "not an envelope");
    assert_eq!(consumer.stats().decode_failures, 1);
}

#[tokio::test]
async fn unroutable_messages_left_in_place_do_not_stall_the_loop() {
    let (broker, sink, connection) = memory_connection();
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_callback::<SoilReading, _>(|_| Ok(()));

    let config = ConsumerConfig {
        unroutable_policy: UnroutablePolicy::Leave,
        ..fast_consumer_config()
    };
    let consumer = connection.create_consumer(QUEUE, registry, config).await.unwrap();

    broker
        .send(QUEUE, encode(&ValveCommand { zone: 1, open: false }))
        .await
        .unwrap();
    broker.send(QUEUE, encode(&common::reading(9))).await.unwrap();

    consumer.begin_processing().unwrap();
    assert!(wait_until(LIMIT, || broker.completed_count(QUEUE) == 1).await);
    consumer.shutdown(Duration::from_secs(1)).await;

    assert_eq!(broker.in_flight_count(QUEUE), 1);
    assert!(broker.dead_letters(QUEUE).is_empty());
    assert_eq!(consumer.stats().unroutable, 1);
    assert!(sink
        .records_from("Consumer")
        .iter()
        .any(|record| record.message == "Handler not found for farm.irrigation.ValveCommand"));
}

#[tokio::test]
async fn unroutable_messages_are_dead_lettered_by_default() {
    let (broker, _sink, connection) = memory_connection();
    let consumer = connection
        .create_consumer(QUEUE, Arc::new(HandlerRegistry::new()), fast_consumer_config())
        .await
        .unwrap();
    broker
        .send(QUEUE, encode(&ValveCommand { zone: 2, open: true }))
        .await
        .unwrap();

    let delivery: Delivery = broker
        .receive(QUEUE, Duration::from_secs(30), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    let outcome = consumer.process_delivery(delivery).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Unroutable {
            dead_lettered: true,
            ..
        }
    ));
    assert_eq!(broker.dead_letters(QUEUE)[0].reason, "unroutable");
}

#[tokio::test]
async fn panicking_callback_is_contained() {
    let (broker, _sink, connection) = memory_connection();
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_callback::<SoilReading, _>(|reading| {
        if reading.moisture > 0.5 {
            panic!("sensor {} overflow", reading.sensor_id);
        }
        Ok(())
    });

    let consumer = connection
        .create_consumer(QUEUE, registry, fast_consumer_config())
        .await
        .unwrap();
    broker.send(QUEUE, encode(&common::reading(8))).await.unwrap();
    broker.send(QUEUE, encode(&common::reading(1))).await.unwrap();

    consumer.begin_processing().unwrap();
    assert!(wait_until(LIMIT, || broker.completed_count(QUEUE) == 1).await);
    consumer.shutdown(Duration::from_secs(1)).await;

    assert_eq!(broker.dead_letters(QUEUE).len(), 1);
    assert_eq!(consumer.stats().handler_failures, 1);
}

#[tokio::test]
async fn receive_errors_are_logged_and_retried() {
    let (broker, sink, connection) = memory_connection();
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_callback::<SoilReading, _>(|_| Ok(()));

    let consumer = connection
        .create_consumer(QUEUE, registry, fast_consumer_config())
        .await
        .unwrap();
    broker.fail_next_receives(2);
    broker.send(QUEUE, encode(&common::reading(0))).await.unwrap();

    consumer.begin_processing().unwrap();
    assert!(wait_until(LIMIT, || broker.completed_count(QUEUE) == 1).await);
    consumer.shutdown(Duration::from_secs(1)).await;

    assert_eq!(consumer.stats().transport_errors, 2);
    assert_eq!(sink.records_at_least(LogLevel::Error).len(), 2);
}

#[tokio::test]
async fn closing_the_connection_stops_processing() {
    let (broker, _sink, connection) = memory_connection();
    let consumer = connection
        .create_consumer(QUEUE, Arc::new(HandlerRegistry::new()), fast_consumer_config())
        .await
        .unwrap();
    consumer.begin_processing().unwrap();

    connection.close().await.unwrap();
    assert!(broker.is_closed());
    assert!(wait_until(LIMIT, || !consumer.is_processing()).await);
    assert!(consumer.begin_processing().is_err());
}
