mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{eventually, ready_registry, FakeBroker, FakeLink, SENSOR};
use withub_core::config::BleConfig;
use withub_core::types::{DeviceAddress, QoS, SubscribeMessage};
use withub_devices::radio::NotificationSink;
use withub_devices::{DeviceError, DeviceRegistry};
use withub_gateway::{bridge, channel};
use withub_gateway::{Bridge, BridgeSink, BrokerEvent, Error, LinkEvent, NetworkManager, TopicLayout};

async fn ready_network() -> (Arc<NetworkManager>, Arc<FakeBroker>) {
    let broker = Arc::new(FakeBroker::new());
    let network = Arc::new(NetworkManager::new(Arc::new(FakeLink::new())));
    network.attach_broker(broker.clone());
    network.handle_link_event(LinkEvent::LinkUp).await;
    network.handle_link_event(LinkEvent::AddressAcquired).await;
    network.handle_broker_event(BrokerEvent::Connected).await;
    (network, broker)
}

#[test_log::test(tokio::test)]
async fn test_route_writes_payload() {
    let (network, _) = ready_network().await;
    let (registry, radio) = ready_registry(SENSOR).await;
    let bridge = Bridge::new(network, registry, TopicLayout::default());

    let message = SubscribeMessage::new("/wit/aabbccddeeff/control", vec![0xff, 0xaa, 0x01]);
    bridge.route_to_device(&message).await.unwrap();

    let writes = radio.peripheral(SENSOR).unwrap().writes();
    assert_eq!(writes.len(), 1);
    let (attribute, data, with_response) = &writes[0];
    assert_eq!(attribute.uuid, BleConfig::default().write_uuid);
    assert_eq!(data, &Bytes::from_static(&[0xff, 0xaa, 0x01]));
    assert!(*with_response);
}

#[tokio::test]
async fn test_route_drops_bad_topics() {
    let (network, _) = ready_network().await;
    let (registry, radio) = ready_registry(SENSOR).await;
    let bridge = Bridge::new(network, registry, TopicLayout::default());

    for topic in ["/bad", "/wit/aabbccddee/control", "/wit/zzbbccddeeff/control"] {
        let err = bridge
            .route_to_device(&SubscribeMessage::new(topic, vec![1u8]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTopic(_)), "{}", topic);
    }
    assert!(radio.peripheral(SENSOR).unwrap().written().is_empty());
}

#[tokio::test]
async fn test_route_unknown_device() {
    let (network, _) = ready_network().await;
    let (registry, radio) = ready_registry(SENSOR).await;
    let bridge = Bridge::new(network, registry, TopicLayout::default());

    let err = bridge
        .route_to_device(&SubscribeMessage::new("/wit/112233445566/control", vec![1u8]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::NotFound(_))));
    assert!(radio.peripheral(SENSOR).unwrap().written().is_empty());
}

#[tokio::test]
async fn test_route_device_not_ready() {
    let (network, _) = ready_network().await;
    let registry = Arc::new(DeviceRegistry::new(12));
    registry.reserve_or_get(SENSOR).unwrap();
    let bridge = Bridge::new(network, registry, TopicLayout::default());

    let err = bridge
        .route_to_device(&SubscribeMessage::new("/wit/aabbccddeeff/control", vec![1u8]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::NotReady { .. })));
}

#[tokio::test]
async fn test_forward_builds_data_topic() {
    let (network, broker) = ready_network().await;
    let bridge = Bridge::new(network, Arc::new(DeviceRegistry::new(12)), TopicLayout::default());

    bridge
        .forward_to_broker(SENSOR, Bytes::from_static(&[0x55, 0x61, 0x00]))
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "/wit/aabbccddeeff/data");
    assert_eq!(published[0].payload, Bytes::from_static(&[0x55, 0x61, 0x00]));
    assert_eq!(published[0].qos, QoS::AtMostOnce);
    assert!(!published[0].retain);
}

#[tokio::test]
async fn test_forward_drops_when_not_ready() {
    let broker = Arc::new(FakeBroker::new());
    let network = Arc::new(NetworkManager::new(Arc::new(FakeLink::new())));
    network.attach_broker(broker.clone());
    let bridge = Bridge::new(network, Arc::new(DeviceRegistry::new(12)), TopicLayout::default());

    let err = bridge
        .forward_to_broker(SENSOR, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_forward_with_custom_layout() {
    let (network, broker) = ready_network().await;
    let topics = TopicLayout {
        prefix: "/lab/sensors".to_string(),
        data_suffix: "imu".to_string(),
        control_suffix: "cmd".to_string(),
    };
    let bridge = Bridge::new(network, Arc::new(DeviceRegistry::new(12)), topics);

    let address = DeviceAddress::new([0, 1, 2, 3, 4, 5]);
    bridge
        .forward_to_broker(address, Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(broker.published()[0].topic, "/lab/sensors/000102030405/imu");
}

fn sink_for(network: Arc<NetworkManager>, depth: usize) -> BridgeSink {
    let bridge = Arc::new(Bridge::new(
        network,
        Arc::new(DeviceRegistry::new(12)),
        TopicLayout::default(),
    ));
    let (sink, _forwarder) = BridgeSink::spawn(bridge, depth);
    sink
}

#[test_log::test(tokio::test)]
async fn test_sink_forwards_notifications() {
    let (network, broker) = ready_network().await;
    let sink = sink_for(network, bridge::DEFAULT_OUTBOUND_DEPTH);

    sink.on_notification(SENSOR, Bytes::from_static(&[1, 2, 3]));
    assert!(eventually(Duration::from_secs(1), || broker.published().len() == 1).await);
    assert_eq!(broker.published()[0].topic, "/wit/aabbccddeeff/data");
}

#[tokio::test(start_paused = true)]
async fn test_sink_keeps_notification_order() {
    let (network, broker) = ready_network().await;
    broker.delay_publish(0, Duration::from_millis(50));
    let sink = sink_for(network, bridge::DEFAULT_OUTBOUND_DEPTH);

    for n in 0..4u8 {
        sink.on_notification(SENSOR, Bytes::from(vec![n]));
    }
    assert!(eventually(Duration::from_secs(1), || broker.published().len() == 4).await);
    assert_eq!(broker.published_bytes(), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_sink_drops_when_queue_full() {
    let (network, broker) = ready_network().await;
    broker.delay_publish(0, Duration::from_secs(1));
    let sink = sink_for(network, 2);

    // the forwarder takes the first payload and stalls on it
    sink.on_notification(SENSOR, Bytes::from_static(&[0]));
    tokio::time::sleep(Duration::from_millis(10)).await;

    for n in 1..5u8 {
        sink.on_notification(SENSOR, Bytes::from(vec![n]));
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.published_bytes(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_router_drains_channel() {
    let (network, _) = ready_network().await;
    let (registry, radio) = ready_registry(SENSOR).await;
    let bridge = Bridge::new(network, registry, TopicLayout::default());
    let (sender, receiver) = channel::channel(channel::DEFAULT_DEPTH);

    sender
        .send(SubscribeMessage::new("/bad", vec![0u8]))
        .await
        .unwrap();
    sender
        .send(SubscribeMessage::new("/wit/aabbccddeeff/control", vec![1u8]))
        .await
        .unwrap();
    sender
        .send(SubscribeMessage::new("/wit/aabbccddeeff/control", vec![2u8]))
        .await
        .unwrap();
    drop(sender);

    bridge.run_router(receiver).await;
    assert_eq!(
        radio.peripheral(SENSOR).unwrap().written(),
        vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])]
    );
}
