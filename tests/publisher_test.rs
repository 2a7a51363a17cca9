mod common;

use delivery_tracking::tracking::{
    default_route, ConnectionManager, Coordinates, LocationPublisher, PublishFailure, Role,
    LOCATION_UPDATED,
};
use testcontainers::clients::Cli;

#[tokio::test]
async fn test_publish_appends_to_delivery_stream_in_order() {
    let docker = Cli::default();
    let container = docker.run(common::create_message_db_container());
    let manager = ConnectionManager::new(common::message_db_config(&container));
    let handle = manager.connect(Role::Publisher).await.unwrap();

    let topic = common::unique_topic();
    let publisher = LocationPublisher::new(handle.clone(), topic.clone());

    let mut acks = Vec::new();
    for waypoint in default_route() {
        acks.push(publisher.publish("DEL-1", waypoint.coordinates).await.unwrap());
    }

    let positions: Vec<i64> = acks.iter().map(|a| a.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert!(acks.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(acks.iter().all(|a| a.stream_name == topic.stream_for("DEL-1")));

    let messages = common::stream_messages(handle.client(), &topic.stream_for("DEL-1")).await;

    assert_eq!(messages.len(), 4);
    for ((message, ack), waypoint) in messages.iter().zip(&acks).zip(default_route()) {
        assert_eq!(message.id, ack.message_id);
        assert_eq!(message.message_type, LOCATION_UPDATED);
        assert_eq!(message.data["deliveryId"], "DEL-1");
        assert_eq!(message.data["latitude"], waypoint.coordinates.latitude);
        assert_eq!(message.data["longitude"], waypoint.coordinates.longitude);
        assert!(message.data["timestamp"].is_string());
    }

    manager.disconnect(&handle).unwrap();
}

#[tokio::test]
async fn test_deliveries_get_separate_streams() {
    let docker = Cli::default();
    let container = docker.run(common::create_message_db_container());
    let manager = ConnectionManager::new(common::message_db_config(&container));
    let handle = manager.connect(Role::Publisher).await.unwrap();
    let publisher = LocationPublisher::new(handle.clone(), common::unique_topic());

    let a = publisher.publish("DEL-A", Coordinates::new(1.0, 1.0)).await.unwrap();
    let b = publisher.publish("DEL-B", Coordinates::new(2.0, 2.0)).await.unwrap();
    let a2 = publisher.publish("DEL-A", Coordinates::new(1.5, 1.5)).await.unwrap();

    assert_ne!(a.stream_name, b.stream_name);
    assert_eq!((a.position, b.position, a2.position), (0, 0, 1));

    manager.disconnect(&handle).unwrap();
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_sending() {
    let docker = Cli::default();
    let container = docker.run(common::create_message_db_container());
    let manager = ConnectionManager::new(common::message_db_config(&container));
    let handle = manager.connect(Role::Publisher).await.unwrap();
    let topic = common::unique_topic();
    let publisher = LocationPublisher::new(handle.clone(), topic.clone());

    let err = publisher.publish("", Coordinates::new(40.7, -74.0)).await.unwrap_err();
    assert!(matches!(err.cause, PublishFailure::EmptyDeliveryId));

    let err = publisher.publish("DEL-1", Coordinates::new(f64::NAN, -74.0)).await.unwrap_err();
    assert_eq!(err.delivery_id, "DEL-1");
    assert!(matches!(err.cause, PublishFailure::InvalidCoordinates { .. }));

    let messages = common::stream_messages(handle.client(), &topic.stream_for("DEL-1")).await;
    assert!(messages.is_empty());

    manager.disconnect(&handle).unwrap();
}

#[tokio::test]
async fn test_publish_after_disconnect_fails() {
    let docker = Cli::default();
    let container = docker.run(common::create_message_db_container());
    let manager = ConnectionManager::new(common::message_db_config(&container));
    let handle = manager.connect(Role::Publisher).await.unwrap();
    let publisher = LocationPublisher::new(handle.clone(), common::unique_topic());

    manager.disconnect(&handle).unwrap();

    let err = publisher.publish("DEL-1", Coordinates::new(40.7, -74.0)).await.unwrap_err();
    assert!(matches!(err.cause, PublishFailure::NotConnected));
}
