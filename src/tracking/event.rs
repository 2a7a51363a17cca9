use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message_db::{stream::id, Message, WriteMessage};
use crate::tracking::error::{HandlerError, PublishFailure};
use crate::tracking::topic::Topic;

/// Message type of location updates
pub const LOCATION_UPDATED: &str = "LocationUpdated";

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite and within [-90, 90] / [-180, 180]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One position report of one delivery
///
/// Serialized as the message data of a `LocationUpdated` message:
///
/// ```json
/// { "deliveryId": "DEL-1", "latitude": 40.7128, "longitude": -74.006, "timestamp": "2024-05-01T12:00:00.123Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateEvent {
    pub delivery_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdateEvent {
    /// Build a validated event
    pub fn new(
        delivery_id: &str,
        coordinates: Coordinates,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, PublishFailure> {
        if delivery_id.trim().is_empty() {
            return Err(PublishFailure::EmptyDeliveryId);
        }
        if !coordinates.is_valid() {
            return Err(PublishFailure::InvalidCoordinates {
                latitude: coordinates.latitude,
                longitude: coordinates.longitude,
            });
        }

        Ok(Self {
            delivery_id: delivery_id.to_string(),
            latitude: coordinates.latitude,
            longitude: coordinates.longitude,
            timestamp,
        })
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Encode for the delivery's stream in `topic`
    pub fn to_write_message(&self, topic: &Topic) -> Result<WriteMessage, serde_json::Error> {
        let data = serde_json::to_value(self)?;

        Ok(WriteMessage::new(
            topic.stream_for(&self.delivery_id),
            LOCATION_UPDATED,
            data,
        ))
    }

    /// Decode a message read from the topic
    ///
    /// The delivery id in the payload must match the stream the message was read from.
    pub fn from_message(message: &Message) -> Result<Self, HandlerError> {
        if message.message_type != LOCATION_UPDATED {
            return Err(HandlerError::Malformed(format!(
                "unexpected message type '{}'",
                message.message_type
            )));
        }

        let event: Self = serde_json::from_value(message.data.clone())
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;

        match id(&message.stream_name) {
            Some(stream_id) if stream_id == event.delivery_id => Ok(event),
            other => Err(HandlerError::Malformed(format!(
                "payload delivery id '{}' does not match stream id {:?}",
                event.delivery_id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn message_with(stream_name: &str, message_type: &str, data: serde_json::Value) -> Message {
        Message {
            id: Uuid::new_v4(),
            stream_name: stream_name.to_string(),
            message_type: message_type.to_string(),
            data,
            position: 0,
            global_position: 1,
            time: Utc::now(),
        }
    }

    #[test]
    fn test_rejects_empty_delivery_id() {
        let result = LocationUpdateEvent::new("  ", Coordinates::new(40.7, -74.0), sample_time());
        assert!(matches!(result, Err(PublishFailure::EmptyDeliveryId)));
    }

    #[test]
    fn test_rejects_non_finite_coordinates() {
        for coordinates in [
            Coordinates::new(f64::NAN, -74.0),
            Coordinates::new(40.7, f64::INFINITY),
            Coordinates::new(f64::NEG_INFINITY, f64::NAN),
            Coordinates::new(91.0, 0.0),
            Coordinates::new(0.0, -180.5),
        ] {
            let result = LocationUpdateEvent::new("DEL-1", coordinates, sample_time());
            assert!(
                matches!(result, Err(PublishFailure::InvalidCoordinates { .. })),
                "{:?} should be rejected",
                coordinates
            );
        }
    }

    #[test]
    fn test_wire_format() {
        let event =
            LocationUpdateEvent::new("DEL-1", Coordinates::new(40.7128, -74.006), sample_time())
                .unwrap();
        let msg = event.to_write_message(&Topic::default()).unwrap();

        assert_eq!(msg.stream_name, "delivery_location_updates-DEL-1");
        assert_eq!(msg.message_type, LOCATION_UPDATED);
        assert_eq!(
            msg.data,
            json!({
                "deliveryId": "DEL-1",
                "latitude": 40.7128,
                "longitude": -74.006,
                "timestamp": "2024-05-01T12:00:00Z"
            })
        );
    }

    #[test]
    fn test_decodes_published_payload() {
        let event =
            LocationUpdateEvent::new("DEL-1", Coordinates::new(40.714, -74.008), sample_time())
                .unwrap();
        let written = event.to_write_message(&Topic::default()).unwrap();
        let read = message_with(&written.stream_name, LOCATION_UPDATED, written.data);

        assert_eq!(LocationUpdateEvent::from_message(&read).unwrap(), event);
    }

    #[test]
    fn test_decode_rejects_foreign_message_type() {
        let read = message_with("delivery_location_updates-DEL-1", "DriverAssigned", json!({}));
        assert!(matches!(
            LocationUpdateEvent::from_message(&read),
            Err(HandlerError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_mismatched_stream() {
        let read = message_with(
            "delivery_location_updates-DEL-2",
            LOCATION_UPDATED,
            json!({
                "deliveryId": "DEL-1",
                "latitude": 1.0,
                "longitude": 2.0,
                "timestamp": "2024-05-01T12:00:00Z"
            }),
        );
        assert!(matches!(
            LocationUpdateEvent::from_message(&read),
            Err(HandlerError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let read = message_with(
            "delivery_location_updates-DEL-1",
            LOCATION_UPDATED,
            json!({ "deliveryId": "DEL-1", "latitude": 1.0 }),
        );
        assert!(matches!(
            LocationUpdateEvent::from_message(&read),
            Err(HandlerError::Malformed(_))
        ));
    }
}
