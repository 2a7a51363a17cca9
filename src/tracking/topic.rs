use std::fmt;

use thiserror::Error;

use crate::message_db::stream::{is_category, stream_name};

/// Default topic (Message DB category) of location updates
pub const DEFAULT_TOPIC: &str = "delivery_location_updates";

/// Reasons a topic name is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name must not be empty")]
    Empty,

    #[error("topic name '{0}' must not contain '-', it separates the category from the stream id")]
    ContainsHyphen(String),

    #[error("topic name '{0}' must not contain ':', it qualifies position and dead-letter categories")]
    ContainsColon(String),

    #[error("topic name '{0}' must not contain whitespace")]
    ContainsWhitespace(String),
}

/// Name of the logical stream that carries location updates
///
/// Maps to a Message DB category. Every delivery gets its own stream
/// `{topic}-{delivery_id}` inside it, which is what keeps one delivery's
/// updates in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();

        if name.is_empty() {
            return Err(TopicError::Empty);
        }
        if !is_category(&name) {
            return Err(TopicError::ContainsHyphen(name));
        }
        if name.contains(':') {
            return Err(TopicError::ContainsColon(name));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(TopicError::ContainsWhitespace(name));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream holding the updates of one delivery
    pub fn stream_for(&self, delivery_id: &str) -> String {
        stream_name(&self.0, delivery_id)
    }

    /// Stream receiving the dead-lettered updates of one delivery
    pub fn dead_letter_stream_for(&self, delivery_id: &str) -> String {
        stream_name(&format!("{}:deadLetter", self.0), delivery_id)
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self(DEFAULT_TOPIC.to_string())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_db::stream::{category, id};

    #[test]
    fn test_default_topic_is_valid() {
        assert_eq!(Topic::new(DEFAULT_TOPIC).unwrap(), Topic::default());
    }

    #[test]
    fn test_rejects_invalid_names() {
        assert_eq!(Topic::new(""), Err(TopicError::Empty));
        assert_eq!(
            Topic::new("delivery-location-updates"),
            Err(TopicError::ContainsHyphen("delivery-location-updates".to_string()))
        );
        assert!(matches!(
            Topic::new("delivery updates"),
            Err(TopicError::ContainsWhitespace(_))
        ));
    }

    #[test]
    fn test_rejects_names_that_collide_with_qualified_categories() {
        // "x:position" would share a category with the offsets of topic "x"
        for name in ["x:position", "x:deadLetter", "tracking:"] {
            assert_eq!(Topic::new(name), Err(TopicError::ContainsColon(name.to_string())));
        }
    }

    #[test]
    fn test_streams_keep_the_delivery_id_intact() {
        let topic = Topic::default();
        let stream = topic.stream_for("DEL-7");

        assert_eq!(stream, "delivery_location_updates-DEL-7");
        assert_eq!(category(&stream), "delivery_location_updates");
        assert_eq!(id(&stream), Some("DEL-7"));
    }

    #[test]
    fn test_dead_letters_live_in_their_own_category() {
        let topic = Topic::default();
        let stream = topic.dead_letter_stream_for("DEL-7");

        assert_eq!(stream, "delivery_location_updates:deadLetter-DEL-7");
        assert_ne!(category(&stream), topic.as_str());
    }
}
