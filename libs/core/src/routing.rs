//! Routing-key and queue naming helpers for the outbound command bus.

use std::fmt;
use std::str::FromStr;

/// Shared topic exchange carrying outbound message events.
pub const OUTBOUND_EXCHANGE: &str = "im_message.events";
/// Base name of the per-instance outbound processing queues.
pub const OUTBOUND_PROCESSOR_QUEUE: &str = "im-providers.outbound-processor.v1";
/// Metadata keys carrying the routing key, in lookup order.
pub const ROUTING_KEY_HEADERS: [&str; 2] = ["x-routing-key", "routing_key"];
/// Prefix of dead-letter subjects for commands that exhausted their retries.
pub const DEAD_LETTER_PREFIX: &str = "dlq.im_provider";

/// Outbound operations served by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    SendText,
    SendImage,
    SendDocument,
}

impl Operation {
    pub const ALL: [Operation; 3] = [
        Operation::SendText,
        Operation::SendImage,
        Operation::SendDocument,
    ];

    /// Handler name, also the last segment of the queue name.
    pub fn name(self) -> &'static str {
        match self {
            Operation::SendText => "SEND_TEXT_V1",
            Operation::SendImage => "SEND_IMAGE_V1",
            Operation::SendDocument => "SEND_DOCUMENT_V1",
        }
    }

    /// `<kind>` segment of the routing key.
    pub fn kind(self) -> &'static str {
        match self {
            Operation::SendText => "text",
            Operation::SendImage => "image",
            Operation::SendDocument => "document",
        }
    }

    /// Binding pattern that matches the operation for every provider.
    ///
    /// ```
    /// use imp_core::Operation;
    ///
    /// assert_eq!(
    ///     Operation::SendImage.binding_pattern(),
    ///     "im_provider.outbound.*.send.image.v1"
    /// );
    /// ```
    pub fn binding_pattern(self) -> String {
        format!("im_provider.outbound.*.send.{}.v1", self.kind())
    }

    /// Concrete routing key for one discriminator segment.
    pub fn routing_key(self, segment: &str) -> String {
        format!("im_provider.outbound.{}.send.{}.v1", norm(segment), self.kind())
    }

    /// Queue name unique to this process instance and operation.
    ///
    /// ```
    /// use imp_core::Operation;
    ///
    /// assert_eq!(
    ///     Operation::SendText.queue_name("a1b2c3d4"),
    ///     "im-providers.outbound-processor.v1.a1b2c3d4.SEND_TEXT_V1"
    /// );
    /// ```
    pub fn queue_name(self, instance_id: &str) -> String {
        format!("{OUTBOUND_PROCESSOR_QUEUE}.{}.{}", norm(instance_id), self.name())
    }

    pub fn dead_letter_subject(self) -> String {
        format!("{DEAD_LETTER_PREFIX}.{}", self.kind())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "send_text_v1" => Ok(Operation::SendText),
            "image" | "send_image_v1" => Ok(Operation::SendImage),
            "document" | "send_document_v1" => Ok(Operation::SendDocument),
            other => Err(format!("unknown operation `{other}`")),
        }
    }
}

/// Provider discriminator carried in the third dot-segment of a routing key.
///
/// ```
/// use imp_core::provider_from_routing_key;
///
/// assert_eq!(
///     provider_from_routing_key("im_provider.outbound.whatsapp.send.text.v1"),
///     Some("whatsapp")
/// );
/// assert_eq!(provider_from_routing_key("im_provider.outbound"), None);
/// ```
pub fn provider_from_routing_key(routing_key: &str) -> Option<&str> {
    routing_key
        .split('.')
        .nth(2)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

/// Looks up the routing key among message metadata, honouring
/// [`ROUTING_KEY_HEADERS`] order and skipping empty values.
pub fn routing_key_from_metadata<'a, F>(lookup: F) -> Option<&'a str>
where
    F: Fn(&str) -> Option<&'a str>,
{
    ROUTING_KEY_HEADERS
        .iter()
        .filter_map(|key| lookup(*key))
        .find(|value| !value.trim().is_empty())
}

/// Normalizes a segment so it cannot add routing-key levels or wildcards.
fn norm(s: &str) -> String {
    let t = s
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/', '.', '#'], "-");
    if t.is_empty() { "unknown".into() } else { t }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn routing_keys_format() {
        assert_eq!(
            Operation::SendText.routing_key("5"),
            "im_provider.outbound.5.send.text.v1"
        );
        assert_eq!(
            Operation::SendDocument.routing_key("what.s*app"),
            "im_provider.outbound.what-s-app.send.document.v1"
        );
        assert_eq!(
            Operation::SendDocument.dead_letter_subject(),
            "dlq.im_provider.document"
        );
    }

    #[test]
    fn queue_names_differ_per_instance_and_operation() {
        let a = Operation::SendText.queue_name("node-a");
        let b = Operation::SendText.queue_name("node-b");
        let c = Operation::SendImage.queue_name("node-a");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn provider_segment_extraction() {
        assert_eq!(provider_from_routing_key("a.b.c"), Some("c"));
        assert_eq!(provider_from_routing_key("a.b..d"), None);
        assert_eq!(provider_from_routing_key(""), None);
        assert_eq!(provider_from_routing_key("a.b"), None);
    }

    #[test]
    fn metadata_lookup_prefers_x_routing_key() {
        let mut meta = HashMap::new();
        meta.insert("routing_key".to_string(), "r.k.fallback".to_string());
        assert_eq!(
            routing_key_from_metadata(|k| meta.get(k).map(String::as_str)),
            Some("r.k.fallback")
        );
        meta.insert("x-routing-key".to_string(), "r.k.primary".to_string());
        assert_eq!(
            routing_key_from_metadata(|k| meta.get(k).map(String::as_str)),
            Some("r.k.primary")
        );
        meta.insert("x-routing-key".to_string(), " ".to_string());
        assert_eq!(
            routing_key_from_metadata(|k| meta.get(k).map(String::as_str)),
            Some("r.k.fallback")
        );
    }

    #[test]
    fn operations_parse_from_kind() {
        assert_eq!("TEXT".parse::<Operation>(), Ok(Operation::SendText));
        assert_eq!(
            "send_document_v1".parse::<Operation>(),
            Ok(Operation::SendDocument)
        );
        assert!("video".parse::<Operation>().is_err());
    }
}
