//! Core contracts and value types for the IM providers service.
//!
//! This crate holds the domain model handed to provider adapters, the outbound
//! command DTOs decoded from the message bus, and the naming helpers for routing
//! keys and per-instance queues.
pub mod command;
pub mod model;
pub mod parse;
pub mod routing;

pub use command::{
    DocumentDto, ImageDto, MessageCreatedV1, OutboundCommand, PeerDto, ValidationError,
};
pub use model::{Document, Image, Message, MessageResponse, Peer, PeerType};
pub use parse::{lenient_rfc3339_millis, lenient_uuid, now_millis};
pub use routing::{
    DEAD_LETTER_PREFIX, OUTBOUND_EXCHANGE, OUTBOUND_PROCESSOR_QUEUE, Operation,
    ROUTING_KEY_HEADERS, provider_from_routing_key, routing_key_from_metadata,
};
