//! Message envelope and the per-dispatch message stream.
//!
//! A `Message` is created once and never mutated afterwards; handlers and
//! strategies share it as `Arc<Message>` so distribution is zero-copy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a message represents to its handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// An instruction addressed to exactly one logical owner.
    Command,
    /// A fact other handlers may react to.
    Event,
    /// A read-side request expecting a response.
    QueryRequest,
    /// The response to a query request.
    QueryResponse,
    /// No declared intent.
    #[default]
    Unspecified,
}

/// Where a message is headed relative to the local process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageDirection {
    /// Arrived from outside; the root of a dispatch.
    Incoming,
    /// Produced and consumed inside this process.
    #[default]
    Internal,
    /// Bound for the external transport via the bus controller.
    Outgoing,
}

/// Immutable message envelope.
///
/// The `content_type` tag is what the handler registry matches on; the body
/// is an opaque JSON value owned by the handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    correlation_id: Option<Uuid>,
    kind: MessageKind,
    direction: MessageDirection,
    content_type: String,
    body: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a freshly generated id and no correlation.
    pub fn new(
        kind: MessageKind,
        content_type: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            kind,
            direction: MessageDirection::default(),
            content_type: content_type.into(),
            body,
            created_at: Utc::now(),
        }
    }

    /// Create a command message.
    pub fn command(content_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::Command, content_type, body)
    }

    /// Create an event message.
    pub fn event(content_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::Event, content_type, body)
    }

    /// Create a query request message.
    pub fn query_request(content_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(MessageKind::QueryRequest, content_type, body)
    }

    /// Create a query response correlated to its request.
    pub fn query_response(request: &Message, body: serde_json::Value) -> Self {
        Self::new(MessageKind::QueryResponse, request.content_type.clone(), body)
            .correlated_to(request.id)
    }

    /// Mark this message as bound for the external transport.
    ///
    /// Part of construction; messages are frozen once they enter a stream.
    pub fn outgoing(mut self) -> Self {
        self.direction = MessageDirection::Outgoing;
        self
    }

    /// Mark this message as the incoming root of a dispatch.
    pub fn incoming(mut self) -> Self {
        self.direction = MessageDirection::Incoming;
        self
    }

    /// Record the id of the message that caused this one.
    pub(crate) fn correlated_to(mut self, cause: Uuid) -> Self {
        self.correlation_id = Some(cause);
        self
    }

    /// Give an unspecified-kind message the kind its publication channel
    /// implies.
    pub(crate) fn defaulted_kind(mut self, kind: MessageKind) -> Self {
        if self.kind == MessageKind::Unspecified {
            self.kind = kind;
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the causing message; `None` for root messages.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn direction(&self) -> MessageDirection {
        self.direction
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == MessageDirection::Outgoing
    }
}

/// Ordered, append-only sequence of messages produced during one top-level
/// dispatch.
///
/// The cursor doubles as the cascade work-list: `next_pending` hands out
/// messages in insertion order exactly once. Appending at the tail while
/// draining from the cursor is what makes the cascade breadth-first.
#[derive(Default)]
pub struct MessageStream {
    entries: Vec<Arc<Message>>,
    cursor: usize,
}

impl MessageStream {
    pub fn append(&mut self, message: Arc<Message>) {
        self.entries.push(message);
    }

    /// Next message not yet handed to the dispatcher, advancing the cursor.
    pub fn next_pending(&mut self) -> Option<Arc<Message>> {
        let next = self.entries.get(self.cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }
        next
    }

    /// All messages in cascade processing order.
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_message_has_no_correlation() {
        let msg = Message::command("orders.place", json!({"qty": 2}));
        assert_eq!(msg.kind(), MessageKind::Command);
        assert!(msg.correlation_id().is_none());
        assert_eq!(msg.content_type(), "orders.place");
    }

    #[test]
    fn test_correlation_records_cause() {
        let cause = Message::command("orders.place", json!({}));
        let effect = Message::event("orders.placed", json!({})).correlated_to(cause.id());
        assert_eq!(effect.correlation_id(), Some(cause.id()));
    }

    #[test]
    fn test_query_response_correlates_to_request() {
        let request = Message::query_request("orders.by-id", json!({"id": 7}));
        let response = Message::query_response(&request, json!({"status": "open"}));
        assert_eq!(response.kind(), MessageKind::QueryResponse);
        assert_eq!(response.correlation_id(), Some(request.id()));
        assert_eq!(response.content_type(), request.content_type());
    }

    #[test]
    fn test_outgoing_direction() {
        let msg = Message::event("orders.placed", json!({})).outgoing();
        assert!(msg.is_outgoing());
    }

    #[test]
    fn test_stream_drains_in_insertion_order() {
        let mut stream = MessageStream::default();
        let a = Arc::new(Message::event("a", json!({})));
        let b = Arc::new(Message::event("b", json!({})));
        stream.append(a.clone());
        stream.append(b.clone());

        assert_eq!(stream.next_pending().unwrap().id(), a.id());
        // Tail appends land behind already-pending entries
        let c = Arc::new(Message::event("c", json!({})));
        stream.append(c.clone());
        assert_eq!(stream.next_pending().unwrap().id(), b.id());
        assert_eq!(stream.next_pending().unwrap().id(), c.id());
        assert!(stream.next_pending().is_none());
        assert_eq!(stream.len(), 3);
    }
}
