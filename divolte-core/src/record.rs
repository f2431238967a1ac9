use crate::event_id::EventId;

/// A fully-encoded record ready to be appended into a container file.
///
/// Upstream mapping already encoded the buffer under the governing schema;
/// the sink treats it as opaque and only reads the timestamps. The event
/// time drives the sink's logical clock, the session id's timestamp picks
/// the round file the record bins into.
#[derive(Debug, Clone)]
pub struct AppendRecord {
    event_time_ms: u64,
    session_id: EventId,
    bytes: Vec<u8>,
}

impl AppendRecord {
    pub fn new(event_time_ms: u64, session_id: EventId, bytes: Vec<u8>) -> Self {
        Self {
            event_time_ms,
            session_id,
            bytes,
        }
    }

    /// Server-side timestamp of the event, in milliseconds since epoch.
    pub fn event_time_ms(&self) -> u64 {
        self.event_time_ms
    }

    /// Identifier of the session the event belongs to.
    pub fn session_id(&self) -> &EventId {
        &self.session_id
    }

    /// The encoded record, ready for `append_encoded`.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let session_id = EventId::generate_at(500);
        let record = AppendRecord::new(1200, session_id.clone(), vec![1, 2, 3]);

        assert_eq!(record.event_time_ms(), 1200);
        assert_eq!(record.session_id(), &session_id);
        assert_eq!(record.bytes(), &[1, 2, 3]);
    }
}
