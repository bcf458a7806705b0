//! Event topic identifiers used across transports.

/// Machine-friendly discriminator for subscribers that filter by topic.
#[must_use]
pub const fn event_kind(event: &crate::payloads::Event) -> &'static str {
    event.kind()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::{Event, InfoHash};

    #[test]
    fn event_kind_matches_payload() {
        assert_eq!(
            event_kind(&Event::TransferAdded {
                info_hash: InfoHash::new([1; 20]),
                name: "n".into()
            }),
            "transfer_added"
        );
        assert_eq!(
            event_kind(&Event::PauseStateChanged { paused: true }),
            "pause_state_changed"
        );
    }
}
