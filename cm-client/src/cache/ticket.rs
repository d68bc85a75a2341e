use cm_proto::CLIENT_APP_ID;
use tracing::debug;

/// Holds the client app's ownership ticket.
#[derive(Debug, Default)]
pub struct OwnershipTicketCache {
    ticket: Option<Vec<u8>>,
}

impl OwnershipTicketCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the ticket if it belongs to the client app. Returns whether it was kept.
    pub fn store(&mut self, app_id: u32, ticket: Vec<u8>) -> bool {
        if app_id != CLIENT_APP_ID {
            debug!("Ignoring ownership ticket for app {}", app_id);
            return false;
        }
        self.ticket = Some(ticket);
        true
    }

    pub fn get(&self) -> Option<&[u8]> {
        self.ticket.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_client_app_kept() {
        let mut cache = OwnershipTicketCache::new();

        assert!(!cache.store(440, vec![1]));
        assert!(cache.get().is_none());

        assert!(cache.store(CLIENT_APP_ID, vec![2, 3]));
        assert_eq!(cache.get(), Some(&[2u8, 3][..]));
    }
}
