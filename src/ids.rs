use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

/// Source of opaque, globally unique identifiers (session ids, validation tokens).
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn new_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Random alphanumeric tokens, 64 characters by default.
#[derive(Debug, Clone, Copy)]
pub struct TokenIds {
    len: usize,
}

impl TokenIds {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Default for TokenIds {
    fn default() -> Self {
        Self::new(64)
    }
}

impl IdGenerator for TokenIds {
    fn new_id(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.len)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_ids_have_requested_length() {
        let id = TokenIds::default().new_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(TokenIds::new(16).new_id().len(), 16);
    }

    #[test]
    fn uuid_ids_do_not_repeat() {
        let ids: HashSet<String> = (0..1000).map(|_| UuidIds.new_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
