use std::sync::atomic::{AtomicI64, Ordering};

/// The global, monotonic reading id shared across every `readings_<k>` table.
///
/// Boot sequence (see the catalogue's `GlobalIdBoot`): a fresh `GlobalId` is
/// seeded either from the persisted `configuration_readings` row or, on an
/// ungraceful shutdown, from `max(id) + 1` across every readings table.
#[derive(Debug)]
pub struct GlobalId(AtomicI64);

impl GlobalId {
    pub fn new(next: i64) -> Self {
        GlobalId(AtomicI64::new(next))
    }

    /// Returns the id to bind into the next INSERT and advances the counter.
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// The next id that would be issued, without consuming it. Used when
    /// writing the value back to `configuration_readings` on shutdown.
    pub fn peek(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A dense, monotonic identifier for a `readings_<k>` table within a database file.
pub type TableId = i64;

/// A monotonic identifier for a `readings_<d>.db` attachment.
pub type DbId = i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_strictly_increasing_ids() {
        let id = GlobalId::new(1);
        let first = id.next();
        let second = id.next();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(second > first);
    }

    #[test]
    fn peek_does_not_consume() {
        let id = GlobalId::new(10);
        assert_eq!(id.peek(), 10);
        assert_eq!(id.peek(), 10);
        assert_eq!(id.next(), 10);
        assert_eq!(id.peek(), 11);
    }
}
