use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::entry::{EntryId, TransportEntry};
use crate::errors::{HubError, Result};

/// Listing view of a pending entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntrySummary {
    pub id: EntryId,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
}

impl From<&TransportEntry> for EntrySummary {
    fn from(entry: &TransportEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            size: entry.content_length,
            content_type: entry.content_type.clone(),
        }
    }
}

/// The in-memory registry of uploads waiting for a downloader.
///
/// Every operation takes the same lock, so `claim` has exactly one winner
/// per id no matter how many downloaders race for it. Ids come from a
/// monotonic counter and are never handed out twice.
#[derive(Debug)]
pub struct Shelf {
    entries: Mutex<HashMap<EntryId, TransportEntry>>,
    next_id: AtomicU64,
}

impl Default for Shelf {
    fn default() -> Self {
        Self::new()
    }
}

impl Shelf {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve a fresh identifier for an entry about to be registered.
    pub fn allocate_id(&self) -> EntryId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, entry: TransportEntry) -> Result<EntryId> {
        let mut entries = self.lock();
        let id = entry.id;
        if entries.contains_key(&id) {
            return Err(HubError::DuplicateId(id));
        }
        entries.insert(id, entry);
        Ok(id)
    }

    /// Remove and return the entry, granting exclusive consumption rights.
    pub fn claim(&self, id: EntryId) -> Result<TransportEntry> {
        self.lock()
            .remove(&id)
            .ok_or_else(|| not_found(id))
    }

    /// Look an entry up without claiming it.
    pub fn lookup(&self, id: EntryId) -> Result<EntrySummary> {
        self.lock()
            .get(&id)
            .map(EntrySummary::from)
            .ok_or_else(|| not_found(id))
    }

    /// Drop an unclaimed entry whose uploader is gone. Returns `false` if a
    /// downloader already claimed it.
    pub fn withdraw(&self, id: EntryId) -> bool {
        // The entry (and its completion) must drop after the guard is released
        let withdrawn = self.lock().remove(&id);
        withdrawn.is_some()
    }

    /// Point-in-time view of all pending entries, in registration order.
    pub fn snapshot(&self) -> Vec<EntrySummary> {
        let mut summaries: Vec<EntrySummary> = self
            .lock()
            .values()
            .map(EntrySummary::from)
            .collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntryId, TransportEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(id: EntryId) -> HubError {
    HubError::NotFound(format!("Entry {} not found", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{completion, BodyStream, CompletionWaiter};
    use std::sync::{Arc, Barrier};
    use tokio::io::AsyncReadExt;

    fn entry(
        shelf: &Shelf,
        name: &str,
        size: u64,
    ) -> (TransportEntry, CompletionWaiter) {
        let (completion, waiter) = completion();
        let stream: BodyStream = Box::pin(&b""[..]);
        let entry = TransportEntry::new(
            shelf.allocate_id(),
            name.to_owned(),
            Some("text/plain".to_owned()),
            size,
            stream.take(0).take(0),
            completion,
        );
        (entry, waiter)
    }

    #[test]
    fn ids_are_never_reused() {
        let shelf = Shelf::new();
        let first = shelf.allocate_id();
        let second = shelf.allocate_id();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn claim_is_single_shot() {
        let shelf = Shelf::new();
        let (entry, _waiter) = entry(&shelf, "a.txt", 5);
        let id = shelf.insert(entry).unwrap();

        let claimed = shelf.claim(id).unwrap();
        assert_eq!(claimed.name, "a.txt");
        assert!(matches!(shelf.claim(id), Err(HubError::NotFound(_))));
        assert!(shelf.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let shelf = Shelf::new();
        let (first, _w1) = entry(&shelf, "a", 1);
        let (mut second, _w2) = entry(&shelf, "b", 2);
        second.id = first.id;

        shelf.insert(first).unwrap();
        assert!(matches!(shelf.insert(second), Err(HubError::DuplicateId(1))));
        assert_eq!(shelf.len(), 1);
    }

    #[test]
    fn lookup_does_not_claim() {
        let shelf = Shelf::new();
        let (entry, _waiter) = entry(&shelf, "report.pdf", 42);
        let id = shelf.insert(entry).unwrap();

        let summary = shelf.lookup(id).unwrap();
        assert_eq!(summary.name, "report.pdf");
        assert_eq!(summary.size, 42);
        assert!(shelf.claim(id).is_ok());
        assert!(shelf.lookup(id).is_err());
    }

    #[test]
    fn snapshot_is_ordered_and_non_destructive() {
        let shelf = Shelf::new();
        let mut waiters = Vec::new();
        for name in ["one", "two", "three"] {
            let (entry, waiter) = entry(&shelf, name, name.len() as u64);
            shelf.insert(entry).unwrap();
            waiters.push(waiter);
        }

        let names: Vec<String> = shelf
            .snapshot()
            .into_iter()
            .map(|summary| summary.name)
            .collect();
        assert_eq!(names, ["one", "two", "three"]);
        assert_eq!(shelf.len(), 3);
    }

    #[tokio::test]
    async fn withdraw_fails_the_waiting_uploader() {
        let shelf = Shelf::new();
        let (entry, mut waiter) = entry(&shelf, "a", 1);
        let id = shelf.insert(entry).unwrap();

        assert!(shelf.withdraw(id));
        assert!(!shelf.withdraw(id));
        assert!(waiter.wait().await.is_err());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let shelf = Arc::new(Shelf::new());
        let (entry, _waiter) = entry(&shelf, "contested", 9);
        let id = shelf.insert(entry).unwrap();

        let contenders = 16;
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let shelf = shelf.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    shelf.claim(id).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
