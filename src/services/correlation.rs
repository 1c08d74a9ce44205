//! Pending correlations between in-flight jobs and the callers awaiting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

struct Slot {
    ticket: u64,
    tx: oneshot::Sender<String>,
}

/// Map from job name to the waiter expecting its label.
///
/// Entries are inserted by [`CorrelationTable::register`] and removed exactly
/// once: by [`CorrelationTable::resolve`] when a result is claimed, or when
/// the returned [`Pending`] guard is dropped (success, timeout or an
/// abandoned request).
#[derive(Default)]
pub struct CorrelationTable {
    slots: Mutex<HashMap<String, Slot>>,
    next_ticket: AtomicU64,
    registered: Notify,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start awaiting `name`. A second registration for the same name
    /// replaces the first; the displaced waiter observes a closed slot.
    pub fn register(self: &Arc<Self>, name: &str) -> Pending {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let previous = self
            .slots
            .lock()
            .insert(name.to_string(), Slot { ticket, tx });
        if previous.is_some() {
            tracing::warn!(file_name = %name, "Replaced an in-flight correlation with the same name");
        }
        self.report_len();
        self.registered.notify_waiters();

        Pending {
            table: Arc::clone(self),
            name: name.to_string(),
            ticket,
            rx: Some(rx),
        }
    }

    /// Deliver `label` to the waiter for `name`. Returns `false` when nobody
    /// is waiting for that name (anymore).
    pub fn resolve(&self, name: &str, label: String) -> bool {
        let slot = self.slots.lock().remove(name);
        self.report_len();
        match slot {
            // The receiver may have been dropped between lookup and send;
            // the label is then simply discarded.
            Some(slot) => slot.tx.send(label).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Wait until at least one correlation is pending.
    pub async fn wait_for_pending(&self) {
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove_ticket(&self, name: &str, ticket: u64) {
        let mut slots = self.slots.lock();
        if slots.get(name).is_some_and(|slot| slot.ticket == ticket) {
            slots.remove(name);
        }
        drop(slots);
        self.report_len();
    }

    fn report_len(&self) {
        metrics::gauge!("classify_pending_correlations").set(self.len() as f64);
    }
}

/// A registered correlation. Dropping it removes the entry if it is still
/// owned by this registration.
pub struct Pending {
    table: Arc<CorrelationTable>,
    name: String,
    ticket: u64,
    rx: Option<oneshot::Receiver<String>>,
}

impl Pending {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves with the label, or `None` if this registration was displaced.
    pub async fn recv(&mut self) -> Option<String> {
        match self.rx.as_mut() {
            Some(rx) => {
                let label = rx.await.ok();
                self.rx = None;
                label
            }
            None => None,
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.table.remove_ticket(&self.name, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolve_delivers_label() {
        let table = Arc::new(CorrelationTable::new());
        let mut pending = table.register("a.jpg");
        assert!(table.contains("a.jpg"));

        assert!(table.resolve("a.jpg", "alice".to_string()));
        assert!(!table.contains("a.jpg"));
        assert_eq!(pending.recv().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_drop_removes_entry() {
        let table = Arc::new(CorrelationTable::new());
        let pending = table.register("a.jpg");
        assert_eq!(table.len(), 1);
        drop(pending);
        assert!(table.is_empty());
        assert!(!table.resolve("a.jpg", "late".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_resolved() {
        let table = Arc::new(CorrelationTable::new());
        let _pending = table.register("a.jpg");
        assert!(!table.resolve("b.jpg", "bob".to_string()));
        assert!(table.contains("a.jpg"));
    }

    #[tokio::test]
    async fn test_displaced_registration_keeps_newer_entry() {
        let table = Arc::new(CorrelationTable::new());
        let mut first = table.register("a.jpg");
        let mut second = table.register("a.jpg");

        assert_eq!(first.recv().await, None);
        drop(first);
        assert!(table.contains("a.jpg"));

        assert!(table.resolve("a.jpg", "alice".to_string()));
        assert_eq!(second.recv().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_wait_for_pending_wakes_on_register() {
        let table = Arc::new(CorrelationTable::new());
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_for_pending().await })
        };
        tokio::task::yield_now().await;
        let _pending = table.register("a.jpg");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
