//! # Event Notifiers
//!
//! A notifier is the wake-up path from the insert site to waiting stream
//! clients: without one, a client that finds no new events sleeps out its
//! full backoff before polling again.
//!
//! The capability is deliberately small (fire a signal, hand out something
//! to wait on), so in-process, no-op, and external (database trigger,
//! pub/sub bridge) variants are interchangeable peers. Stream clients depend
//! only on the trait.
//!
//! Signals are single-shot: a client takes a fresh [`EventSignal`] every
//! time it waits, and [`EventsNotifier::notify`] consumes all registered
//! signals. Notification must never block the inserting transaction, no
//! matter how many clients are registered or how slow they are.

use std::sync::Mutex;

use tokio::sync::oneshot;

// =============================================================================
// Signal
// =============================================================================

/// A one-shot wake-up handed out by [`EventsNotifier::subscribe`].
///
/// Resolves when the notifier fires (or goes away); the stub's signal never
/// resolves, leaving the stream client to its backoff timer.
pub struct EventSignal(Option<oneshot::Receiver<()>>);

impl EventSignal {
    /// A signal that never resolves.
    pub fn never() -> Self {
        Self(None)
    }

    /// A signal backed by a one-shot channel.
    pub fn from_receiver(rx: oneshot::Receiver<()>) -> Self {
        Self(Some(rx))
    }

    /// Waits for the signal to fire.
    ///
    /// A dropped notifier also resolves the wait; the client's next poll
    /// simply finds nothing new. Spurious wake-ups are harmless by design of
    /// the receive loop.
    pub async fn wait(self) {
        match self.0 {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending().await,
        }
    }
}

// =============================================================================
// Notifier Trait
// =============================================================================

/// Wake-up capability connecting the insert path to stream clients.
pub trait EventsNotifier: Send + Sync {
    /// Signals that a new event was committed.
    ///
    /// Called by producers after their transaction commits, via the
    /// [`NotifyHandle`](crate::table::NotifyHandle) returned from insert.
    /// Must never block.
    fn notify(&self);

    /// Registers and returns a fresh single-shot signal.
    ///
    /// Called by a stream client each time it is about to wait for events.
    fn subscribe(&self) -> EventSignal;
}

// =============================================================================
// Built-in Variants
// =============================================================================

/// Notifier that does nothing; stream clients rely purely on polling with
/// backoff.
#[derive(Default)]
pub struct StubNotifier;

impl EventsNotifier for StubNotifier {
    fn notify(&self) {}

    fn subscribe(&self) -> EventSignal {
        EventSignal::never()
    }
}

/// In-process notifier.
///
/// Keeps a list of registered one-shot senders; `notify` fires them all and
/// clears the list. One-shot sends cannot block, so a slow consumer never
/// stalls the inserting transaction.
///
/// Note: with the cache disabled this can put significant load on the
/// database, since every consumer may poll on every event.
#[derive(Default)]
pub struct InMemNotifier {
    listeners: Mutex<Vec<oneshot::Sender<()>>>,
}

impl EventsNotifier for InMemNotifier {
    fn notify(&self) {
        let mut listeners = self.listeners.lock().expect("notifier mutex poisoned");
        for tx in listeners.drain(..) {
            let _ = tx.send(());
        }
    }

    fn subscribe(&self) -> EventSignal {
        let (tx, rx) = oneshot::channel();
        self.listeners
            .lock()
            .expect("notifier mutex poisoned")
            .push(tx);
        EventSignal::from_receiver(rx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stub_signal_never_fires() {
        let notifier = StubNotifier;
        notifier.notify();

        let signal = notifier.subscribe();
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(fired.is_err(), "stub signal must never resolve");
    }

    #[tokio::test]
    async fn test_in_mem_notify_wakes_all_listeners() {
        let notifier = InMemNotifier::default();
        let a = notifier.subscribe();
        let b = notifier.subscribe();

        notifier.notify();

        tokio::time::timeout(Duration::from_secs(1), a.wait())
            .await
            .expect("listener a woken");
        tokio::time::timeout(Duration::from_secs(1), b.wait())
            .await
            .expect("listener b woken");
    }

    #[tokio::test]
    async fn test_in_mem_listeners_are_single_shot() {
        let notifier = InMemNotifier::default();
        let _first = notifier.subscribe();
        notifier.notify();

        // The list was cleared; a second notify with no new subscription
        // wakes nobody and must not panic.
        notifier.notify();

        let again = notifier.subscribe();
        notifier.notify();
        tokio::time::timeout(Duration::from_secs(1), again.wait())
            .await
            .expect("re-subscription woken");
    }

    #[test]
    fn test_notify_never_blocks_with_many_listeners() {
        let notifier = InMemNotifier::default();
        let signals: Vec<EventSignal> = (0..1000).map(|_| notifier.subscribe()).collect();

        // No executor is polling any of the receivers; notify must still
        // return immediately.
        notifier.notify();
        drop(signals);
    }
}
