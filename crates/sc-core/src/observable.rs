//! Watched values
//!
//! Thin wrapper over `tokio::sync::watch` holding the latest value of a
//! device property (state, power, message...). `set_if_changed` is the dirty
//! check used by the resync loop: subscribers and events only fire when the
//! value actually changes.

use std::fmt::Debug;
use tokio::sync::watch;

/// Latest value of a named property with change notification.
#[derive(Debug)]
pub struct Observable<T> {
    name: String,
    tx: watch::Sender<T>,
}

impl<T> Observable<T>
where
    T: Clone + PartialEq + Debug + Send + Sync + 'static,
{
    /// Observable holding `initial`.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Store `value`. Returns the previous value if it differed.
    pub fn set_if_changed(&self, value: T) -> Option<T> {
        let mut previous = None;
        self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            previous = Some(std::mem::replace(current, value));
            true
        });
        if let Some(prev) = &previous {
            tracing::trace!(name = %self.name, ?prev, "observable changed");
        }
        previous
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_changed() {
        let obs = Observable::new("powered", false);
        assert_eq!(obs.set_if_changed(true), Some(false));
        assert_eq!(obs.set_if_changed(true), None);
        assert!(obs.get());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_only() {
        let obs = Observable::new("message", String::new());
        let mut rx = obs.subscribe();

        obs.set_if_changed(String::new());
        assert!(!rx.has_changed().unwrap());

        obs.set_if_changed("dewar filling".to_string());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), "dewar filling");
    }
}
