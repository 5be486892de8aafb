use tokio::sync::watch;

/// Sending half of the cancellation signal. Triggering is idempotent.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every loop that must stop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown { rx })
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_all_subscribers() {
        let (trigger, mut first) = ShutdownTrigger::new();
        let mut second = trigger.subscribe();
        assert!(!first.is_triggered());

        trigger.trigger();
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), first.triggered()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.triggered()).await.unwrap();
        assert!(second.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = ShutdownTrigger::new();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered()).await.unwrap();
    }
}
