use tokio::sync::watch;

/// Cooperative shutdown latch shared by the coordinator and the listener.
///
/// A single cloneable handle: any clone may [`fire`](Shutdown::fire) it, and
/// [`fired`](Shutdown::fired) completes for every clone no matter whether it
/// started waiting before or after the latch tripped. Firing is idempotent.
#[derive(Debug, Clone)]
pub struct Shutdown {
    latch: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (latch, _) = watch::channel(false);
        Shutdown { latch }
    }

    /// Trips the latch, waking every pending and future [`fired`](Shutdown::fired) call.
    ///
    /// `send_replace` updates the latch even when no subscriber exists at
    /// that instant, so a fire between two waits is never lost.
    pub fn fire(&self) {
        self.latch.send_replace(true);
    }

    /// Completes once the latch has been tripped.
    pub async fn fired(&self) {
        let mut rx = self.latch.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    pub fn is_fired(&self) -> bool {
        *self.latch.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}
