use tokio_util::sync::CancellationToken;

/// Holds the abort handle of the single request a panel may have in flight.
///
/// Each `begin` hands out a fresh token tagged with an epoch. A request only
/// clears the slot on exit if it is still the current one, so a late finish
/// from an aborted request can never drop the handle of its successor.
#[derive(Debug, Default)]
pub struct CancellationController {
    current: Option<(u64, CancellationToken)>,
    epoch: u64,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts whatever is live and allocates a new token.
    pub fn begin(&mut self) -> (u64, CancellationToken) {
        self.abort();
        self.epoch += 1;
        let token = CancellationToken::new();
        self.current = Some((self.epoch, token.clone()));
        tracing::debug!("Cancellation epoch {} started", self.epoch);
        (self.epoch, token)
    }

    /// Cancels the live token, if any. Returns whether one was live.
    pub fn abort(&mut self) -> bool {
        match self.current.take() {
            Some((epoch, token)) => {
                tracing::info!("Aborting in-flight request (epoch {})", epoch);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Releases the slot if `epoch` still owns it.
    pub fn finish(&mut self, epoch: u64) -> bool {
        if self.current.as_ref().is_some_and(|(e, _)| *e == epoch) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Swaps the token of a request that is moving on to another round.
    /// Returns `None` if `epoch` was aborted or superseded meanwhile.
    pub fn renew(&mut self, epoch: u64) -> Option<(u64, CancellationToken)> {
        if !self.finish(epoch) {
            return None;
        }
        Some(self.begin())
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.current.as_ref().map(|(e, _)| *e)
    }
}
