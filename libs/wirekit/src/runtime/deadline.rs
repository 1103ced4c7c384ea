//! External deadline / cancellation signal for start, stop and health.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A cancellation token plus an optional absolute deadline.
///
/// Whichever fires first ends the operation at its next safe point.
#[derive(Clone, Debug)]
pub struct Deadline {
    token: CancellationToken,
    at: Option<Instant>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl Deadline {
    /// Never expires unless the (private) token is cancelled.
    pub fn none() -> Self {
        Self {
            token: CancellationToken::new(),
            at: None,
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(at: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            at: Some(at),
        }
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, at: None }
    }

    /// Add (or tighten) an absolute bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.at = Some(self.at.map_or(at, |cur| cur.min(at)));
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the absolute bound, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn expired(&self) {
        match self.at {
            Some(at) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
