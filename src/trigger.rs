use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerState {
    Idle,
    PendingFetch,
    Exhausted,
    /// A fetch failed in a way retrying cannot fix, such as an expired token.
    Blocked,
}

/// Decides when the end of the rendered window is close enough to load more.
///
/// The rendering layer reports visible indices; a signal within `lookahead`
/// items of the end arms a single fetch. Signals that arrive while that fetch
/// is outstanding are dropped, and nothing fires once the source is exhausted.
#[derive(Debug, Clone)]
pub struct VisibilityTrigger {
    state: TriggerState,
    lookahead: usize,
}

impl VisibilityTrigger {
    pub fn new(lookahead: usize) -> Self {
        Self {
            state: TriggerState::Idle,
            lookahead,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn is_near_end(&self, index: usize, materialized: usize) -> bool {
        index < materialized && index + self.lookahead + 1 >= materialized
    }

    /// Returns true when the caller should issue a fetch now.
    pub fn on_visible(&mut self, index: usize, materialized: usize) -> bool {
        if self.state != TriggerState::Idle {
            return false;
        }
        if !self.is_near_end(index, materialized) {
            return false;
        }
        self.state = TriggerState::PendingFetch;
        true
    }

    /// Marks a fetch started outside of a visibility signal, such as the
    /// initial page or a manual retry.
    pub fn on_fetch_started(&mut self) -> bool {
        if self.state != TriggerState::Idle {
            return false;
        }
        self.state = TriggerState::PendingFetch;
        true
    }

    pub fn on_fetch_complete(&mut self, has_more: bool) {
        if self.state == TriggerState::Exhausted {
            return;
        }
        self.state = if has_more {
            TriggerState::Idle
        } else {
            TriggerState::Exhausted
        };
    }

    /// A transient failure re-arms the trigger so the next boundary signal
    /// retries. Anything else blocks it until [`Self::unblock`] or a reset.
    pub fn on_fetch_failed(&mut self, retryable: bool) {
        if self.state == TriggerState::PendingFetch {
            self.state = if retryable {
                TriggerState::Idle
            } else {
                TriggerState::Blocked
            };
        }
    }

    /// Explicit user retry after a blocking failure.
    pub fn unblock(&mut self) {
        if self.state == TriggerState::Blocked {
            self.state = TriggerState::Idle;
        }
    }

    pub fn reset(&mut self) {
        self.state = TriggerState::Idle;
    }
}

impl Default for VisibilityTrigger {
    fn default() -> Self {
        Self::new(0)
    }
}
