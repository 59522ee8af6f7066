// Interaction status for one browsing session
use crate::error::{AuthError, Result};
use crate::events::{AuthEvent, EventBroadcaster, EventPayload, EventType};
use crate::models::InteractionStatus;
use std::sync::{Arc, Mutex, MutexGuard};

/// Owns the single in-flight interaction slot
pub struct SessionState {
    status: Mutex<InteractionStatus>,
    events: Arc<EventBroadcaster>,
}

impl SessionState {
    pub fn new(events: Arc<EventBroadcaster>) -> Self {
        Self {
            status: Mutex::new(InteractionStatus::None),
            events,
        }
    }

    fn slot(&self) -> MutexGuard<'_, InteractionStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> InteractionStatus {
        *self.slot()
    }

    /// Claim the slot for `next`; fails fast if anything else is in flight
    pub fn begin(self: &Arc<Self>, next: InteractionStatus) -> Result<InteractionGuard> {
        self.transition(|current| current.is_none(), next)?;
        Ok(InteractionGuard::new(Arc::clone(self)))
    }

    /// Move a redirect login (or an idle session after reload) to HandleRedirect
    pub fn begin_redirect_return(self: &Arc<Self>) -> Result<InteractionGuard> {
        self.transition(
            |current| matches!(current, InteractionStatus::None | InteractionStatus::Login),
            InteractionStatus::HandleRedirect,
        )?;
        Ok(InteractionGuard::new(Arc::clone(self)))
    }

    fn transition(
        &self,
        allowed: impl Fn(InteractionStatus) -> bool,
        next: InteractionStatus,
    ) -> Result<()> {
        {
            let mut slot = self.slot();
            if !allowed(*slot) {
                tracing::warn!("Rejected {} while {} is in progress", next, *slot);
                return Err(AuthError::ConcurrentInteraction { in_progress: *slot });
            }
            *slot = next;
        }
        self.announce(next);
        Ok(())
    }

    /// Return the slot to None
    pub fn finish(&self) {
        let changed = {
            let mut slot = self.slot();
            let changed = !slot.is_none();
            *slot = InteractionStatus::None;
            changed
        };
        if changed {
            self.announce(InteractionStatus::None);
        }
    }

    fn announce(&self, status: InteractionStatus) {
        tracing::debug!("Interaction status -> {}", status);
        self.events.emit(AuthEvent::new(
            EventType::InteractionStatusChanged,
            None,
            EventPayload::Status(status),
        ));
    }
}

/// Resets the interaction status when dropped, so every exit path clears it
pub struct InteractionGuard {
    session: Arc<SessionState>,
    armed: bool,
}

impl InteractionGuard {
    fn new(session: Arc<SessionState>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    /// Leave the status set after the guard goes away (a redirect is navigating)
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for InteractionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.session.finish();
        }
    }
}
