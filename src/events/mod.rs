// Lifecycle event broadcasting
use crate::models::{Account, AuthenticationResult, InteractionStatus, InteractionType};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    LoginStart,
    LoginSuccess,
    LoginFailure,
    LogoutStart,
    LogoutSuccess,
    LogoutFailure,
    AcquireTokenStart,
    AcquireTokenSuccess,
    AcquireTokenFailure,
    AccountAdded,
    AccountRemoved,
    InteractionStatusChanged,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::LoginStart => "LOGIN_START",
            EventType::LoginSuccess => "LOGIN_SUCCESS",
            EventType::LoginFailure => "LOGIN_FAILURE",
            EventType::LogoutStart => "LOGOUT_START",
            EventType::LogoutSuccess => "LOGOUT_SUCCESS",
            EventType::LogoutFailure => "LOGOUT_FAILURE",
            EventType::AcquireTokenStart => "ACQUIRE_TOKEN_START",
            EventType::AcquireTokenSuccess => "ACQUIRE_TOKEN_SUCCESS",
            EventType::AcquireTokenFailure => "ACQUIRE_TOKEN_FAILURE",
            EventType::AccountAdded => "ACCOUNT_ADDED",
            EventType::AccountRemoved => "ACCOUNT_REMOVED",
            EventType::InteractionStatusChanged => "INTERACTION_STATUS_CHANGED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    None,
    Account(Account),
    Result(Box<AuthenticationResult>),
    Error(String),
    Status(InteractionStatus),
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub event_type: EventType,
    pub interaction_type: Option<InteractionType>,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(event_type: EventType, interaction_type: Option<InteractionType>, payload: EventPayload) -> Self {
        Self {
            event_type,
            interaction_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn account(&self) -> Option<&Account> {
        match &self.payload {
            EventPayload::Account(account) => Some(account),
            EventPayload::Result(result) => Some(&result.account),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered, synchronous publish/subscribe channel
///
/// Subscribers are called in registration order for every event, in emission
/// order. Events are not buffered: a subscriber only sees events emitted
/// after it subscribed.
///
/// An event emitted from inside a callback is queued and delivered once the
/// event being delivered has reached every subscriber. `emit` from another
/// thread waits until the queue ahead of it has drained, so every event has
/// been delivered by the time `emit` returns to a caller outside a callback.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<AuthEvent>>,
    delivery: Mutex<()>,
    deliverer: Mutex<Option<ThreadId>>,
}

/// Marks the current thread as the one draining the queue until dropped
struct Draining<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> Draining<'a> {
    fn start(deliverer: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(deliverer) = Some(thread::current().id());
        Self(deliverer)
    }
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Subscriber)>> {
        lock(&self.subscribers)
    }

    fn next_queued(&self) -> Option<AuthEvent> {
        lock(&self.queue).pop_front()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber; returns false when it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Deliver an event to every current subscriber.
    /// No lock is held while a callback runs, so callbacks may (un)subscribe or emit.
    pub fn emit(&self, event: AuthEvent) {
        tracing::debug!("Event {}", event.event_type);
        lock(&self.queue).push_back(event);

        if *lock(&self.deliverer) == Some(thread::current().id()) {
            // emitted from a callback: the drain further up this stack delivers it
            return;
        }

        let _delivery = lock(&self.delivery);
        let _draining = Draining::start(&self.deliverer);
        while let Some(event) = self.next_queued() {
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &AuthEvent) {
        let snapshot: Vec<(SubscriptionId, Subscriber)> = self.subscribers().clone();

        for (id, callback) in snapshot {
            let still_subscribed = self.subscribers().iter().any(|(existing, _)| *existing == id);
            if still_subscribed {
                callback(event);
            }
        }
    }

    pub fn emit_simple(&self, event_type: EventType, interaction_type: Option<InteractionType>) {
        self.emit(AuthEvent::new(event_type, interaction_type, EventPayload::None));
    }

    pub fn emit_account(&self, event_type: EventType, account: Account) {
        self.emit(AuthEvent::new(event_type, None, EventPayload::Account(account)));
    }

    pub fn emit_result(
        &self,
        event_type: EventType,
        interaction_type: InteractionType,
        result: AuthenticationResult,
    ) {
        self.emit(AuthEvent::new(
            event_type,
            Some(interaction_type),
            EventPayload::Result(Box::new(result)),
        ));
    }

    pub fn emit_error(
        &self,
        event_type: EventType,
        interaction_type: InteractionType,
        error: &crate::error::AuthError,
    ) {
        self.emit(AuthEvent::new(
            event_type,
            Some(interaction_type),
            EventPayload::Error(error.to_string()),
        ));
    }
}
