// Known accounts and active account selection
use crate::auth::IdTokenClaims;
use crate::error::{AuthError, Result};
use crate::events::{EventBroadcaster, EventType};
use crate::models::{Account, TokenResponse};
use crate::storage::{self, Storage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountState {
    accounts: Vec<Account>,
    active: Option<String>,
    /// The active account was removed; settle points leave selection to the caller
    #[serde(default)]
    selection_cleared: bool,
}

impl AccountState {
    fn position(&self, account_id: &str) -> Option<usize> {
        self.accounts
            .iter()
            .position(|a| a.home_account_id == account_id)
    }
}

struct Persistence {
    storage: Arc<dyn Storage>,
    key: String,
}

/// Tracks every signed-in account and at most one active account
pub struct AccountStateManager {
    state: Mutex<AccountState>,
    events: Arc<EventBroadcaster>,
    persistence: Option<Persistence>,
}

impl AccountStateManager {
    pub fn new(events: Arc<EventBroadcaster>) -> Self {
        Self {
            state: Mutex::new(AccountState::default()),
            events,
            persistence: None,
        }
    }

    /// Load previously persisted accounts and keep writing changes back under `key`
    pub fn with_storage(
        events: Arc<EventBroadcaster>,
        storage: Arc<dyn Storage>,
        key: String,
    ) -> Result<Self> {
        let state: AccountState = storage::read_json(storage.as_ref(), &key)?.unwrap_or_default();
        tracing::debug!("Loaded {} account(s) from storage", state.accounts.len());
        Ok(Self {
            state: Mutex::new(state),
            events,
            persistence: Some(Persistence { storage, key }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &AccountState) -> Result<()> {
        match &self.persistence {
            Some(p) => storage::write_json(p.storage.as_ref(), &p.key, state),
            None => Ok(()),
        }
    }

    /// Apply `change` to a copy of the state and adopt it only once it is persisted
    fn commit<T>(&self, change: impl FnOnce(&mut AccountState) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let mut next = state.clone();
        let outcome = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(outcome)
    }

    /// Insert or refresh the account named by a token response's id token.
    /// Returns the account and whether it was previously unknown.
    pub fn upsert_account(&self, response: &TokenResponse, environment: &str) -> Result<(Account, bool)> {
        let id_token = response.id_token.as_deref().ok_or_else(|| {
            AuthError::InvalidIdToken("token response carries no id_token".to_string())
        })?;
        let claims = IdTokenClaims::decode(id_token)?;
        self.upsert_from_claims(&claims, environment)
    }

    pub fn upsert_from_claims(&self, claims: &IdTokenClaims, environment: &str) -> Result<(Account, bool)> {
        let account = Account {
            home_account_id: claims.home_account_id(),
            environment: environment.to_string(),
            tenant_id: claims.tid.clone(),
            username: claims.username(),
            name: claims.name.clone(),
            id_token_claims: claims.all.clone(),
        };

        let is_new = self.commit(|state| {
            Ok(match state.position(&account.home_account_id) {
                Some(index) => {
                    state.accounts[index] = account.clone();
                    false
                }
                None => {
                    state.accounts.push(account.clone());
                    state.selection_cleared = false;
                    true
                }
            })
        })?;

        if is_new {
            tracing::info!("Account added: {}", account.username);
            self.events.emit_account(EventType::AccountAdded, account.clone());
        } else {
            tracing::debug!("Account updated: {}", account.username);
        }
        Ok((account, is_new))
    }

    /// Forget an account. Never promotes another account in its place, and
    /// removing the active one keeps later settle points from promoting either.
    pub fn remove_account(&self, account_id: &str) -> Result<Account> {
        let removed = self.commit(|state| {
            let index = state
                .position(account_id)
                .ok_or_else(|| AuthError::UnknownAccount(account_id.to_string()))?;
            if state.active.as_deref() == Some(account_id) {
                state.active = None;
                state.selection_cleared = true;
            }
            Ok(state.accounts.remove(index))
        })?;

        tracing::info!("Account removed: {}", removed.username);
        self.events.emit_account(EventType::AccountRemoved, removed.clone());
        Ok(removed)
    }

    pub fn set_active_account(&self, account_id: &str) -> Result<Account> {
        self.commit(|state| {
            let index = state
                .position(account_id)
                .ok_or_else(|| AuthError::UnknownAccount(account_id.to_string()))?;
            state.active = Some(account_id.to_string());
            state.selection_cleared = false;
            Ok(state.accounts[index].clone())
        })
    }

    pub fn clear_active_account(&self) -> Result<()> {
        self.commit(|state| {
            state.active = None;
            Ok(())
        })
    }

    pub fn active_account(&self) -> Option<Account> {
        let state = self.lock();
        let active = state.active.as_deref()?;
        state.position(active).map(|i| state.accounts[i].clone())
    }

    pub fn account(&self, account_id: &str) -> Option<Account> {
        let state = self.lock();
        state.position(account_id).map(|i| state.accounts[i].clone())
    }

    pub fn all_accounts(&self) -> Vec<Account> {
        self.lock().accounts.clone()
    }

    /// Promote the only account when exactly one exists, none is active and
    /// the active one was not just removed. Returns the promoted account, if any.
    pub fn settle(&self) -> Option<Account> {
        let promoted = self.commit(|state| {
            if state.active.is_some() || state.selection_cleared || state.accounts.len() != 1 {
                return Ok(None);
            }
            let only = state.accounts[0].clone();
            state.active = Some(only.home_account_id.clone());
            Ok(Some(only))
        });

        match promoted {
            Ok(Some(only)) => {
                tracing::debug!("Promoted only account to active: {}", only.username);
                Some(only)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to persist promoted active account: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::id_token::encode_unsigned;
    use crate::events::test_support::record;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn response_for(sub: &str, username: &str) -> TokenResponse {
        TokenResponse {
            access_token: format!("at-{}", sub),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: None,
            id_token: Some(encode_unsigned(&json!({
                "sub": sub,
                "preferred_username": username,
                "tid": "tenant-1"
            }))),
            scope: None,
        }
    }

    fn manager() -> (AccountStateManager, Arc<EventBroadcaster>) {
        let events = Arc::new(EventBroadcaster::new());
        (AccountStateManager::new(Arc::clone(&events)), events)
    }

    #[test]
    fn test_first_account_added_then_promoted_on_settle() {
        let (accounts, events) = manager();
        let seen = record(&events);

        let (account, is_new) = accounts
            .upsert_account(&response_for("s1", "ada@example.com"), "login.example.com")
            .unwrap();
        assert!(is_new);
        assert_eq!(*seen.lock().unwrap(), vec![EventType::AccountAdded]);
        // not active until the next settle point
        assert!(accounts.active_account().is_none());

        let promoted = accounts.settle().unwrap();
        assert_eq!(promoted.home_account_id, account.home_account_id);
        assert_eq!(accounts.active_account().unwrap().username, "ada@example.com");
        assert_eq!(account.tenant_id.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn test_upsert_existing_account_is_not_new() {
        let (accounts, events) = manager();
        accounts
            .upsert_account(&response_for("s1", "old@example.com"), "env")
            .unwrap();
        let seen = record(&events);
        let (account, is_new) = accounts
            .upsert_account(&response_for("s1", "new@example.com"), "env")
            .unwrap();
        assert!(!is_new);
        assert_eq!(account.username, "new@example.com");
        assert_eq!(accounts.all_accounts().len(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_requires_id_token() {
        let (accounts, _) = manager();
        let mut response = response_for("s1", "a");
        response.id_token = None;
        assert!(matches!(
            accounts.upsert_account(&response, "env"),
            Err(AuthError::InvalidIdToken(_))
        ));
    }

    #[test]
    fn test_remove_active_account_does_not_promote_remaining() {
        let (accounts, events) = manager();
        for (sub, name) in [("s1", "a"), ("s2", "b"), ("s3", "c")] {
            accounts.upsert_account(&response_for(sub, name), "env").unwrap();
        }
        accounts.set_active_account("s1").unwrap();
        let seen = record(&events);

        let removed = accounts.remove_account("s1").unwrap();
        assert_eq!(removed.username, "a");
        assert!(accounts.active_account().is_none());
        assert_eq!(*seen.lock().unwrap(), vec![EventType::AccountRemoved]);

        // two accounts remain: nothing is promoted
        assert!(accounts.settle().is_none());
        assert!(accounts.active_account().is_none());
    }

    #[test]
    fn test_removing_active_account_does_not_promote_last_remaining() {
        let (accounts, _) = manager();
        accounts.upsert_account(&response_for("s1", "a"), "env").unwrap();
        accounts.upsert_account(&response_for("s2", "b"), "env").unwrap();
        accounts.set_active_account("s2").unwrap();

        accounts.remove_account("s2").unwrap();
        assert!(accounts.active_account().is_none());
        assert!(accounts.settle().is_none());
        assert!(accounts.active_account().is_none());

        accounts.set_active_account("s1").unwrap();
        assert_eq!(accounts.active_account().unwrap().home_account_id, "s1");
    }

    #[test]
    fn test_removing_inactive_account_leaves_settle_enabled() {
        let (accounts, _) = manager();
        accounts.upsert_account(&response_for("s1", "a"), "env").unwrap();
        accounts.upsert_account(&response_for("s2", "b"), "env").unwrap();

        accounts.remove_account("s2").unwrap();
        assert_eq!(accounts.settle().unwrap().home_account_id, "s1");
    }

    #[test]
    fn test_new_account_after_removal_is_promoted_again() {
        let (accounts, _) = manager();
        accounts.upsert_account(&response_for("s1", "a"), "env").unwrap();
        accounts.set_active_account("s1").unwrap();
        accounts.remove_account("s1").unwrap();

        accounts.upsert_account(&response_for("s2", "b"), "env").unwrap();
        assert_eq!(accounts.settle().unwrap().home_account_id, "s2");
    }

    #[test]
    fn test_unknown_account_errors() {
        let (accounts, _) = manager();
        assert!(matches!(
            accounts.set_active_account("nobody"),
            Err(AuthError::UnknownAccount(_))
        ));
        assert!(matches!(
            accounts.remove_account("nobody"),
            Err(AuthError::UnknownAccount(_))
        ));
    }

    fn failing_storage() -> Arc<dyn Storage> {
        let mut storage = crate::storage::MockStorage::new();
        storage.expect_get().returning(|_| Ok(None));
        storage
            .expect_set()
            .returning(|_, _| Err(AuthError::Storage("disk full".to_string())));
        Arc::new(storage)
    }

    #[test]
    fn test_failed_persist_leaves_state_untouched() {
        let events = Arc::new(EventBroadcaster::new());
        let accounts = AccountStateManager::with_storage(
            Arc::clone(&events),
            failing_storage(),
            "accounts".to_string(),
        )
        .unwrap();
        let seen = record(&events);

        for _ in 0..2 {
            assert!(matches!(
                accounts.upsert_account(&response_for("s1", "a"), "env"),
                Err(AuthError::Storage(_))
            ));
        }
        assert!(accounts.all_accounts().is_empty());
        assert!(seen.lock().unwrap().is_empty());
        assert!(accounts.settle().is_none());
        assert!(accounts.active_account().is_none());
    }

    #[test]
    fn test_failed_persist_keeps_account_and_selection() {
        let storage = Arc::new(MemoryStorage::new());
        let mut flaky = crate::storage::MockStorage::new();
        let backing = Arc::clone(&storage);
        flaky.expect_get().returning(move |key| backing.get(key));
        let backing = Arc::clone(&storage);
        let writes = std::sync::atomic::AtomicUsize::new(0);
        flaky.expect_set().returning(move |key, value| {
            // the first three writes succeed, everything after fails
            if writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 3 {
                backing.set(key, value)
            } else {
                Err(AuthError::Storage("disk full".to_string()))
            }
        });

        let events = Arc::new(EventBroadcaster::new());
        let accounts = AccountStateManager::with_storage(
            Arc::clone(&events),
            Arc::new(flaky),
            "accounts".to_string(),
        )
        .unwrap();
        accounts.upsert_account(&response_for("s1", "a"), "env").unwrap();
        accounts.upsert_account(&response_for("s2", "b"), "env").unwrap();
        accounts.set_active_account("s1").unwrap();
        let seen = record(&events);

        assert!(accounts.remove_account("s1").is_err());
        assert!(accounts.set_active_account("s2").is_err());
        assert_eq!(accounts.all_accounts().len(), 2);
        assert_eq!(accounts.active_account().unwrap().home_account_id, "s1");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_reload_from_storage() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventBroadcaster::new());
        {
            let accounts = AccountStateManager::with_storage(
                Arc::clone(&events),
                Arc::clone(&storage),
                "accounts".to_string(),
            )
            .unwrap();
            accounts.upsert_account(&response_for("s1", "a"), "env").unwrap();
            accounts.upsert_account(&response_for("s2", "b"), "env").unwrap();
            accounts.set_active_account("s2").unwrap();
        }

        let reloaded =
            AccountStateManager::with_storage(events, storage, "accounts".to_string()).unwrap();
        assert_eq!(reloaded.all_accounts().len(), 2);
        assert_eq!(reloaded.active_account().unwrap().home_account_id, "s2");
        assert_eq!(reloaded.account("s1").unwrap().username, "a");
    }
}
