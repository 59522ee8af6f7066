use crate::error::Result;
use crate::models::{ScopeSet, TokenCacheEntry};
use crate::storage::{self, Storage};
use std::sync::{Arc, Mutex, MutexGuard};

/// Access tokens keyed by account, authority and scope set.
/// Optionally mirrored into durable storage under a single key.
pub struct TokenCache {
    entries: Mutex<Vec<TokenCacheEntry>>,
    skew_seconds: i64,
    storage: Option<(Arc<dyn Storage>, String)>,
}

impl TokenCache {
    pub fn in_memory(skew_seconds: i64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            skew_seconds,
            storage: None,
        }
    }

    pub fn with_storage(skew_seconds: i64, storage: Arc<dyn Storage>, key: String) -> Result<Self> {
        let entries: Vec<TokenCacheEntry> =
            storage::read_json(storage.as_ref(), &key)?.unwrap_or_default();
        tracing::debug!("Loaded {} cached token(s)", entries.len());
        Ok(Self {
            entries: Mutex::new(entries),
            skew_seconds,
            storage: Some((storage, key)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TokenCacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &[TokenCacheEntry]) -> Result<()> {
        match &self.storage {
            Some((storage, key)) => storage::write_json(storage.as_ref(), key, &entries),
            None => Ok(()),
        }
    }

    /// Apply `change` to a copy of the entries and adopt it only once it is persisted
    fn commit<T>(&self, change: impl FnOnce(&mut Vec<TokenCacheEntry>) -> T) -> Result<T> {
        let mut entries = self.lock();
        let mut next = entries.clone();
        let outcome = change(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(outcome)
    }

    /// Save an entry, replacing any entry for the same account and authority
    /// whose scopes overlap it
    pub fn store(&self, entry: TokenCacheEntry) -> Result<()> {
        self.commit(|entries| {
            let before = entries.len();
            entries.retain(|existing| {
                !(existing.home_account_id == entry.home_account_id
                    && existing.authority == entry.authority
                    && (existing.scopes.intersects(&entry.scopes)
                        || existing.cache_key() == entry.cache_key()))
            });
            tracing::debug!(
                "Caching token for {} ({} scope(s), replaced {})",
                entry.home_account_id,
                entry.scopes.len(),
                before - entries.len()
            );
            entries.push(entry);
        })
    }

    /// A valid entry whose scopes cover `required`, or `None` for a miss
    pub fn lookup(
        &self,
        account_id: &str,
        authority: &str,
        required: &ScopeSet,
    ) -> Option<TokenCacheEntry> {
        let required = required.without_oidc_defaults();
        let entries = self.lock();
        let hit = entries
            .iter()
            .filter(|e| e.home_account_id == account_id && e.authority == authority)
            .filter(|e| e.scopes.contains_all(&required))
            .find(|e| !e.is_expired(self.skew_seconds))
            .cloned();

        match &hit {
            Some(_) => tracing::debug!("Token cache hit for {}", account_id),
            None => tracing::debug!("Token cache miss for {} [{}]", account_id, required.to_scope_string()),
        }
        hit
    }

    /// Any refresh token held for the account, expired access tokens included
    pub fn refresh_token_for(&self, account_id: &str, authority: &str) -> Option<String> {
        self.lock()
            .iter()
            .filter(|e| e.home_account_id == account_id && e.authority == authority)
            .find_map(|e| e.refresh_token.clone())
    }

    /// The most recent id token cached for the account
    pub fn id_token_for(&self, account_id: &str) -> Option<String> {
        self.lock()
            .iter()
            .rev()
            .filter(|e| e.home_account_id == account_id)
            .find_map(|e| e.id_token.clone())
    }

    /// Drop every entry of an account; returns how many were removed
    pub fn remove_account(&self, account_id: &str) -> Result<usize> {
        self.commit(|entries| {
            let before = entries.len();
            entries.retain(|e| e.home_account_id != account_id);
            before - entries.len()
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.commit(Vec::clear)
    }

    pub fn entries(&self) -> Vec<TokenCacheEntry> {
        self.lock().clone()
    }
}
