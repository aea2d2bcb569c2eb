//! Pending consent requests, keyed by the `state` parameter.
//!
//! A state is handed out with every reauthorization URL and redeemed once
//! by the callback. It remembers the scopes the URL asked for and stops
//! being redeemable after a fixed lifetime.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// A consent request waiting for its callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl StateEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// Shared table of outstanding states. Clones see the same table.
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<Mutex<HashMap<String, StateEntry>>>,
    lifetime: Duration,
}

impl StateManager {
    /// States stay redeemable for `lifetime_secs` after they are issued.
    pub fn new(lifetime_secs: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            lifetime: Duration::seconds(lifetime_secs),
        }
    }

    /// Issues a random state bound to `scopes`.
    pub fn issue(&self, scopes: &[String]) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            scopes: scopes.to_vec(),
            expires_at: Utc::now() + self.lifetime,
        };
        self.table().insert(state.clone(), entry);
        state
    }

    /// Takes `state` out of the table. `None` for unknown, already redeemed
    /// or lapsed states.
    pub fn redeem(&self, state: &str) -> Option<StateEntry> {
        self.table()
            .remove(state)
            .filter(|entry| entry.is_live(Utc::now()))
    }

    /// Drops lapsed states that were never redeemed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, entry| entry.is_live(now));
        before - table.len()
    }

    pub fn pending(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Purges lapsed states every `interval_secs`. Runs until the task is dropped.
pub async fn run_state_purge(states: StateManager, interval_secs: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        let purged = states.purge_expired();
        if purged > 0 {
            debug!(purged, pending = states.pending(), "Purged lapsed consent states");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_issue_and_redeem() {
        let states = StateManager::new(600);

        let state = states.issue(&scopes(&["ads_read"]));
        let entry = states.redeem(&state).unwrap();

        assert_eq!(entry.scopes, scopes(&["ads_read"]));
        assert!(entry.expires_at > Utc::now());
    }

    #[test]
    fn test_redeem_once() {
        let states = StateManager::new(600);
        let state = states.issue(&[]);

        assert!(states.redeem(&state).is_some());
        assert!(states.redeem(&state).is_none());
    }

    #[test]
    fn test_unknown_state() {
        assert!(StateManager::new(600).redeem("forged").is_none());
    }

    #[test]
    fn test_lapsed_state_is_not_redeemable() {
        let states = StateManager::new(-1);
        let state = states.issue(&scopes(&["ads_read"]));

        assert!(states.redeem(&state).is_none());
        // Redeeming still removed it
        assert_eq!(states.pending(), 0);
    }

    #[test]
    fn test_purge_keeps_live_states() {
        let lapsed = StateManager::new(-1);
        lapsed.issue(&scopes(&["ads_read"]));
        lapsed.issue(&scopes(&["pages_show_list"]));
        assert_eq!(lapsed.purge_expired(), 2);
        assert_eq!(lapsed.pending(), 0);

        let live = StateManager::new(600);
        live.issue(&[]);
        assert_eq!(live.purge_expired(), 0);
        assert_eq!(live.pending(), 1);
    }

    #[test]
    fn test_clones_share_the_table() {
        let states = StateManager::new(600);
        let state = states.clone().issue(&[]);
        assert!(states.redeem(&state).is_some());
    }
}
