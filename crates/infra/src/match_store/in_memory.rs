use std::collections::HashMap;
use std::sync::RwLock;

use wager_core::{ExpectedVersion, MatchId};
use wager_matchmaking::{Match, MatchStatus};

use super::r#trait::{MatchStore, MatchStoreError};

#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    matches: RwLock<HashMap<MatchId, Match>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> MatchStoreError {
    MatchStoreError::Unavailable("lock poisoned".to_string())
}

impl MatchStore for InMemoryMatchStore {
    fn insert(&self, record: &Match) -> Result<bool, MatchStoreError> {
        let mut matches = self.matches.write().map_err(poisoned)?;
        if matches.contains_key(&record.match_id) {
            return Ok(false);
        }
        matches.insert(record.match_id, record.clone());
        Ok(true)
    }

    fn get(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError> {
        Ok(self.matches.read().map_err(poisoned)?.get(&match_id).cloned())
    }

    fn update(&self, record: &Match, expected: ExpectedVersion) -> Result<Match, MatchStoreError> {
        let mut matches = self.matches.write().map_err(poisoned)?;
        let current = matches
            .get(&record.match_id)
            .ok_or_else(|| MatchStoreError::NotFound(format!("match {}", record.match_id)))?;
        if !expected.matches(current.version) {
            return Err(MatchStoreError::Concurrency(format!(
                "match {}: expected {expected:?}, found version {}",
                record.match_id, current.version
            )));
        }

        let mut next = record.clone();
        next.version = current.version + 1;
        matches.insert(next.match_id, next.clone());
        Ok(next)
    }

    fn list_by_status(&self, status: MatchStatus, limit: usize) -> Result<Vec<Match>, MatchStoreError> {
        let matches = self.matches.read().map_err(poisoned)?;
        let mut found: Vec<Match> = matches
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.updated_at);
        found.truncate(limit);
        Ok(found)
    }
}
