//! Postgres-backed match store.
//!
//! `update` is `UPDATE ... WHERE match_id = $1 AND version = $2`; zero rows
//! affected means another writer got there first (`Concurrency`). The
//! resolution is kept as JSONB so a replayed terminal call can be recognised.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use wager_core::{ExpectedVersion, MatchId, TicketId, UserId};
use wager_matchmaking::{Match, MatchStatus, Resolution};

use super::r#trait::{MatchStore, MatchStoreError};
use crate::blocking::RuntimeBridge;

const MATCH_COLUMNS: &str = "match_id, game_id, mode, region, player_a, player_b, ticket_a, \
     ticket_b, ticket_a_round, ticket_b_round, stake_minor, status, resolution, failure_reason, \
     version, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresMatchStore {
    pool: Arc<PgPool>,
    bridge: RuntimeBridge,
}

impl PostgresMatchStore {
    pub fn new(pool: PgPool) -> Result<Self, MatchStoreError> {
        let bridge = RuntimeBridge::current().map_err(MatchStoreError::Unavailable)?;
        Ok(Self {
            pool: Arc::new(pool),
            bridge,
        })
    }

    #[instrument(skip(self, record), fields(match_id = %record.match_id), err)]
    pub async fn insert_async(&self, record: &Match) -> Result<bool, MatchStoreError> {
        let resolution = encode_resolution(record.resolution.as_ref())?;
        let result = sqlx::query(
            r#"
            INSERT INTO matches (
                match_id, game_id, mode, region, player_a, player_b, ticket_a, ticket_b,
                ticket_a_round, ticket_b_round, stake_minor, status, resolution,
                failure_reason, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (match_id) DO NOTHING
            "#,
        )
        .bind(record.match_id.as_uuid())
        .bind(&record.game_id)
        .bind(record.mode.as_str())
        .bind(&record.region)
        .bind(record.players[0].as_uuid())
        .bind(record.players[1].as_uuid())
        .bind(record.tickets[0].as_uuid())
        .bind(record.tickets[1].as_uuid())
        .bind(to_db_round(record.rounds[0])?)
        .bind(to_db_round(record.rounds[1])?)
        .bind(record.stake_minor)
        .bind(record.status.as_str())
        .bind(resolution)
        .bind(&record.failure_reason)
        .bind(to_db_version(record.version)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_match", e))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_async(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError> {
        let row = sqlx::query(&format!("SELECT {MATCH_COLUMNS} FROM matches WHERE match_id = $1"))
            .bind(match_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_match", e))?;

        row.map(|r| {
            MatchRow::from_row(&r)
                .map_err(|e| MatchStoreError::Invalid(e.to_string()))
                .and_then(MatchRow::into_match)
        })
        .transpose()
    }

    #[instrument(
        skip(self, record),
        fields(match_id = %record.match_id, status = record.status.as_str()),
        err
    )]
    pub async fn update_async(
        &self,
        record: &Match,
        expected: ExpectedVersion,
    ) -> Result<Match, MatchStoreError> {
        let expected_version = match expected {
            ExpectedVersion::Exact(v) => Some(to_db_version(v)?),
            ExpectedVersion::Any => None,
        };
        let resolution = encode_resolution(record.resolution.as_ref())?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE matches
            SET status = $3,
                resolution = $4,
                failure_reason = $5,
                updated_at = $6,
                version = version + 1
            WHERE match_id = $1 AND ($2::BIGINT IS NULL OR version = $2)
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(record.match_id.as_uuid())
        .bind(expected_version)
        .bind(record.status.as_str())
        .bind(resolution)
        .bind(&record.failure_reason)
        .bind(record.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_match", e))?;

        match row {
            Some(row) => MatchRow::from_row(&row)
                .map_err(|e| MatchStoreError::Invalid(e.to_string()))?
                .into_match(),
            None => match self.get_async(record.match_id).await? {
                Some(current) => Err(MatchStoreError::Concurrency(format!(
                    "match {}: expected {expected:?}, found version {}",
                    record.match_id, current.version
                ))),
                None => Err(MatchStoreError::NotFound(format!("match {}", record.match_id))),
            },
        }
    }

    pub async fn list_by_status_async(
        &self,
        status: MatchStatus,
        limit: usize,
    ) -> Result<Vec<Match>, MatchStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE status = $1 ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_matches", e))?;

        rows.iter()
            .map(|r| {
                MatchRow::from_row(r)
                    .map_err(|e| MatchStoreError::Invalid(e.to_string()))
                    .and_then(MatchRow::into_match)
            })
            .collect()
    }
}

impl MatchStore for PostgresMatchStore {
    fn insert(&self, record: &Match) -> Result<bool, MatchStoreError> {
        self.bridge.block_on(self.insert_async(record))
    }

    fn get(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError> {
        self.bridge.block_on(self.get_async(match_id))
    }

    fn update(&self, record: &Match, expected: ExpectedVersion) -> Result<Match, MatchStoreError> {
        self.bridge.block_on(self.update_async(record, expected))
    }

    fn list_by_status(&self, status: MatchStatus, limit: usize) -> Result<Vec<Match>, MatchStoreError> {
        self.bridge.block_on(self.list_by_status_async(status, limit))
    }
}

// SQLx row type

#[derive(Debug)]
struct MatchRow {
    match_id: uuid::Uuid,
    game_id: String,
    mode: String,
    region: String,
    player_a: uuid::Uuid,
    player_b: uuid::Uuid,
    ticket_a: uuid::Uuid,
    ticket_b: uuid::Uuid,
    ticket_a_round: i32,
    ticket_b_round: i32,
    stake_minor: i64,
    status: String,
    resolution: Option<serde_json::Value>,
    failure_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MatchRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MatchRow {
            match_id: row.try_get("match_id")?,
            game_id: row.try_get("game_id")?,
            mode: row.try_get("mode")?,
            region: row.try_get("region")?,
            player_a: row.try_get("player_a")?,
            player_b: row.try_get("player_b")?,
            ticket_a: row.try_get("ticket_a")?,
            ticket_b: row.try_get("ticket_b")?,
            ticket_a_round: row.try_get("ticket_a_round")?,
            ticket_b_round: row.try_get("ticket_b_round")?,
            stake_minor: row.try_get("stake_minor")?,
            status: row.try_get("status")?,
            resolution: row.try_get("resolution")?,
            failure_reason: row.try_get("failure_reason")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl MatchRow {
    fn into_match(self) -> Result<Match, MatchStoreError> {
        let invalid = |e: wager_core::DomainError| MatchStoreError::Invalid(e.to_string());
        let resolution = self
            .resolution
            .map(serde_json::from_value::<Resolution>)
            .transpose()
            .map_err(|e| MatchStoreError::Invalid(format!("bad resolution: {e}")))?;

        Ok(Match {
            match_id: MatchId::from_uuid(self.match_id),
            game_id: self.game_id,
            mode: self.mode.parse().map_err(invalid)?,
            region: self.region,
            players: [UserId::from_uuid(self.player_a), UserId::from_uuid(self.player_b)],
            tickets: [TicketId::from_uuid(self.ticket_a), TicketId::from_uuid(self.ticket_b)],
            rounds: [from_db_round(self.ticket_a_round)?, from_db_round(self.ticket_b_round)?],
            stake_minor: self.stake_minor,
            status: self.status.parse().map_err(invalid)?,
            resolution,
            failure_reason: self.failure_reason,
            version: u64::try_from(self.version)
                .map_err(|_| MatchStoreError::Invalid(format!("negative version {}", self.version)))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode_resolution(resolution: Option<&Resolution>) -> Result<Option<serde_json::Value>, MatchStoreError> {
    resolution
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| MatchStoreError::Invalid(format!("failed to encode resolution: {e}")))
}

fn to_db_version(version: u64) -> Result<i64, MatchStoreError> {
    i64::try_from(version).map_err(|_| MatchStoreError::Invalid(format!("version {version} too large")))
}

fn to_db_round(round: u32) -> Result<i32, MatchStoreError> {
    i32::try_from(round).map_err(|_| MatchStoreError::Invalid(format!("round {round} too large")))
}

fn from_db_round(round: i32) -> Result<u32, MatchStoreError> {
    u32::try_from(round).map_err(|_| MatchStoreError::Invalid(format!("negative round {round}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MatchStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => MatchStoreError::Concurrency(msg),
                Some("23514") => MatchStoreError::Invalid(msg),
                _ => MatchStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            MatchStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => MatchStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
