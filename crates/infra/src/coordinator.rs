//! Match coordinator: the only component that writes across the queue and the
//! ledger.
//!
//! ```text
//! FORMED -> ESCROWED -> LIVE -> RESOLVING -> PAID | REFUNDED | FAILED
//!    \          \________________^
//!     -> FAILED (escrow failed, compensated)
//! ```
//!
//! Every ledger call carries a key derived from the match id, so re-running
//! any step after a crash converges on the same ledger state. No match lock is
//! held while the ledger is called. A match left FORMED by a failed step is
//! escrowed again by a later matching cycle.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use wager_core::{DomainError, ExpectedVersion, MatchId, MinorUnits, UserId};
use wager_events::{
    EventBus, EventEnvelope, LifecycleEvent, MatchEscrowed, MatchFailed, MatchFormed,
    MatchLifecycleEvent, MatchLive, MatchPaid, MatchRefunded, ServerLifecycleEvent, TopicConfig,
};
use wager_matchmaking::{LaneKey, Match, MatchStatus, Resolution, ResolutionKind, ResolutionStart};

use crate::ledger_engine::{LedgerEngine, LedgerError};
use crate::match_store::{MatchStore, MatchStoreError};
use crate::matchmaker::{MatchmakingQueue, QueueError};

/// Attempts at a match status write before giving up on a hot record.
const SAVE_ATTEMPTS: u32 = 3;

/// Stalled FORMED matches resumed per matching cycle.
const RESUME_BATCH: usize = 64;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("coordinator unavailable: {0}")]
    Fatal(String),
}

impl From<LedgerError> for CoordinatorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Domain(e) => CoordinatorError::Domain(e),
            LedgerError::Fatal(msg) => CoordinatorError::Fatal(msg),
        }
    }
}

impl From<QueueError> for CoordinatorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Domain(e) => CoordinatorError::Domain(e),
            QueueError::Fatal(msg) => CoordinatorError::Fatal(msg),
        }
    }
}

impl From<MatchStoreError> for CoordinatorError {
    fn from(err: MatchStoreError) -> Self {
        match err {
            MatchStoreError::Concurrency(msg) => CoordinatorError::Domain(DomainError::conflict(msg)),
            MatchStoreError::NotFound(msg) => CoordinatorError::Domain(DomainError::not_found(msg)),
            MatchStoreError::Invalid(msg) | MatchStoreError::Unavailable(msg) => {
                CoordinatorError::Fatal(msg)
            }
        }
    }
}

/// Why a FORMED match could not be escrowed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EscrowFailure {
    /// The player cannot cover the stake. The only failure that blames.
    Insufficient(UserId, String),
    /// Storage outage, contention or any other error not caused by the player.
    Transient(UserId, String),
    /// The ledger holds less than the stake after the lock calls.
    Shortfall {
        player: UserId,
        held: MinorUnits,
        stake: MinorUnits,
    },
    /// A ticket left the match before escrow could finish.
    Released,
}

impl EscrowFailure {
    fn blamed(&self) -> Option<UserId> {
        match self {
            EscrowFailure::Insufficient(player, _) => Some(*player),
            _ => None,
        }
    }
}

impl std::fmt::Display for EscrowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscrowFailure::Insufficient(player, msg) | EscrowFailure::Transient(player, msg) => {
                write!(f, "escrow failed for {player}: {msg}")
            }
            EscrowFailure::Shortfall {
                player,
                held,
                stake,
            } => write!(f, "escrow for {player} holds {held} of {stake}"),
            EscrowFailure::Released => f.write_str("tickets were released before escrow finished"),
        }
    }
}

pub struct MatchCoordinator<B> {
    ledger: Arc<LedgerEngine>,
    queue: Arc<MatchmakingQueue>,
    matches: Arc<dyn MatchStore>,
    bus: B,
    topics: TopicConfig,
}

impl<B> MatchCoordinator<B>
where
    B: EventBus<EventEnvelope<LifecycleEvent>>,
{
    pub fn new(
        ledger: Arc<LedgerEngine>,
        queue: Arc<MatchmakingQueue>,
        matches: Arc<dyn MatchStore>,
        bus: B,
        topics: TopicConfig,
    ) -> Self {
        Self {
            ledger,
            queue,
            matches,
            bus,
            topics,
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<MatchmakingQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    pub fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, CoordinatorError> {
        Ok(self.matches.get(match_id)?)
    }

    /// Resume stalled escrows, run the matcher over every lane, then escrow
    /// each newly formed match.
    pub fn run_matching_cycle(&self) -> Result<Vec<Match>, CoordinatorError> {
        if let Err(err) = self.resume_stalled_escrows() {
            error!(error = %err, "failed to list stalled escrows");
        }
        let formed = self.queue.run_once()?;
        Ok(self.escrow_all(formed))
    }

    /// Escrow again every match that has stayed FORMED for longer than the
    /// queue's re-drive age.
    pub fn resume_stalled_escrows(&self) -> Result<Vec<Match>, CoordinatorError> {
        let Ok(age) = chrono::Duration::from_std(self.queue.config().escrow_redrive_after) else {
            return Ok(Vec::new());
        };
        let cutoff = Utc::now() - age;
        let stalled = self.matches.list_by_status(MatchStatus::Formed, RESUME_BATCH)?;

        let mut resumed = Vec::new();
        for m in stalled.into_iter().filter(|m| m.updated_at <= cutoff) {
            warn!(match_id = %m.match_id, formed_at = %m.created_at, "resuming stalled escrow");
            match self.escrow(m.match_id) {
                Ok(done) => resumed.push(done),
                Err(err) => error!(match_id = %m.match_id, error = %err, "stalled escrow still failing"),
            }
        }
        Ok(resumed)
    }

    /// Matching cycle restricted to one lane (used right after a seek).
    pub fn run_lane_cycle(&self, lane: &LaneKey) -> Result<Vec<Match>, CoordinatorError> {
        let mut formed = Vec::new();
        while let Some(m) = self.queue.match_lane(lane)? {
            formed.push(m);
        }
        Ok(self.escrow_all(formed))
    }

    fn escrow_all(&self, formed: Vec<Match>) -> Vec<Match> {
        let mut out = Vec::with_capacity(formed.len());
        for m in formed {
            self.publish(MatchLifecycleEvent::Formed(MatchFormed {
                match_id: m.match_id,
                game_id: m.game_id.clone(),
                players: m.players,
                stake_minor: m.stake_minor,
                occurred_at: m.created_at,
            }));
            match self.escrow(m.match_id) {
                Ok(escrowed) => out.push(escrowed),
                Err(err) => {
                    error!(match_id = %m.match_id, error = %err, "escrow failed");
                    out.push(m);
                }
            }
        }
        out
    }

    /// Lock both stakes. On failure compensate, fail the match, requeue the
    /// blameless player and retire the failing player's ticket.
    ///
    /// Safe to run again on a match left FORMED: the lock keys replay, and a
    /// stake found missing afterwards fails the match instead of confirming
    /// it. A match whose tickets were already released is failed too.
    ///
    /// Returns the match in its resulting state (ESCROWED or FAILED). An error
    /// leaves it FORMED for [`MatchCoordinator::resume_stalled_escrows`].
    #[instrument(skip(self), err)]
    pub fn escrow(&self, match_id: MatchId) -> Result<Match, CoordinatorError> {
        let m = self.load(match_id)?;
        if m.status != MatchStatus::Formed {
            return Ok(m);
        }

        let mut locked: Vec<UserId> = Vec::with_capacity(2);
        let failure = if self.tickets_held(&m)? {
            self.lock_stakes(&m, &mut locked)?
        } else {
            Some(EscrowFailure::Released)
        };

        let Some(failure) = failure else {
            let escrowed = self.save_transition(m, |m| m.transition(MatchStatus::Escrowed, Utc::now()))?;
            info!(pot_minor = escrowed.pot_minor(), "match escrowed");
            for ticket_id in escrowed.tickets {
                if let Err(err) = self.queue.settle_matched(ticket_id) {
                    warn!(%ticket_id, error = %err, "failed to retire matched ticket");
                }
            }
            self.publish(MatchLifecycleEvent::Escrowed(MatchEscrowed {
                match_id,
                pot_minor: escrowed.pot_minor(),
                occurred_at: escrowed.updated_at,
            }));
            return Ok(escrowed);
        };

        let reason = failure.to_string();
        warn!(%reason, "escrow failed, compensating");
        for player in &locked {
            let key = format!("{match_id}:{player}:unlock");
            if let Err(err) = self.ledger.unlock_wager(*player, match_id, &key) {
                // Stakes stay with the FORMED match until a later cycle unlocks them.
                error!(%player, error = %err, "compensating unlock failed");
                return Err(err.into());
            }
        }

        let saved = self.save_transition(m.clone(), |m| m.fail(reason.clone(), Utc::now()));
        self.settle_tickets(&m, failure.blamed());
        let failed = saved?;

        self.publish(MatchLifecycleEvent::Failed(MatchFailed {
            match_id,
            reason,
            occurred_at: failed.updated_at,
        }));
        Ok(failed)
    }

    fn tickets_held(&self, m: &Match) -> Result<bool, CoordinatorError> {
        for (ticket_id, round) in m.tickets.into_iter().zip(m.rounds) {
            if !self.queue.holds(ticket_id, round)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Lock each stake in turn, then confirm the ledger holds both. Players
    /// whose lock call succeeded are pushed to `locked`.
    fn lock_stakes(
        &self,
        m: &Match,
        locked: &mut Vec<UserId>,
    ) -> Result<Option<EscrowFailure>, CoordinatorError> {
        let match_id = m.match_id;
        for player in m.players {
            let key = format!("{match_id}:{player}:lock");
            match self.ledger.lock_wager(player, match_id, m.stake_minor, &key) {
                Ok(_) => locked.push(player),
                Err(LedgerError::Domain(err @ DomainError::InsufficientFunds { .. })) => {
                    return Ok(Some(EscrowFailure::Insufficient(player, err.to_string())));
                }
                Err(err) => return Ok(Some(EscrowFailure::Transient(player, err.to_string()))),
            }
        }

        // A replayed lock may belong to an attempt that was compensated since.
        for player in m.players {
            let held = self.ledger.escrowed_minor(player, match_id)?;
            if held != m.stake_minor {
                return Ok(Some(EscrowFailure::Shortfall {
                    player,
                    held,
                    stake: m.stake_minor,
                }));
            }
        }
        Ok(None)
    }

    /// Requeue the tickets of a failed escrow, cancelling the blamed one.
    /// Errors are logged; a ticket no longer held in the match's round is
    /// left alone.
    fn settle_tickets(&self, m: &Match, blamed: Option<UserId>) {
        let seats = m.players.iter().zip(m.tickets).zip(m.rounds);
        for ((player, ticket_id), round) in seats {
            let outcome = if Some(*player) == blamed {
                self.queue.cancel_matched(ticket_id, round)
            } else {
                self.queue.requeue(ticket_id, round)
            };
            if let Err(err) = outcome {
                error!(%ticket_id, error = %err, "failed to settle ticket after escrow failure");
            }
        }
    }

    #[instrument(skip(self), err)]
    pub fn mark_live(&self, match_id: MatchId) -> Result<Match, CoordinatorError> {
        let m = self.load(match_id)?;
        if m.status == MatchStatus::Live {
            return Ok(m);
        }
        let live = self.save_transition(m, |m| m.transition(MatchStatus::Live, Utc::now()))?;
        self.publish(MatchLifecycleEvent::Live(MatchLive {
            match_id,
            occurred_at: live.updated_at,
        }));
        Ok(live)
    }

    #[instrument(skip(self), err)]
    pub fn report_result(
        &self,
        match_id: MatchId,
        winner_id: UserId,
        idempotency_key: &str,
    ) -> Result<Match, CoordinatorError> {
        self.resolve(match_id, Resolution::payout(winner_id, idempotency_key))
    }

    #[instrument(skip(self), err)]
    pub fn refund(
        &self,
        match_id: MatchId,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<Match, CoordinatorError> {
        self.resolve(match_id, Resolution::refund(reason, idempotency_key))
    }

    /// Drive the operation a lifecycle event calls for.
    pub fn handle_event(&self, event: &LifecycleEvent) -> Result<Option<Match>, CoordinatorError> {
        match event {
            LifecycleEvent::Match(MatchLifecycleEvent::ResultReported(e)) => self
                .report_result(e.match_id, e.winner_id, &e.idempotency_key)
                .map(Some),
            LifecycleEvent::Match(MatchLifecycleEvent::Abandoned(e)) => self
                .refund(e.match_id, e.reason.as_str(), &e.idempotency_key)
                .map(Some),
            LifecycleEvent::Server(ServerLifecycleEvent::Started(e)) => {
                self.mark_live(e.match_id).map(Some)
            }
            LifecycleEvent::Server(ServerLifecycleEvent::Crashed(e)) => self
                .refund(
                    e.match_id,
                    "server_crashed",
                    &format!("server-crash:{}", e.server_id),
                )
                .map(Some),
            // Everything else is published by the coordinator itself or is informational.
            _ => Ok(None),
        }
    }

    fn resolve(&self, match_id: MatchId, resolution: Resolution) -> Result<Match, CoordinatorError> {
        let mut attempts = 0;
        let resolving = loop {
            attempts += 1;
            let mut m = self.load(match_id)?;

            if m.status.is_terminal() {
                return match &m.resolution {
                    Some(existing) if existing.is_same_call(&resolution) => Ok(m),
                    _ => Err(DomainError::conflict(format!(
                        "match {match_id} is already {}",
                        m.status.as_str()
                    ))
                    .into()),
                };
            }

            let expected = ExpectedVersion::Exact(m.version);
            match m.begin_resolution(resolution.clone(), Utc::now())? {
                ResolutionStart::Replay => break m,
                ResolutionStart::Fresh => match self.matches.update(&m, expected) {
                    Ok(stored) => break stored,
                    Err(MatchStoreError::Concurrency(_)) if attempts < SAVE_ATTEMPTS => continue,
                    Err(err) => return Err(err.into()),
                },
            }
        };

        let key = &resolution.idempotency_key;
        match &resolution.kind {
            ResolutionKind::Payout { winner_id } => {
                let receipt =
                    self.ledger
                        .payout_winner(match_id, *winner_id, &format!("{match_id}:payout:{key}"))?;
                let paid =
                    self.save_transition(resolving, |m| m.transition(MatchStatus::Paid, Utc::now()))?;
                info!(%winner_id, replayed = receipt.replayed, "match paid");
                self.publish(MatchLifecycleEvent::Paid(MatchPaid {
                    match_id,
                    winner_id: *winner_id,
                    transaction_id: receipt.transaction_id(),
                    occurred_at: paid.updated_at,
                }));
                Ok(paid)
            }
            ResolutionKind::Refund { reason } => {
                let receipt = self
                    .ledger
                    .refund_match(match_id, &format!("{match_id}:refund:{key}"))?;
                let refunded = self
                    .save_transition(resolving, |m| m.transition(MatchStatus::Refunded, Utc::now()))?;
                info!(%reason, replayed = receipt.replayed, "match refunded");
                self.publish(MatchLifecycleEvent::Refunded(MatchRefunded {
                    match_id,
                    transaction_id: receipt.transaction_id(),
                    occurred_at: refunded.updated_at,
                }));
                Ok(refunded)
            }
        }
    }

    fn load(&self, match_id: MatchId) -> Result<Match, CoordinatorError> {
        self.matches
            .get(match_id)?
            .ok_or_else(|| DomainError::not_found(format!("match {match_id}")).into())
    }

    /// Apply `change` and store it; on a version race re-read and re-apply.
    ///
    /// If a concurrent writer already moved the match to the target status,
    /// the re-applied change fails its transition check and that error is
    /// returned, except when the stored status already equals the result.
    fn save_transition<F>(&self, mut current: Match, change: F) -> Result<Match, CoordinatorError>
    where
        F: Fn(&mut Match) -> Result<(), DomainError>,
    {
        for attempt in 1..=SAVE_ATTEMPTS {
            let expected = ExpectedVersion::Exact(current.version);
            let mut next = current.clone();
            change(&mut next)?;
            match self.matches.update(&next, expected) {
                Ok(stored) => return Ok(stored),
                Err(MatchStoreError::Concurrency(_)) if attempt < SAVE_ATTEMPTS => {
                    let fresh = self.load(current.match_id)?;
                    if fresh.status == next.status {
                        return Ok(fresh);
                    }
                    current = fresh;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(DomainError::conflict(format!("match {} is contended", current.match_id)).into())
    }

    fn publish(&self, event: MatchLifecycleEvent) {
        let envelope = EventEnvelope::lifecycle(&self.topics, LifecycleEvent::Match(event));
        if let Err(err) = self.bus.publish(envelope) {
            warn!(error = ?err, "failed to publish lifecycle event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use wager_core::{AccountId, Currency, TicketId};
    use wager_events::{
        AbandonReason, InMemoryEventBus, MatchAbandoned, MatchResultReported, ServerCrashed,
        ServerStarted, Subscription,
    };
    use wager_ledger::{
        Account, AccountOwner, EscrowPosition, HOUSE_OPERATIONS, OperationRecord, Reference,
        TransactionType,
    };
    use wager_matchmaking::{Mode, SeekRequest, TicketState};

    use crate::account_store::{
        AccountStore, AccountStoreError, CommitOutcome, HistoryPage, HistoryQuery,
        InMemoryAccountStore, LedgerCommit,
    };
    use crate::lane_store::InMemoryLaneStore;
    use crate::ledger_engine::LedgerConfig;
    use crate::match_lock::InMemoryMatchLock;
    use crate::match_store::InMemoryMatchStore;
    use crate::matchmaker::QueueConfig;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<LifecycleEvent>>>;

    struct Harness {
        coordinator: MatchCoordinator<Bus>,
        events: Subscription<EventEnvelope<LifecycleEvent>>,
    }

    #[derive(Debug, Clone, Copy)]
    enum Fault {
        Outage,
        Contention,
    }

    /// Account store whose commits fail while a fault is set.
    #[derive(Default)]
    struct FaultyAccounts {
        inner: InMemoryAccountStore,
        fault: Mutex<Option<Fault>>,
    }

    impl FaultyAccounts {
        fn set(&self, fault: Option<Fault>) {
            *self.fault.lock().unwrap() = fault;
        }
    }

    impl AccountStore for FaultyAccounts {
        fn get_or_open(
            &self,
            owner: &AccountOwner,
            currency: Currency,
        ) -> Result<Account, AccountStoreError> {
            self.inner.get_or_open(owner, currency)
        }

        fn find(
            &self,
            owner: &AccountOwner,
            currency: Currency,
        ) -> Result<Option<Account>, AccountStoreError> {
            self.inner.find(owner, currency)
        }

        fn load(&self, ids: &[AccountId]) -> Result<BTreeMap<AccountId, Account>, AccountStoreError> {
            self.inner.load(ids)
        }

        fn find_operation(
            &self,
            idempotency_key: &str,
            tx_type: TransactionType,
        ) -> Result<Option<OperationRecord>, AccountStoreError> {
            self.inner.find_operation(idempotency_key, tx_type)
        }

        fn escrow_positions(
            &self,
            reference: &Reference,
        ) -> Result<Vec<EscrowPosition>, AccountStoreError> {
            self.inner.escrow_positions(reference)
        }

        fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, AccountStoreError> {
            match *self.fault.lock().unwrap() {
                Some(Fault::Outage) => Err(AccountStoreError::Unavailable("ledger database down".into())),
                Some(Fault::Contention) => Err(AccountStoreError::Concurrency("account moved".into())),
                None => self.inner.commit(commit),
            }
        }

        fn history(
            &self,
            account_id: AccountId,
            query: &HistoryQuery,
        ) -> Result<HistoryPage, AccountStoreError> {
            self.inner.history(account_id, query)
        }

        fn accounts(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError> {
            self.inner.accounts(currency)
        }
    }

    /// Match store whose updates fail while `down` is set.
    #[derive(Default)]
    struct FaultyMatches {
        inner: InMemoryMatchStore,
        down: AtomicBool,
    }

    impl MatchStore for FaultyMatches {
        fn insert(&self, record: &Match) -> Result<bool, MatchStoreError> {
            self.inner.insert(record)
        }

        fn get(&self, match_id: MatchId) -> Result<Option<Match>, MatchStoreError> {
            self.inner.get(match_id)
        }

        fn update(&self, record: &Match, expected: ExpectedVersion) -> Result<Match, MatchStoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(MatchStoreError::Unavailable("match database down".into()));
            }
            self.inner.update(record, expected)
        }

        fn list_by_status(&self, status: MatchStatus, limit: usize) -> Result<Vec<Match>, MatchStoreError> {
            self.inner.list_by_status(status, limit)
        }
    }

    fn harness() -> Harness {
        harness_over(
            Arc::new(InMemoryAccountStore::new()),
            Arc::new(InMemoryMatchStore::new()),
            QueueConfig::default(),
        )
    }

    /// Stalled escrows are resumed on the very next cycle.
    fn eager_resume() -> QueueConfig {
        QueueConfig {
            escrow_redrive_after: Duration::ZERO,
            ..QueueConfig::default()
        }
    }

    fn harness_over(
        accounts: Arc<dyn AccountStore>,
        matches: Arc<dyn MatchStore>,
        config: QueueConfig,
    ) -> Harness {
        let ledger = Arc::new(LedgerEngine::new(accounts, LedgerConfig::default()));
        let queue = Arc::new(MatchmakingQueue::new(
            Arc::new(InMemoryLaneStore::new()),
            Arc::new(InMemoryMatchLock::new()),
            Arc::clone(&matches),
            config,
        ));
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();
        Harness {
            coordinator: MatchCoordinator::new(ledger, queue, matches, bus, TopicConfig::default()),
            events,
        }
    }

    fn player(h: &Harness, funds: i64) -> UserId {
        let user = UserId::new();
        if funds > 0 {
            h.coordinator
                .ledger()
                .deposit(AccountOwner::user(user), funds, None, &format!("fund-{user}"))
                .unwrap();
        }
        user
    }

    fn seek(h: &Harness, user: UserId, at: i64) -> TicketId {
        let req = SeekRequest {
            user_id: user,
            game_id: "fc25".to_string(),
            mode: Mode::CloudStream,
            stake_minor: 500,
            region: "EU".to_string(),
            elo_band: "1200-1400".parse().unwrap(),
            ping_hint: None,
        };
        h.coordinator.queue().seek_at(req, at).unwrap().ticket_id
    }

    fn escrowed_match(h: &Harness) -> (Match, UserId, UserId) {
        let a = player(h, 1_000);
        let b = player(h, 1_000);
        seek(h, a, 1);
        seek(h, b, 2);
        let mut formed = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(formed.len(), 1);
        (formed.remove(0), a, b)
    }

    fn event_types(h: &Harness) -> Vec<String> {
        h.events
            .drain()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    #[test]
    fn cycle_forms_and_escrows_a_match() {
        let h = harness();
        let (m, a, b) = escrowed_match(&h);
        assert_eq!(m.status, MatchStatus::Escrowed);

        for user in [a, b] {
            let balance = h.coordinator.ledger().balance(user).unwrap();
            assert_eq!(balance.available_minor, 500);
            assert_eq!(balance.locked_minor, 500);
        }
        assert_eq!(event_types(&h), vec!["match.formed", "match.escrowed"]);
    }

    #[test]
    fn result_pays_the_winner_once() {
        let h = harness();
        let (m, a, b) = escrowed_match(&h);
        h.coordinator.mark_live(m.match_id).unwrap();

        let paid = h.coordinator.report_result(m.match_id, a, "ref-1").unwrap();
        assert_eq!(paid.status, MatchStatus::Paid);

        let again = h.coordinator.report_result(m.match_id, a, "ref-1").unwrap();
        assert_eq!(again.status, MatchStatus::Paid);

        let ledger = h.coordinator.ledger();
        assert_eq!(ledger.balance(a).unwrap().available_minor, 1_450);
        assert_eq!(ledger.balance(b).unwrap().available_minor, 500);
        assert_eq!(ledger.house_account(HOUSE_OPERATIONS).unwrap().available_minor, 50);

        let other = h.coordinator.refund(m.match_id, "timeout", "ref-2");
        assert!(matches!(other, Err(CoordinatorError::Domain(DomainError::Conflict(_)))));
        let swapped = h.coordinator.report_result(m.match_id, b, "ref-1");
        assert!(matches!(swapped, Err(CoordinatorError::Domain(DomainError::Conflict(_)))));
    }

    #[test]
    fn escrowed_match_can_be_refunded_without_going_live() {
        let h = harness();
        let (m, a, b) = escrowed_match(&h);
        let refunded = h.coordinator.refund(m.match_id, "no_result", "r1").unwrap();
        assert_eq!(refunded.status, MatchStatus::Refunded);
        for user in [a, b] {
            let balance = h.coordinator.ledger().balance(user).unwrap();
            assert_eq!(balance.available_minor, 1_000);
            assert_eq!(balance.locked_minor, 0);
        }
    }

    #[test]
    fn crash_between_resolving_and_paid_is_healed_by_resending() {
        let h = harness();
        let (m, a, _) = escrowed_match(&h);

        // Simulate a coordinator that recorded the call and died before the ledger step.
        let mut stuck = h.coordinator.get_match(m.match_id).unwrap().unwrap();
        let expected = ExpectedVersion::Exact(stuck.version);
        stuck
            .begin_resolution(Resolution::payout(a, "ref-9"), Utc::now())
            .unwrap();
        h.coordinator.matches.update(&stuck, expected).unwrap();

        let healed = h.coordinator.report_result(m.match_id, a, "ref-9").unwrap();
        assert_eq!(healed.status, MatchStatus::Paid);
        assert_eq!(h.coordinator.ledger().balance(a).unwrap().available_minor, 1_450);
    }

    #[test]
    fn failed_escrow_is_compensated_and_the_blameless_player_requeued() {
        let h = harness();
        let rich = player(&h, 1_000);
        let broke = player(&h, 100);
        let rich_ticket = seek(&h, rich, 1);
        let broke_ticket = seek(&h, broke, 2);

        let formed = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(formed.len(), 1);
        assert_eq!(formed[0].status, MatchStatus::Failed);
        assert!(formed[0].failure_reason.is_some());

        let rich_balance = h.coordinator.ledger().balance(rich).unwrap();
        assert_eq!(rich_balance.available_minor, 1_000);
        assert_eq!(rich_balance.locked_minor, 0);

        let queue = h.coordinator.queue();
        assert_eq!(
            queue.get_ticket(rich_ticket).unwrap().unwrap().state,
            TicketState::Seeking
        );
        assert_eq!(
            queue.get_ticket(broke_ticket).unwrap().unwrap().state,
            TicketState::Cancelled
        );
        assert!(event_types(&h).contains(&"match.failed".to_string()));
    }

    fn ticket_state(h: &Harness, ticket_id: TicketId) -> TicketState {
        h.coordinator.queue().get_ticket(ticket_id).unwrap().unwrap().state
    }

    #[test]
    fn ledger_outage_requeues_the_pair_and_the_next_cycle_escrows_it() {
        let accounts = Arc::new(FaultyAccounts::default());
        let h = harness_over(
            accounts.clone(),
            Arc::new(InMemoryMatchStore::new()),
            QueueConfig::default(),
        );
        let a = player(&h, 1_000);
        let b = player(&h, 1_000);
        let ta = seek(&h, a, 1);
        let tb = seek(&h, b, 2);

        accounts.set(Some(Fault::Outage));
        let first = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, MatchStatus::Failed);
        assert_eq!(ticket_state(&h, ta), TicketState::Seeking);
        assert_eq!(ticket_state(&h, tb), TicketState::Seeking);

        accounts.set(None);
        let second = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].match_id, first[0].match_id);
        assert_eq!(second[0].status, MatchStatus::Escrowed);
        for user in [a, b] {
            let balance = h.coordinator.ledger().balance(user).unwrap();
            assert_eq!(balance.available_minor, 500);
            assert_eq!(balance.locked_minor, 500);
        }
        assert_eq!(ticket_state(&h, ta), TicketState::Matched);
    }

    #[test]
    fn lock_contention_blames_nobody() {
        let accounts = Arc::new(FaultyAccounts::default());
        let h = harness_over(
            accounts.clone(),
            Arc::new(InMemoryMatchStore::new()),
            QueueConfig::default(),
        );
        let ta = seek(&h, player(&h, 1_000), 1);
        let tb = seek(&h, player(&h, 1_000), 2);

        accounts.set(Some(Fault::Contention));
        let formed = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(formed[0].status, MatchStatus::Failed);
        assert_eq!(ticket_state(&h, ta), TicketState::Seeking);
        assert_eq!(ticket_state(&h, tb), TicketState::Seeking);
    }

    #[test]
    fn lost_escrowed_write_is_finished_by_a_later_cycle() {
        let matches = Arc::new(FaultyMatches::default());
        let h = harness_over(
            Arc::new(InMemoryAccountStore::new()),
            matches.clone(),
            eager_resume(),
        );
        let a = player(&h, 1_000);
        let b = player(&h, 1_000);
        seek(&h, a, 1);
        seek(&h, b, 2);

        matches.down.store(true, Ordering::SeqCst);
        let formed = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(formed[0].status, MatchStatus::Formed);
        let match_id = formed[0].match_id;
        assert_eq!(h.coordinator.ledger().balance(a).unwrap().locked_minor, 500);

        matches.down.store(false, Ordering::SeqCst);
        assert!(h.coordinator.run_matching_cycle().unwrap().is_empty());
        let m = h.coordinator.get_match(match_id).unwrap().unwrap();
        assert_eq!(m.status, MatchStatus::Escrowed);
        for user in [a, b] {
            let balance = h.coordinator.ledger().balance(user).unwrap();
            assert_eq!(balance.available_minor, 500);
            assert_eq!(balance.locked_minor, 500);
        }
        assert!(event_types(&h).contains(&"match.escrowed".to_string()));
    }

    #[test]
    fn lost_failed_write_still_settles_tickets_and_is_failed_later() {
        let matches = Arc::new(FaultyMatches::default());
        let h = harness_over(
            Arc::new(InMemoryAccountStore::new()),
            matches.clone(),
            eager_resume(),
        );
        let rich = player(&h, 1_000);
        let broke = player(&h, 100);
        let rich_ticket = seek(&h, rich, 1);
        let broke_ticket = seek(&h, broke, 2);

        matches.down.store(true, Ordering::SeqCst);
        let formed = h.coordinator.run_matching_cycle().unwrap();
        assert_eq!(formed[0].status, MatchStatus::Formed);
        assert_eq!(ticket_state(&h, rich_ticket), TicketState::Seeking);
        assert_eq!(ticket_state(&h, broke_ticket), TicketState::Cancelled);
        let balance = h.coordinator.ledger().balance(rich).unwrap();
        assert_eq!(balance.available_minor, 1_000);
        assert_eq!(balance.locked_minor, 0);

        matches.down.store(false, Ordering::SeqCst);
        let resumed = h.coordinator.resume_stalled_escrows().unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, MatchStatus::Failed);
        assert_eq!(ticket_state(&h, rich_ticket), TicketState::Seeking);
        assert_eq!(h.coordinator.ledger().balance(rich).unwrap().locked_minor, 0);
    }

    #[test]
    fn fresh_formed_matches_are_not_resumed_early() {
        let matches = Arc::new(FaultyMatches::default());
        let h = harness_over(
            Arc::new(InMemoryAccountStore::new()),
            matches.clone(),
            QueueConfig::default(),
        );
        seek(&h, player(&h, 1_000), 1);
        seek(&h, player(&h, 1_000), 2);

        matches.down.store(true, Ordering::SeqCst);
        h.coordinator.run_matching_cycle().unwrap();
        matches.down.store(false, Ordering::SeqCst);
        assert!(h.coordinator.resume_stalled_escrows().unwrap().is_empty());
    }

    #[test]
    fn lifecycle_events_drive_resolution() {
        let h = harness();
        let (m, a, _) = escrowed_match(&h);
        let now = Utc::now();

        let live = h
            .coordinator
            .handle_event(&LifecycleEvent::Server(ServerLifecycleEvent::Started(
                ServerStarted {
                    server_id: "srv-1".to_string(),
                    match_id: m.match_id,
                    occurred_at: now,
                },
            )))
            .unwrap()
            .unwrap();
        assert_eq!(live.status, MatchStatus::Live);

        let event = LifecycleEvent::Match(MatchLifecycleEvent::ResultReported(MatchResultReported {
            match_id: m.match_id,
            winner_id: a,
            idempotency_key: "ref-1".to_string(),
            occurred_at: now,
        }));
        let paid = h.coordinator.handle_event(&event).unwrap().unwrap();
        assert_eq!(paid.status, MatchStatus::Paid);

        // At-least-once delivery: the duplicate is a replay.
        let again = h.coordinator.handle_event(&event).unwrap().unwrap();
        assert_eq!(again.version, paid.version);
    }

    #[test]
    fn abandoned_and_crashed_matches_are_refunded() {
        let h = harness();
        let (first, a, _) = escrowed_match(&h);
        let refunded = h
            .coordinator
            .handle_event(&LifecycleEvent::Match(MatchLifecycleEvent::Abandoned(
                MatchAbandoned {
                    match_id: first.match_id,
                    reason: AbandonReason::Timeout,
                    idempotency_key: "abandon-1".to_string(),
                    occurred_at: Utc::now(),
                },
            )))
            .unwrap()
            .unwrap();
        assert_eq!(refunded.status, MatchStatus::Refunded);
        assert_eq!(h.coordinator.ledger().balance(a).unwrap().locked_minor, 0);

        let (second, _, _) = escrowed_match(&h);
        let crashed = h
            .coordinator
            .handle_event(&LifecycleEvent::Server(ServerLifecycleEvent::Crashed(
                ServerCrashed {
                    server_id: "srv-2".to_string(),
                    match_id: second.match_id,
                    detail: None,
                    occurred_at: Utc::now(),
                },
            )))
            .unwrap()
            .unwrap();
        assert_eq!(crashed.status, MatchStatus::Refunded);
    }

    #[test]
    fn unknown_match_is_not_found() {
        let h = harness();
        let err = h.coordinator.mark_live(MatchId::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::Domain(DomainError::NotFound(_))));
    }
}
