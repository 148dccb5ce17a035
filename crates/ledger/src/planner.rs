//! Turns a request plus account snapshots into a validated `Posting`.
//!
//! Planning never mutates anything. Balance preconditions are checked here so
//! callers get a precise error before touching the store; `apply_posting`
//! re-checks them against whatever snapshot it is handed at commit time.

use serde::{Deserialize, Serialize};

use wager_core::{AccountId, DomainError, DomainResult, FeeBps, MatchId, MinorUnits, UserId};

use crate::account::{Account, Bucket};
use crate::posting::{Balancing, Posting, PostingLine};
use crate::transaction::{RefType, Reference, TransactionType};

/// Net amount an account holds locked for one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowPosition {
    pub account_id: AccountId,
    pub user_id: Option<UserId>,
    pub locked_minor: MinorUnits,
}

fn ensure_positive(amount: MinorUnits) -> DomainResult<()> {
    if amount <= 0 {
        return Err(DomainError::validation("amount must be positive"));
    }
    Ok(())
}

fn ensure_available(account: &Account, amount: MinorUnits) -> DomainResult<()> {
    if account.available_minor < amount {
        return Err(DomainError::insufficient_funds(account.available_minor, amount));
    }
    Ok(())
}

fn posting(
    tx_type: TransactionType,
    primary_account_id: AccountId,
    balancing: Balancing,
    lines: Vec<PostingLine>,
) -> Posting {
    Posting {
        tx_type,
        lines,
        balancing,
        primary_account_id,
        reference: None,
        note: None,
        fingerprint: String::new(),
    }
}

pub fn plan_lock(account: &Account, amount: MinorUnits, reference: Reference) -> DomainResult<Posting> {
    ensure_positive(amount)?;
    ensure_available(account, amount)?;

    let mut p = posting(
        TransactionType::Lock,
        account.id,
        Balancing::Balanced,
        vec![
            PostingLine::debit(account.id, Bucket::Available, amount),
            PostingLine::credit(account.id, Bucket::Locked, amount),
        ],
    );
    p.reference = Some(reference);
    p.validate()?;
    Ok(p)
}

/// Release `amount` (or everything, when `None`) held for the position's reference.
pub fn plan_unlock(
    position: &EscrowPosition,
    amount: Option<MinorUnits>,
    reference: Reference,
) -> DomainResult<Posting> {
    if position.locked_minor <= 0 {
        return Err(DomainError::not_found(format!(
            "locked funds for {}:{}",
            reference.ref_type.as_str(),
            reference.ref_id
        )));
    }
    let amount = amount.unwrap_or(position.locked_minor);
    ensure_positive(amount)?;
    if amount > position.locked_minor {
        return Err(DomainError::validation(format!(
            "cannot unlock {amount}, only {} is locked for this reference",
            position.locked_minor
        )));
    }

    let mut p = posting(
        TransactionType::Unlock,
        position.account_id,
        Balancing::Balanced,
        vec![
            PostingLine::debit(position.account_id, Bucket::Locked, amount),
            PostingLine::credit(position.account_id, Bucket::Available, amount),
        ],
    );
    p.reference = Some(reference);
    p.validate()?;
    Ok(p)
}

fn escrowed(match_id: MatchId, positions: &[EscrowPosition]) -> DomainResult<Vec<EscrowPosition>> {
    let held: Vec<EscrowPosition> = positions
        .iter()
        .copied()
        .filter(|p| p.locked_minor > 0)
        .collect();
    if held.is_empty() {
        return Err(DomainError::not_found(format!("escrow for match {match_id}")));
    }
    Ok(held)
}

/// Pot minus fee to the winner, fee to the house; every stake leaves `locked`.
pub fn plan_payout(
    match_id: MatchId,
    positions: &[EscrowPosition],
    winner_id: UserId,
    house_account_id: AccountId,
    fee_bps: FeeBps,
) -> DomainResult<Posting> {
    let held = escrowed(match_id, positions)?;
    let winner = held
        .iter()
        .find(|p| p.user_id == Some(winner_id))
        .ok_or_else(|| {
            DomainError::validation(format!(
                "winner {winner_id} has no stake escrowed for match {match_id}"
            ))
        })?;

    let pot: i128 = held.iter().map(|p| i128::from(p.locked_minor)).sum();
    let pot = MinorUnits::try_from(pot).map_err(|_| DomainError::invariant("pot overflow"))?;
    let fee = fee_bps.fee_on(pot)?;
    let winnings = pot - fee;

    let mut lines: Vec<PostingLine> = held
        .iter()
        .map(|p| PostingLine::debit(p.account_id, Bucket::Locked, p.locked_minor))
        .collect();
    if winnings > 0 {
        lines.push(PostingLine::credit(winner.account_id, Bucket::Available, winnings));
    }
    if fee > 0 {
        lines.push(PostingLine::credit(house_account_id, Bucket::Available, fee));
    }

    let mut p = posting(
        TransactionType::Payout,
        winner.account_id,
        Balancing::Balanced,
        lines,
    );
    p.reference = Some(Reference::for_match(match_id));
    p.validate()?;
    Ok(p)
}

/// Every escrowed stake goes back to its owner's available balance.
pub fn plan_refund(match_id: MatchId, positions: &[EscrowPosition]) -> DomainResult<Posting> {
    let held = escrowed(match_id, positions)?;

    let mut lines = Vec::with_capacity(held.len() * 2);
    for p in &held {
        lines.push(PostingLine::debit(p.account_id, Bucket::Locked, p.locked_minor));
        lines.push(PostingLine::credit(p.account_id, Bucket::Available, p.locked_minor));
    }

    let mut p = posting(
        TransactionType::Refund,
        held[0].account_id,
        Balancing::Balanced,
        lines,
    );
    p.reference = Some(Reference::for_match(match_id));
    p.validate()?;
    Ok(p)
}

pub fn plan_transfer(
    from: &Account,
    to: &Account,
    amount: MinorUnits,
    note: Option<String>,
) -> DomainResult<Posting> {
    ensure_positive(amount)?;
    if from.id == to.id {
        return Err(DomainError::validation("cannot transfer to self"));
    }
    if from.currency != to.currency {
        return Err(DomainError::validation("accounts hold different currencies"));
    }
    ensure_available(from, amount)?;

    let mut p = posting(
        TransactionType::Transfer,
        from.id,
        Balancing::Balanced,
        vec![
            PostingLine::debit(from.id, Bucket::Available, amount),
            PostingLine::credit(to.id, Bucket::Available, amount),
        ],
    );
    p.note = note;
    p.validate()?;
    Ok(p)
}

/// Credit a user from the rewards house account.
pub fn plan_earn(
    user: &Account,
    house: &Account,
    amount: MinorUnits,
    reason: &str,
    reference: Option<Reference>,
) -> DomainResult<Posting> {
    ensure_positive(amount)?;
    ensure_available(house, amount)?;

    let mut p = posting(
        TransactionType::Earn,
        user.id,
        Balancing::Balanced,
        vec![
            PostingLine::debit(house.id, Bucket::Available, amount),
            PostingLine::credit(user.id, Bucket::Available, amount),
        ],
    );
    p.reference = Some(reference.unwrap_or_else(|| Reference::new(RefType::Reward, reason)));
    p.note = Some(reason.to_string());
    p.validate()?;
    Ok(p)
}

pub fn plan_deposit(
    account: &Account,
    amount: MinorUnits,
    external_ref: Option<String>,
) -> DomainResult<Posting> {
    ensure_positive(amount)?;

    let mut p = posting(
        TransactionType::Deposit,
        account.id,
        Balancing::ExternalInflow,
        vec![PostingLine::credit(account.id, Bucket::Available, amount)],
    );
    p.reference = external_ref.map(|r| Reference::new(RefType::External, r));
    p.validate()?;
    Ok(p)
}

pub fn plan_withdraw(
    account: &Account,
    amount: MinorUnits,
    external_ref: Option<String>,
) -> DomainResult<Posting> {
    ensure_positive(amount)?;
    ensure_available(account, amount)?;

    let mut p = posting(
        TransactionType::Withdraw,
        account.id,
        Balancing::ExternalOutflow,
        vec![PostingLine::debit(account.id, Bucket::Available, amount)],
    );
    p.reference = external_ref.map(|r| Reference::new(RefType::External, r));
    p.validate()?;
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountOwner, HOUSE_OPERATIONS, HOUSE_REWARDS};
    use crate::posting::apply_posting;
    use std::collections::BTreeMap;
    use wager_core::Currency;

    fn user_account(available: MinorUnits, locked: MinorUnits) -> Account {
        let mut a = Account::open(&AccountOwner::user(UserId::new()), Currency::Fc);
        a.available_minor = available;
        a.locked_minor = locked;
        a
    }

    fn position(a: &Account, locked: MinorUnits) -> EscrowPosition {
        EscrowPosition {
            account_id: a.id,
            user_id: a.user_id,
            locked_minor: locked,
        }
    }

    #[test]
    fn lock_requires_available_funds() {
        let a = user_account(400, 0);
        let err = plan_lock(&a, 500, Reference::for_match(MatchId::new())).unwrap_err();
        assert_eq!(err, DomainError::insufficient_funds(400, 500));
    }

    #[test]
    fn payout_splits_pot_between_winner_and_house() {
        let p1 = user_account(500, 500);
        let p2 = user_account(500, 500);
        let house = Account::open(&AccountOwner::house(HOUSE_OPERATIONS), Currency::Fc);
        let match_id = MatchId::new();
        let winner = p1.user_id.unwrap();

        let posting = plan_payout(
            match_id,
            &[position(&p1, 500), position(&p2, 500)],
            winner,
            house.id,
            FeeBps::DEFAULT,
        )
        .unwrap();
        assert_eq!(posting.primary_account_id, p1.id);

        let mut accounts = BTreeMap::from([
            (p1.id, p1.clone()),
            (p2.id, p2.clone()),
            (house.id, house.clone()),
        ]);
        apply_posting(&posting, &mut accounts).unwrap();

        assert_eq!(accounts[&p1.id].available_minor, 1450);
        assert_eq!(accounts[&p1.id].locked_minor, 0);
        assert_eq!(accounts[&p2.id].available_minor, 500);
        assert_eq!(accounts[&p2.id].locked_minor, 0);
        assert_eq!(accounts[&house.id].available_minor, 50);
    }

    #[test]
    fn zero_fee_omits_house_leg() {
        let p1 = user_account(0, 5);
        let p2 = user_account(0, 4);
        let house_id = AccountId::new();
        // 5% of 9 rounds to 0.
        let posting = plan_payout(
            MatchId::new(),
            &[position(&p1, 5), position(&p2, 4)],
            p2.user_id.unwrap(),
            house_id,
            FeeBps::DEFAULT,
        )
        .unwrap();
        assert!(posting.lines.iter().all(|l| l.account_id != house_id));
    }

    #[test]
    fn payout_rejects_winner_without_stake() {
        let p1 = user_account(0, 500);
        let err = plan_payout(
            MatchId::new(),
            &[position(&p1, 500)],
            UserId::new(),
            AccountId::new(),
            FeeBps::DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn payout_without_escrow_is_not_found() {
        let err = plan_payout(
            MatchId::new(),
            &[],
            UserId::new(),
            AccountId::new(),
            FeeBps::DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn refund_returns_each_stake() {
        let p1 = user_account(500, 500);
        let p2 = user_account(0, 500);
        let match_id = MatchId::new();
        let posting = plan_refund(match_id, &[position(&p1, 500), position(&p2, 500)]).unwrap();

        let mut accounts = BTreeMap::from([(p1.id, p1.clone()), (p2.id, p2.clone())]);
        let effects = apply_posting(&posting, &mut accounts).unwrap();
        assert_eq!(effects.len(), 2);
        assert_eq!(accounts[&p1.id].available_minor, 1000);
        assert_eq!(accounts[&p2.id].available_minor, 500);
        assert_eq!(accounts[&p2.id].locked_minor, 0);
    }

    #[test]
    fn unlock_cannot_exceed_locked_for_reference() {
        let a = user_account(0, 800);
        let reference = Reference::new(RefType::Tournament, "t-1");
        let err = plan_unlock(&position(&a, 300), Some(400), reference.clone()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let full = plan_unlock(&position(&a, 300), None, reference).unwrap();
        assert_eq!(full.lines[0].amount, 300);
    }

    #[test]
    fn earn_draws_from_rewards_house() {
        let user = user_account(0, 0);
        let house = Account::open(&AccountOwner::house(HOUSE_REWARDS), Currency::Fc);
        let err = plan_earn(&user, &house, 100, "daily-login", None).unwrap_err();
        assert_eq!(err, DomainError::insufficient_funds(0, 100));
    }

    #[test]
    fn withdraw_is_single_sided() {
        let a = user_account(100, 0);
        let p = plan_withdraw(&a, 60, Some("payout-42".to_string())).unwrap();
        assert_eq!(p.balancing, Balancing::ExternalOutflow);

        let mut accounts = BTreeMap::from([(a.id, a.clone())]);
        apply_posting(&p, &mut accounts).unwrap();
        assert_eq!(accounts[&a.id].available_minor, 40);
        assert_eq!(accounts[&a.id].total_withdrawn_minor, 60);
    }
}
