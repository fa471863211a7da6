//! Transaction and block header validation.
//!
//! These checks run before anything is written: a transaction that fails
//! here is rejected without a receipt, and a block header that fails is
//! never added to the fork database.

use std::collections::BTreeSet;

use meterchain_primitives::types::{short_hex, PublicKey};
use meterchain_primitives::{
    crypto, ChainError, ChainResult, Hash, Name, ProducerKey, ProducerSchedule, SignedBlock,
    SignedTransaction, TimestampMs, Transaction,
};

use crate::config::{ChainLimits, ScheduleConfig};
use crate::fork_database::BlockState;

/// Static checks on a transaction against the pending block time.
///
/// Checks:
/// - expiration is after `block_time` and within the maximum lifetime
/// - at least one action, and no more than the dispatch bound
/// - delay within the maximum
/// - context-free actions declare no authorization
pub fn validate_transaction(trx: &Transaction, block_time: TimestampMs, limits: &ChainLimits) -> ChainResult<()> {
    let expiration = trx.header.expiration;
    if expiration <= block_time {
        return Err(ChainError::Expired(format!(
            "expired at {expiration}, block time {block_time}"
        )));
    }
    if expiration > block_time.saturating_add(limits.max_transaction_lifetime_ms) {
        return Err(ChainError::Expired(format!(
            "expiration {expiration} exceeds maximum lifetime from {block_time}"
        )));
    }
    if trx.actions.is_empty() {
        return Err(ChainError::Malformed("transaction has no actions".into()));
    }
    if trx.action_count() > limits.max_actions_per_transaction as usize {
        return Err(ChainError::Malformed(format!(
            "{} actions exceed the limit of {}",
            trx.action_count(),
            limits.max_actions_per_transaction
        )));
    }
    if trx.header.delay_sec > limits.max_transaction_delay_sec {
        return Err(ChainError::Malformed(format!(
            "delay {}s exceeds maximum {}s",
            trx.header.delay_sec, limits.max_transaction_delay_sec
        )));
    }
    if trx.context_free_actions.iter().any(|a| !a.authorization.is_empty()) {
        return Err(ChainError::ContextFreeViolation(
            "context-free actions cannot declare authorization".into(),
        ));
    }
    Ok(())
}

/// Verify every signature over the signing digest and return the signer keys.
pub fn verify_signatures(trx: &SignedTransaction, chain_id: &Hash) -> ChainResult<BTreeSet<PublicKey>> {
    let digest = trx.signing_digest(chain_id);
    let mut keys = BTreeSet::new();
    for sig in &trx.signatures {
        if !crypto::verify_ed25519(&digest, &sig.signature, &sig.public_key) {
            return Err(ChainError::SignatureInvalid(format!(
                "signature by key {} does not verify",
                short_hex(&sig.public_key)
            )));
        }
        if !keys.insert(sig.public_key) {
            return Err(ChainError::Malformed(format!(
                "duplicate signature by key {}",
                short_hex(&sig.public_key)
            )));
        }
    }
    Ok(keys)
}

/// Check that `producer` owns the slot at `timestamp_ms`, which must be
/// slot-aligned and after `previous_timestamp_ms`. Returns the producer's key.
pub fn validate_block_timing<'s>(
    timestamp_ms: TimestampMs,
    producer: Name,
    previous_timestamp_ms: TimestampMs,
    schedule: &'s ProducerSchedule,
    config: &ScheduleConfig,
) -> ChainResult<&'s ProducerKey> {
    if timestamp_ms <= previous_timestamp_ms {
        return Err(ChainError::InvalidBlock(format!(
            "timestamp {timestamp_ms} not after previous {previous_timestamp_ms}"
        )));
    }
    if timestamp_ms % config.block_interval_ms != 0 {
        return Err(ChainError::InvalidBlock(format!(
            "timestamp {timestamp_ms} not aligned to {}ms slots",
            config.block_interval_ms
        )));
    }
    let scheduled = schedule
        .scheduled_producer(timestamp_ms, config.block_interval_ms, config.producer_repetitions)
        .ok_or_else(|| ChainError::InvalidBlock("producer schedule is empty".into()))?;
    if scheduled.producer_name != producer {
        return Err(ChainError::InvalidBlock(format!(
            "{producer} produced slot {timestamp_ms} owned by {}",
            scheduled.producer_name
        )));
    }
    Ok(scheduled)
}

/// Validate a received block header against its parent.
///
/// Checks linkage, slot timing and producer, schedule version, and the
/// producer signature.
pub fn validate_header(
    block: &SignedBlock,
    previous: &BlockState,
    schedule: &ProducerSchedule,
    config: &ScheduleConfig,
) -> ChainResult<()> {
    let header = &block.header;
    if header.previous != previous.id {
        return Err(ChainError::UnlinkableBlock {
            block_num: block.block_num(),
            reason: format!(
                "previous {} does not match {}",
                short_hex(&header.previous),
                short_hex(&previous.id)
            ),
        });
    }
    let key = validate_block_timing(
        header.timestamp_ms,
        header.producer,
        previous.timestamp_ms(),
        schedule,
        config,
    )?;
    if header.schedule_version != schedule.version {
        return Err(ChainError::InvalidBlock(format!(
            "schedule version {} does not match active version {}",
            header.schedule_version, schedule.version
        )));
    }
    if !block.verify_signature(&key.signing_key) {
        return Err(ChainError::SignatureInvalid(format!(
            "producer signature on block #{} does not verify",
            block.block_num()
        )));
    }
    Ok(())
}
