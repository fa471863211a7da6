//! Shared test helpers for integration tests.
//!
//! Provides deterministic keypairs, a scripted `kv` contract, transaction
//! builders, and chain factories used across all integration test files.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;

use meterchain_engine::registry::{NewAccount, SetCode, SetLimits};
use meterchain_engine::{Controller, ControllerConfig, Genesis, HostApi, NativeContractExecutor};
use meterchain_primitives::codec::{unpack_from, Pack};
use meterchain_primitives::{
    impl_pack, name, Action, ChainResult, Name, PermissionLevel, ProducerKey, ProducerSchedule,
    SignedBlock, SignedTransaction, Transaction, TransactionHeader, TransactionTrace, UndoStore,
};

pub const GENESIS_TIMESTAMP_MS: u64 = 1_000;
pub const BLOCK_INTERVAL_MS: u64 = 500;

pub const SYSTEM: Name = name("system");
pub const PRODUCER: Name = name("prod");
pub const KV: Name = name("kv");
pub const ROWS: Name = name("rows");
pub const KV_CODE: &[u8] = b"kv";

// ── Deterministic Keypairs ──

/// Create a deterministic Ed25519 signing key from a single seed byte.
///
/// The secret key is `[seed; 32]`, giving reproducible keys across machines.
pub fn deterministic_keypair(seed: u8) -> (ed25519_dalek::VerifyingKey, SigningKey) {
    let signing_key = SigningKey::from_bytes(&[seed; 32]);
    (signing_key.verifying_key(), signing_key)
}

/// Alice: seed=1.
pub fn alice() -> (Name, SigningKey) {
    (name("alice"), deterministic_keypair(1).1)
}

/// Bob: seed=2.
pub fn bob() -> (Name, SigningKey) {
    (name("bob"), deterministic_keypair(2).1)
}

/// Charlie: seed=3.
pub fn charlie() -> (Name, SigningKey) {
    (name("charlie"), deterministic_keypair(3).1)
}

/// Owner of the `kv` contract: seed=4.
pub fn kv_key() -> SigningKey {
    deterministic_keypair(4).1
}

/// Producer and system account: seed=9.
pub fn producer_key() -> SigningKey {
    deterministic_keypair(9).1
}

// ── kv contract ──

/// `kv::set` payload. Creates or overwrites row `key` in the `rows` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub key: u64,
    pub value: Vec<u8>,
}
impl_pack!(Put { key, value });

/// `kv::schedule` payload. Schedules `action` as a deferred transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub sender_id: u128,
    pub delay_sec: u32,
    pub action: Action,
}
impl_pack!(Schedule { sender_id, delay_sec, action });

/// The `kv` contract. Notifications are accepted without side effects.
///
/// - `set(Put)`: write a row
/// - `setfail(Put)`: write rows `key` and `key + 1`, then assert
/// - `burn(u64)`: charge that many microseconds of CPU
/// - `notify(Name)`: notify another account
/// - `forward(Put)`: send `set` inline
/// - `schedule(Schedule)`: send a deferred transaction paid by `kv`
/// - `notifyall(Vec<Name>)`: notify each account in order
/// - `loop`: send itself inline, forever
/// - `fanout(u32)`: send that many `burn(0)` actions inline
/// - `stall(u64)`: sleep that many milliseconds, read a row, then assert
pub fn kv_contract(host: &mut dyn HostApi) -> ChainResult<()> {
    if host.receiver() != host.action().account {
        return Ok(());
    }
    host.charge_cpu(200)?;
    let act = host.action().clone();
    match act.name {
        n if n == name("set") => {
            let put: Put = unpack_from(&act.data)?;
            write_row(host, put.key, put.value)
        }
        n if n == name("setfail") => {
            let put: Put = unpack_from(&act.data)?;
            write_row(host, put.key, put.value.clone())?;
            write_row(host, put.key + 1, put.value)?;
            host.check(false, "setfail always asserts")
        }
        n if n == name("burn") => {
            let us: u64 = unpack_from(&act.data)?;
            host.charge_cpu(us)
        }
        n if n == name("notify") => {
            let account: Name = unpack_from(&act.data)?;
            host.require_recipient(account)
        }
        n if n == name("forward") => host.send_inline(kv_action("set", KV, act.data.clone())),
        n if n == name("schedule") => {
            let schedule: Schedule = unpack_from(&act.data)?;
            let trx = Transaction {
                header: TransactionHeader {
                    expiration: host.block_time() + 60_000,
                    delay_sec: schedule.delay_sec,
                    ..Default::default()
                },
                actions: vec![schedule.action],
                ..Default::default()
            };
            host.send_deferred(schedule.sender_id, KV, trx)
        }
        n if n == name("notifyall") => {
            let accounts: Vec<Name> = unpack_from(&act.data)?;
            for account in accounts {
                host.require_recipient(account)?;
            }
            Ok(())
        }
        n if n == name("loop") => host.send_inline(kv_action("loop", KV, Vec::new())),
        n if n == name("fanout") => {
            let count: u32 = unpack_from(&act.data)?;
            for _ in 0..count {
                host.send_inline(kv_action("burn", KV, 0u64.packed()))?;
            }
            Ok(())
        }
        n if n == name("stall") => {
            let ms: u64 = unpack_from(&act.data)?;
            std::thread::sleep(std::time::Duration::from_millis(ms));
            let receiver = host.receiver();
            host.db_get(receiver, receiver, ROWS, 0)?;
            host.check(false, "stall outlived its deadline")
        }
        _ => host.check(false, "unknown kv action"),
    }
}

fn write_row(host: &mut dyn HostApi, key: u64, value: Vec<u8>) -> ChainResult<()> {
    let receiver = host.receiver();
    if host.db_get(receiver, receiver, ROWS, key)?.is_some() {
        host.db_update(receiver, ROWS, key, receiver, value)
    } else {
        host.db_store(receiver, ROWS, key, receiver, value)
    }
}

pub fn kv_executor() -> NativeContractExecutor {
    NativeContractExecutor::new().with_contract(KV_CODE.to_vec(), kv_contract)
}

// ── Actions and transactions ──

pub fn kv_action(action: &str, actor: Name, data: Vec<u8>) -> Action {
    Action::new(
        KV,
        name(action),
        vec![PermissionLevel::new(actor, name("active"))],
        data,
    )
}

pub fn put(actor: Name, key: u64, value: &[u8]) -> Action {
    kv_action(
        "set",
        actor,
        Put {
            key,
            value: value.to_vec(),
        }
        .packed(),
    )
}

pub fn put_then_fail(actor: Name, key: u64) -> Action {
    kv_action(
        "setfail",
        actor,
        Put {
            key,
            value: b"doomed".to_vec(),
        }
        .packed(),
    )
}

pub fn system_action(action: &str, actor: Name, data: Vec<u8>) -> Action {
    Action::new(
        SYSTEM,
        name(action),
        vec![PermissionLevel::new(actor, name("active"))],
        data,
    )
}

/// Sign `actions` for a chain with every key in `signers`. `nonce` keeps
/// otherwise identical transactions distinct.
pub fn signed_trx(
    chain: &Controller,
    actions: Vec<Action>,
    signers: &[&SigningKey],
    nonce: u64,
) -> SignedTransaction {
    let expiration = chain.head_block_state().timestamp_ms() + 30_000 + nonce;
    let trx = Transaction {
        header: TransactionHeader {
            expiration,
            ..Default::default()
        },
        actions,
        ..Default::default()
    };
    let mut signed = SignedTransaction::new(trx);
    for key in signers {
        signed.sign(chain.chain_id(), *key);
    }
    signed
}

// ── Chains ──

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        chain_name: "meterchain-test".into(),
        ..Default::default()
    }
}

pub fn genesis() -> Genesis {
    let producer = producer_key().verifying_key().to_bytes();
    Genesis {
        initial_timestamp_ms: GENESIS_TIMESTAMP_MS,
        initial_key: producer,
        initial_schedule: ProducerSchedule {
            version: 1,
            producers: vec![ProducerKey {
                producer_name: PRODUCER,
                signing_key: producer,
            }],
        },
    }
}

/// Fresh chain with only the system account.
pub fn empty_chain(config: ControllerConfig) -> Controller {
    Controller::new(config, genesis(), UndoStore::new(), Box::new(kv_executor())).unwrap()
}

/// Next producer slot after the head.
pub fn next_timestamp(chain: &Controller) -> u64 {
    chain.head_block_state().timestamp_ms() + BLOCK_INTERVAL_MS
}

/// Produce and commit a block with `trxs`, returning it with the traces.
pub fn produce_block(chain: &mut Controller, trxs: &[SignedTransaction]) -> (SignedBlock, Vec<TransactionTrace>) {
    let timestamp_ms = next_timestamp(chain);
    chain.start_block(timestamp_ms, PRODUCER).unwrap();
    let traces = trxs
        .iter()
        .map(|trx| chain.push_transaction(trx, None).unwrap())
        .collect();
    let block = chain.finalize_block(&producer_key()).unwrap();
    chain.commit_block().unwrap();
    (block, traces)
}

pub fn produce_empty_block(chain: &mut Controller) -> SignedBlock {
    produce_block(chain, &[]).0
}

/// Block #2: creates alice, bob, charlie, and kv, and deploys the kv
/// contract. Returns the block for replay on other chains.
pub fn bootstrap(chain: &mut Controller) -> SignedBlock {
    let system_key = producer_key();
    let accounts = [
        (alice().0, deterministic_keypair(1).0),
        (bob().0, deterministic_keypair(2).0),
        (charlie().0, deterministic_keypair(3).0),
        (KV, deterministic_keypair(4).0),
    ];
    let create: Vec<Action> = accounts
        .iter()
        .map(|(account, vk)| {
            system_action(
                "newaccount",
                SYSTEM,
                NewAccount {
                    creator: SYSTEM,
                    name: *account,
                    auth_key: vk.to_bytes(),
                }
                .packed(),
            )
        })
        .collect();
    let create_trx = signed_trx(chain, create, &[&system_key], 0);
    let setcode = system_action(
        "setcode",
        KV,
        SetCode {
            account: KV,
            code: KV_CODE.to_vec(),
        }
        .packed(),
    );
    let setcode_trx = signed_trx(chain, vec![setcode], &[&kv_key()], 0);
    produce_block(chain, &[create_trx, setcode_trx]).0
}

/// Chain after [`bootstrap`].
pub fn bootstrapped_chain(config: ControllerConfig) -> (Controller, SignedBlock) {
    let mut chain = empty_chain(config);
    let block = bootstrap(&mut chain);
    (chain, block)
}

/// `setlimits` action signed by the system account.
pub fn set_limits_trx(chain: &Controller, limits: SetLimits, nonce: u64) -> SignedTransaction {
    let action = system_action("setlimits", SYSTEM, limits.packed());
    signed_trx(chain, vec![action], &[&producer_key()], nonce)
}
