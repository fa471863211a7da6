//! Deterministic binary encoding for consensus types.
//!
//! All numeric values are little-endian. Encoding format:
//! - Fixed-size fields (integers, bool, byte arrays, names) are written raw
//! - Variable-length fields (`Vec<u8>`, `String`) are u32 length-prefixed
//! - Sequences are u32 count-prefixed then concatenated
//! - Options carry a 1-byte flag (0 = None, 1 = Some) before the value
//! - Enums carry a 1-byte tag
//!
//! Ids, merkle leaves, and stored records are all computed over these
//! bytes, so layouts here are protocol.

use crate::block::{
    BlockHeader, ProducerKey, ProducerSchedule, ReceiptTransaction, SignedBlock,
    TransactionReceipt, TransactionReceiptHeader,
};
use crate::error::{ChainError, ChainResult};
use crate::resource::UsageWindow;
use crate::trace::{ActionReceipt, TransactionStatus};
use crate::transaction::{
    Action, DeferredKey, PermissionLevel, SignedTransaction, Transaction, TransactionHeader,
    TransactionSignature,
};
use crate::types::Name;

/// A cursor for reading bytes during decoding.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, n: usize) -> ChainResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(ChainError::Serialization("unexpected end of data".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> ChainResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ChainResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> ChainResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ChainResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a count prefix, rejecting counts the remaining input cannot hold.
    fn read_count(&mut self, min_item_size: usize) -> ChainResult<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(ChainError::Serialization(format!(
                "count {count} exceeds remaining input"
            )));
        }
        Ok(count)
    }
}

/// Types with a canonical binary encoding.
pub trait Pack {
    fn pack(&self, buf: &mut Vec<u8>);

    /// Encode into a fresh buffer.
    fn packed(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.pack(&mut buf);
        buf
    }
}

/// Types decodable from their canonical binary encoding.
pub trait Unpack: Sized {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self>;

    /// Smallest encoded size, used to bound count prefixes.
    const MIN_SIZE: usize = 1;
}

/// Decode a value that must occupy all of `data`.
pub fn unpack_from<T: Unpack>(data: &[u8]) -> ChainResult<T> {
    let mut r = Reader::new(data);
    let value = T::unpack(&mut r)?;
    if r.remaining() != 0 {
        return Err(ChainError::Serialization(format!(
            "{} trailing bytes",
            r.remaining()
        )));
    }
    Ok(value)
}

// ── Scalars ──

macro_rules! impl_int {
    ($($t:ty),*) => {$(
        impl Pack for $t {
            fn pack(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Unpack for $t {
            const MIN_SIZE: usize = core::mem::size_of::<$t>();

            fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
                Ok(<$t>::from_le_bytes(r.read_array()?))
            }
        }
    )*};
}

impl_int!(u8, u16, u32, u64, u128);

impl Pack for bool {
    fn pack(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }
}

impl Unpack for bool {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        match r.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(ChainError::Serialization(format!("invalid bool value {b}"))),
        }
    }
}

impl<const N: usize> Pack for [u8; N] {
    fn pack(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }
}

impl<const N: usize> Unpack for [u8; N] {
    const MIN_SIZE: usize = N;

    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        r.read_array()
    }
}

impl Pack for Name {
    fn pack(&self, buf: &mut Vec<u8>) {
        self.as_u64().pack(buf);
    }
}

impl Unpack for Name {
    const MIN_SIZE: usize = 8;

    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        Ok(Name::from_u64(r.read_u64()?))
    }
}

impl Pack for String {
    fn pack(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).pack(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Unpack for String {
    const MIN_SIZE: usize = 4;

    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        let len = r.read_count(1)?;
        String::from_utf8(r.read_bytes(len)?.to_vec())
            .map_err(|_| ChainError::Serialization("invalid UTF-8".into()))
    }
}

// ── Containers ──

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).pack(buf);
        for item in self {
            item.pack(buf);
        }
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    const MIN_SIZE: usize = 4;

    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        let count = r.read_count(T::MIN_SIZE)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::unpack(r)?);
        }
        Ok(out)
    }
}

impl<T: Pack> Pack for Option<T> {
    fn pack(&self, buf: &mut Vec<u8>) {
        match self {
            None => buf.push(0),
            Some(v) => {
                buf.push(1);
                v.pack(buf);
            }
        }
    }
}

impl<T: Unpack> Unpack for Option<T> {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        match r.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::unpack(r)?)),
            b => Err(ChainError::Serialization(format!("invalid optional flag {b}"))),
        }
    }
}

impl<A: Pack, B: Pack> Pack for (A, B) {
    fn pack(&self, buf: &mut Vec<u8>) {
        self.0.pack(buf);
        self.1.pack(buf);
    }
}

impl<A: Unpack, B: Unpack> Unpack for (A, B) {
    const MIN_SIZE: usize = A::MIN_SIZE + B::MIN_SIZE;

    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        Ok((A::unpack(r)?, B::unpack(r)?))
    }
}

/// Implement `Pack`/`Unpack` for a struct as the concatenation of its
/// fields in declaration order.
#[macro_export]
macro_rules! impl_pack {
    ($t:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::codec::Pack for $t {
            fn pack(&self, buf: &mut Vec<u8>) {
                $( $crate::codec::Pack::pack(&self.$field, buf); )+
            }
        }

        impl $crate::codec::Unpack for $t {
            fn unpack(r: &mut $crate::codec::Reader<'_>) -> $crate::error::ChainResult<Self> {
                Ok(Self { $( $field: $crate::codec::Unpack::unpack(r)?, )+ })
            }
        }
    };
}

// ── Transactions ──

impl_pack!(PermissionLevel { actor, permission });
impl_pack!(Action { account, name, authorization, data });
impl_pack!(TransactionHeader { expiration, max_net_usage_words, max_cpu_usage_us, delay_sec });
impl_pack!(Transaction { header, context_free_actions, actions, extensions });
impl_pack!(TransactionSignature { public_key, signature });
impl_pack!(SignedTransaction { transaction, signatures, context_free_data });
impl_pack!(DeferredKey { sender, sender_id });

// ── Blocks and receipts ──

impl Pack for TransactionStatus {
    fn pack(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
}

impl Unpack for TransactionStatus {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        let b = r.read_u8()?;
        TransactionStatus::from_u8(b)
            .ok_or_else(|| ChainError::Serialization(format!("invalid status: {b}")))
    }
}

impl_pack!(BlockHeader {
    previous,
    timestamp_ms,
    producer,
    transaction_mroot,
    action_mroot,
    schedule_version,
    extensions,
});
impl_pack!(TransactionReceiptHeader { status, cpu_usage_us, net_usage_words });
impl_pack!(TransactionReceipt { header, trx });
impl_pack!(SignedBlock { header, producer_signature, transactions });
impl_pack!(ProducerKey { producer_name, signing_key });
impl_pack!(ProducerSchedule { version, producers });
impl_pack!(ActionReceipt { receiver, act_digest, global_sequence, recv_sequence, auth_sequence });

impl Pack for ReceiptTransaction {
    fn pack(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Input(trx) => {
                buf.push(0);
                trx.pack(buf);
            }
            Self::Scheduled { id, key } => {
                buf.push(1);
                id.pack(buf);
                key.pack(buf);
            }
        }
    }
}

impl Unpack for ReceiptTransaction {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        match r.read_u8()? {
            0 => Ok(Self::Input(SignedTransaction::unpack(r)?)),
            1 => Ok(Self::Scheduled {
                id: Unpack::unpack(r)?,
                key: Unpack::unpack(r)?,
            }),
            b => Err(ChainError::Serialization(format!("invalid receipt tag {b}"))),
        }
    }
}

// ── Ledger records ──

impl Pack for UsageWindow {
    fn pack(&self, buf: &mut Vec<u8>) {
        self.head().pack(buf);
        (self.buckets().len() as u32).pack(buf);
        for b in self.buckets() {
            b.pack(buf);
        }
    }
}

impl Unpack for UsageWindow {
    fn unpack(r: &mut Reader<'_>) -> ChainResult<Self> {
        let head = r.read_u64()?;
        let buckets = Vec::<u64>::unpack(r)?;
        UsageWindow::from_parts(head, buckets)
    }
}
