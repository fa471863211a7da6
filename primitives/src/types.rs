//! Core type aliases, names, and constants for the meterchain execution core.
//!
//! These types are shared by the ledger, dispatch loop, fork database, and
//! block assembly. Every value here participates in consensus encoding, so
//! layouts are fixed and integer-only.

use core::fmt;
use core::str::FromStr;

use crate::error::{ChainError, ChainResult};

/// 32-byte digest used for block ids, transaction ids, and merkle nodes.
pub type Hash = [u8; 32];

/// Block id. The first four bytes carry the big-endian block number.
pub type BlockId = Hash;

/// Transaction id (SHA-256 of the packed transaction body).
pub type TransactionId = Hash;

/// Block number (monotonically increasing along a branch).
pub type BlockNum = u32;

/// Milliseconds since the Unix epoch. Block and transaction times are
/// logical values taken from headers, never from the local clock.
pub type TimestampMs = u64;

/// Ed25519 public key bytes.
pub type PublicKey = [u8; 32];

/// Ed25519 signature bytes.
pub type SignatureBytes = [u8; 64];

/// A zero-valued hash (32 zero bytes).
pub const ZERO_HASH: Hash = [0u8; 32];

/// Bytes charged per contract row on top of key and value length.
pub const ROW_OVERHEAD_BYTES: u64 = 112;

/// Bytes charged per deferred transaction entry on top of its packed size.
pub const DEFERRED_OVERHEAD_BYTES: u64 = 96;

/// Bytes charged for a freshly created account.
pub const NEW_ACCOUNT_RAM_BYTES: u64 = 2_048;

/// Extract the block number embedded in a block id.
pub fn block_num_from_id(id: &BlockId) -> BlockNum {
    u32::from_be_bytes([id[0], id[1], id[2], id[3]])
}

/// Convert a `Hash` to a hex string for display purposes.
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut s = String::with_capacity(66);
    s.push_str("0x");
    for byte in hash {
        use core::fmt::Write;
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

/// Short form of a hash for log lines: the first eight bytes in hex.
pub fn short_hex(hash: &Hash) -> String {
    let mut s = String::with_capacity(16);
    for byte in &hash[..8] {
        use core::fmt::Write;
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

// ── Name ──

const NAME_CHARSET: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// 64-bit account / action / table identifier.
///
/// The textual form uses the 32-symbol alphabet `.12345a-z`, up to twelve
/// 5-bit symbols plus a thirteenth 4-bit symbol. Ordering and equality are
/// on the raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(u64);

impl Name {
    /// The empty name (all zero bits).
    pub const EMPTY: Name = Name(0);

    /// Wrap a raw 64-bit value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the empty name.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

fn symbol_of(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

impl FromStr for Name {
    type Err = ChainError;

    fn from_str(s: &str) -> ChainResult<Self> {
        let bytes = s.as_bytes();
        if bytes.len() > 13 {
            return Err(ChainError::InvalidName(s.to_string()));
        }
        let mut value = 0u64;
        for (i, c) in bytes.iter().enumerate() {
            let sym = symbol_of(*c).ok_or_else(|| ChainError::InvalidName(s.to_string()))?;
            if i < 12 {
                value |= (sym & 0x1f) << (64 - 5 * (i + 1));
            } else {
                // 13th symbol only has four bits available.
                if sym > 0x0f {
                    return Err(ChainError::InvalidName(s.to_string()));
                }
                value |= sym;
            }
        }
        Ok(Self(value))
    }
}

impl TryFrom<String> for Name {
    type Error = ChainError;

    fn try_from(s: String) -> ChainResult<Self> {
        s.parse()
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.to_string()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [b'.'; 13];
        let mut tmp = self.0;
        for i in 0..13 {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            out[12 - i] = NAME_CHARSET[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let end = out.iter().rposition(|c| *c != b'.').map_or(0, |p| p + 1);
        // Charset is pure ASCII.
        f.write_str(core::str::from_utf8(&out[..end]).unwrap_or(""))
    }
}

/// Parse a name literal. Usable in `const` items; malformed literals fail
/// to compile there and panic elsewhere, so reserve it for literals.
pub const fn name(s: &str) -> Name {
    let bytes = s.as_bytes();
    assert!(bytes.len() <= 13, "name literal too long");
    let mut value = 0u64;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let sym = match c {
            b'a'..=b'z' => (c - b'a') as u64 + 6,
            b'1'..=b'5' => (c - b'1') as u64 + 1,
            b'.' => 0,
            _ => panic!("invalid character in name literal"),
        };
        if i < 12 {
            value |= (sym & 0x1f) << (64 - 5 * (i + 1));
        } else {
            assert!(sym <= 0x0f, "invalid 13th character in name literal");
            value |= sym;
        }
        i += 1;
    }
    Name(value)
}
