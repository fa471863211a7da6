//! Fork database: the tree of candidate blocks above the irreversible root.
//!
//! Every block added must link to a block already in the tree. The head is
//! chosen by an injected [`ForkChoice`]; the surrounding consensus protocol
//! owns that rule, and [`LongestChain`] is the default. Advancing the root
//! prunes every block that does not descend from the new root.
//!
//! The database only tracks headers and validation flags. Applying and
//! undoing block state is the controller's job.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use meterchain_primitives::types::short_hex;
use meterchain_primitives::{
    BlockHeader, BlockId, BlockNum, ChainError, ChainResult, SignedBlock, TimestampMs,
};

/// A block and its position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub id: BlockId,
    pub block_num: BlockNum,
    pub block: Arc<SignedBlock>,
    /// Set once the block's transactions have been applied successfully.
    pub validated: bool,
}

impl BlockState {
    pub fn new(block: SignedBlock, validated: bool) -> Self {
        Self {
            id: block.id(),
            block_num: block.block_num(),
            block: Arc::new(block),
            validated,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.block.header
    }

    pub fn previous(&self) -> BlockId {
        self.block.header.previous
    }

    pub fn timestamp_ms(&self) -> TimestampMs {
        self.block.header.timestamp_ms
    }
}

/// Head selection rule.
pub trait ForkChoice: Send + Sync {
    /// Whether `candidate` should replace `current` as head.
    fn prefer(&self, candidate: &BlockState, current: &BlockState) -> bool;
}

/// Highest block number wins; ties keep the current head.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongestChain;

impl ForkChoice for LongestChain {
    fn prefer(&self, candidate: &BlockState, current: &BlockState) -> bool {
        candidate.block_num > current.block_num
    }
}

pub struct ForkDatabase {
    blocks: BTreeMap<BlockId, BlockState>,
    root: BlockState,
    head: BlockState,
    choice: Box<dyn ForkChoice>,
}

impl fmt::Debug for ForkDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkDatabase")
            .field("blocks", &self.blocks.len())
            .field("root", &self.root.block_num)
            .field("head", &self.head.block_num)
            .finish()
    }
}

impl ForkDatabase {
    /// Tree holding only `root`, with [`LongestChain`] selection.
    pub fn new(root: BlockState) -> Self {
        Self::with_fork_choice(root, Box::new(LongestChain))
    }

    pub fn with_fork_choice(root: BlockState, choice: Box<dyn ForkChoice>) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(root.id, root.clone());
        Self {
            blocks,
            head: root.clone(),
            root,
            choice,
        }
    }

    /// Replace the head selection rule and reselect the head.
    pub fn set_fork_choice(&mut self, choice: Box<dyn ForkChoice>) {
        self.choice = choice;
        self.head = self.best();
    }

    pub fn root(&self) -> &BlockState {
        &self.root
    }

    pub fn head(&self) -> &BlockState {
        &self.head
    }

    pub fn get(&self, id: &BlockId) -> Option<&BlockState> {
        self.blocks.get(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn require(&self, id: &BlockId) -> ChainResult<&BlockState> {
        self.blocks
            .get(id)
            .ok_or_else(|| ChainError::ForkDatabase(format!("block {} not in fork database", short_hex(id))))
    }

    /// Insert a block whose parent is already known.
    pub fn add(&mut self, state: BlockState) -> ChainResult<()> {
        if self.blocks.contains_key(&state.id) {
            return Err(ChainError::InvalidBlock(format!(
                "block {} #{} already known",
                short_hex(&state.id),
                state.block_num
            )));
        }
        let Some(parent) = self.blocks.get(&state.previous()) else {
            return Err(ChainError::UnlinkableBlock {
                block_num: state.block_num,
                reason: format!("previous {} unknown", short_hex(&state.previous())),
            });
        };
        if parent.block_num.checked_add(1) != Some(state.block_num) {
            return Err(ChainError::UnlinkableBlock {
                block_num: state.block_num,
                reason: format!("parent is #{}", parent.block_num),
            });
        }
        if self.choice.prefer(&state, &self.head) {
            self.head = state.clone();
        }
        self.blocks.insert(state.id, state);
        Ok(())
    }

    pub fn mark_valid(&mut self, id: &BlockId) -> ChainResult<()> {
        let state = self
            .blocks
            .get_mut(id)
            .ok_or_else(|| ChainError::ForkDatabase(format!("block {} not in fork database", short_hex(id))))?;
        state.validated = true;
        if self.head.id == *id {
            self.head.validated = true;
        }
        Ok(())
    }

    /// Point the head at `id`, which must be in the database.
    pub fn set_head(&mut self, id: &BlockId) -> ChainResult<()> {
        self.head = self.require(id)?.clone();
        Ok(())
    }

    /// Ancestor of `id` (or `id` itself) at height `block_num`.
    pub fn ancestor_at(&self, id: &BlockId, block_num: BlockNum) -> ChainResult<&BlockState> {
        let mut state = self.require(id)?;
        if block_num > state.block_num {
            return Err(ChainError::ForkDatabase(format!(
                "#{block_num} is above block #{}",
                state.block_num
            )));
        }
        while state.block_num > block_num {
            state = self.require(&state.previous())?;
        }
        Ok(state)
    }

    /// Whether `ancestor` is `id` or lies on its branch.
    pub fn is_on_branch(&self, ancestor: &BlockId, id: &BlockId) -> ChainResult<bool> {
        let Some(target) = self.blocks.get(ancestor) else {
            return Ok(false);
        };
        Ok(self.ancestor_at(id, target.block_num).map(|s| s.id == *ancestor).unwrap_or(false))
    }

    /// Branches from `first` and `second` down to (excluding) their common
    /// ancestor, each ordered newest first.
    pub fn fetch_branch_from(
        &self,
        first: &BlockId,
        second: &BlockId,
    ) -> ChainResult<(Vec<BlockState>, Vec<BlockState>)> {
        let mut a = self.require(first)?;
        let mut b = self.require(second)?;
        let mut first_branch = Vec::new();
        let mut second_branch = Vec::new();
        while a.block_num > b.block_num {
            first_branch.push(a.clone());
            a = self.require(&a.previous())?;
        }
        while b.block_num > a.block_num {
            second_branch.push(b.clone());
            b = self.require(&b.previous())?;
        }
        while a.id != b.id {
            first_branch.push(a.clone());
            second_branch.push(b.clone());
            a = self.require(&a.previous())?;
            b = self.require(&b.previous())?;
        }
        Ok((first_branch, second_branch))
    }

    /// Remove `id` and all of its descendants. The head is kept if it
    /// survives, otherwise reselected. Returns the removed ids.
    pub fn remove(&mut self, id: &BlockId) -> ChainResult<Vec<BlockId>> {
        if *id == self.root.id {
            return Err(ChainError::ForkDatabase("cannot remove the root".into()));
        }
        self.require(id)?;
        let mut removed = BTreeSet::from([*id]);
        loop {
            let before = removed.len();
            for state in self.blocks.values() {
                if removed.contains(&state.previous()) {
                    removed.insert(state.id);
                }
            }
            if removed.len() == before {
                break;
            }
        }
        for removed_id in &removed {
            self.blocks.remove(removed_id);
        }
        if removed.contains(&self.head.id) {
            self.head = self.best();
        }
        Ok(removed.into_iter().collect())
    }

    /// Make `id` the root, pruning every block that does not descend from
    /// it. Returns the pruned blocks.
    pub fn advance_root(&mut self, id: &BlockId) -> ChainResult<Vec<BlockState>> {
        let new_root = self.require(id)?.clone();
        if new_root.block_num <= self.root.block_num {
            return Err(ChainError::ForkDatabase(format!(
                "new root #{} not above root #{}",
                new_root.block_num, self.root.block_num
            )));
        }
        let keep: BTreeSet<BlockId> = self
            .blocks
            .values()
            .filter(|s| s.block_num >= new_root.block_num)
            .filter(|s| self.is_on_branch(id, &s.id).unwrap_or(false))
            .map(|s| s.id)
            .collect();
        let pruned: Vec<BlockState> = self
            .blocks
            .values()
            .filter(|s| !keep.contains(&s.id))
            .cloned()
            .collect();
        self.blocks.retain(|block_id, _| keep.contains(block_id));
        self.root = new_root;
        if !keep.contains(&self.head.id) {
            self.head = self.best();
        }
        Ok(pruned)
    }

    /// Move the root to the head's ancestor `confirmations` blocks back.
    /// Returns the new root, or `None` if the root does not move.
    pub fn advance_irreversible(&mut self, confirmations: u32) -> ChainResult<Option<BlockState>> {
        let target = self.head.block_num.saturating_sub(confirmations);
        if target <= self.root.block_num {
            return Ok(None);
        }
        let id = self.ancestor_at(&self.head.id, target)?.id;
        self.advance_root(&id)?;
        Ok(Some(self.root.clone()))
    }

    fn best(&self) -> BlockState {
        let mut best = &self.root;
        for state in self.blocks.values() {
            if self.choice.prefer(state, best) {
                best = state;
            }
        }
        best.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterchain_primitives::{name, ZERO_HASH};

    fn block(previous: &BlockState, timestamp_ms: u64) -> BlockState {
        let header = BlockHeader {
            previous: previous.id,
            timestamp_ms,
            producer: name("prod"),
            ..Default::default()
        };
        BlockState::new(
            SignedBlock {
                header,
                ..Default::default()
            },
            false,
        )
    }

    fn genesis() -> BlockState {
        BlockState::new(
            SignedBlock {
                header: BlockHeader {
                    previous: ZERO_HASH,
                    timestamp_ms: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            true,
        )
    }

    #[test]
    fn test_add_links_and_selects_longest() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let a3 = block(&a2, 1000);
        db.add(a2.clone()).unwrap();
        db.add(a3.clone()).unwrap();
        assert_eq!(db.head().id, a3.id);
        assert_eq!(a3.block_num, 3);

        // Equal height on another fork keeps the current head.
        let b2 = block(&root, 1000);
        let b3 = block(&b2, 1500);
        db.add(b2.clone()).unwrap();
        db.add(b3.clone()).unwrap();
        assert_eq!(db.head().id, a3.id);

        let b4 = block(&b3, 2000);
        db.add(b4.clone()).unwrap();
        assert_eq!(db.head().id, b4.id);
    }

    #[test]
    fn test_unlinkable_and_duplicate() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let orphan = block(&a2, 1000);
        assert!(matches!(db.add(orphan), Err(ChainError::UnlinkableBlock { block_num: 3, .. })));
        db.add(a2.clone()).unwrap();
        assert!(matches!(db.add(a2), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_fetch_branch_from() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let a3 = block(&a2, 1000);
        let b3 = block(&a2, 1500);
        let b4 = block(&b3, 2000);
        for s in [&a2, &a3, &b3, &b4] {
            db.add(s.clone()).unwrap();
        }
        let (new_branch, old_branch) = db.fetch_branch_from(&b4.id, &a3.id).unwrap();
        let ids = |v: &[BlockState]| v.iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(&new_branch), vec![b4.id, b3.id]);
        assert_eq!(ids(&old_branch), vec![a3.id]);
    }

    #[test]
    fn test_remove_takes_descendants() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let a3 = block(&a2, 1000);
        let b2 = block(&root, 1000);
        for s in [&a2, &a3, &b2] {
            db.add(s.clone()).unwrap();
        }
        let removed = db.remove(&a2.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(db.head().id, b2.id);
        assert!(db.remove(&root.id).is_err());
    }

    #[test]
    fn test_remove_keeps_surviving_head() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let b2 = block(&root, 1000);
        let b3 = block(&b2, 1500);
        for s in [&a2, &b2, &b3] {
            db.add(s.clone()).unwrap();
        }
        db.set_head(&a2.id).unwrap();
        db.remove(&b3.id).unwrap();
        assert_eq!(db.head().id, a2.id);
        assert!(db.set_head(&b3.id).is_err());
    }

    #[test]
    fn test_advance_irreversible_prunes_other_forks() {
        let root = genesis();
        let mut db = ForkDatabase::new(root.clone());
        let a2 = block(&root, 500);
        let a3 = block(&a2, 1000);
        let a4 = block(&a3, 1500);
        let b2 = block(&root, 1000);
        let b3 = block(&a2, 2000);
        for s in [&a2, &a3, &a4, &b2, &b3] {
            db.add(s.clone()).unwrap();
        }
        assert_eq!(db.advance_irreversible(5).unwrap(), None);
        let new_root = db.advance_irreversible(1).unwrap().unwrap();
        assert_eq!(new_root.id, a3.id);
        assert_eq!(db.root().block_num, 3);
        assert!(db.get(&b2.id).is_none());
        assert!(db.get(&b3.id).is_none());
        assert!(db.get(&a2.id).is_none());
        assert_eq!(db.len(), 2);
        assert_eq!(db.head().id, a4.id);
    }

    struct LatestTimestamp;

    impl ForkChoice for LatestTimestamp {
        fn prefer(&self, candidate: &BlockState, current: &BlockState) -> bool {
            candidate.timestamp_ms() > current.timestamp_ms()
        }
    }

    #[test]
    fn test_injected_fork_choice() {
        let root = genesis();
        let mut db = ForkDatabase::with_fork_choice(root.clone(), Box::new(LatestTimestamp));
        let a2 = block(&root, 500);
        let a3 = block(&a2, 1000);
        let b2 = block(&root, 3000);
        for s in [&a2, &a3, &b2] {
            db.add(s.clone()).unwrap();
        }
        assert_eq!(db.head().id, b2.id);
        db.set_fork_choice(Box::new(LongestChain));
        assert_eq!(db.head().id, a3.id);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use proptest::sample::Index;

        proptest! {
            #[test]
            fn head_is_known_and_highest_after_removals(
                parents in prop::collection::vec(any::<Index>(), 1..24),
                removals in prop::collection::vec(any::<Index>(), 0..6),
            ) {
                let root = genesis();
                let mut db = ForkDatabase::new(root.clone());
                let mut states = vec![root.clone()];
                for (i, parent) in parents.iter().enumerate() {
                    let state = block(parent.get(&states), 500 * (i as u64 + 1));
                    db.add(state.clone()).unwrap();
                    states.push(state);
                }
                for pick in removals {
                    let candidates: Vec<BlockId> = states
                        .iter()
                        .map(|s| s.id)
                        .filter(|id| *id != root.id && db.get(id).is_some())
                        .collect();
                    if candidates.is_empty() {
                        break;
                    }
                    db.remove(pick.get(&candidates)).unwrap();
                    let head = db.head().clone();
                    prop_assert!(db.get(&head.id).is_some());
                    let highest = states
                        .iter()
                        .filter(|s| db.get(&s.id).is_some())
                        .map(|s| s.block_num)
                        .max()
                        .unwrap();
                    prop_assert_eq!(head.block_num, highest);
                }
            }
        }
    }
}
