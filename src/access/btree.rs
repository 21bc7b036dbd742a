//! B+-tree over the slotted-page store.
//!
//! Internal pages hold separator keys and child ids; leaf pages hold the
//! user records and form a doubly linked chain in key order. Keys compare
//! as raw byte strings throughout.

pub mod range;

use thiserror::Error;
use tracing::{debug, trace};

use crate::storage::page::{CELL_HEADER_SIZE, SLOT_SIZE};
use crate::storage::{KeyType, Page, PageError, PageId, PageType, Pager, PAGE_HEADER_SIZE, PAGE_SIZE};

pub use range::Record;

/// Largest key + value payload accepted by the tree: one record must fit
/// in an empty page. Larger records are rejected rather than chained
/// through overflow pages.
const MAX_RECORD_PAYLOAD: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE - CELL_HEADER_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BTreeError {
    /// The key is already present; the tree is unchanged.
    #[error("duplicate key")]
    DuplicateKey,

    /// The record cannot fit in a single page.
    #[error("record of {size} bytes does not fit in a page")]
    RecordTooLarge { size: usize },
}

/// Carried up the insertion path when a page splits: the old page has
/// been replaced by two freshly allocated halves and freed.
struct SplitResult {
    promoted_key: Vec<u8>,
    left_id: PageId,
    right_id: PageId,
    old_page_id: PageId,
}

pub struct BTree {
    pager: Pager,
    root_id: PageId,
    first_leaf_id: PageId,
    last_leaf_id: PageId,
    key_type: KeyType,
}

impl BTree {
    /// Creates a tree consisting of a single empty leaf.
    pub fn new(key_type: KeyType) -> Self {
        let mut pager = Pager::new();
        let (root_id, _) = pager.allocate(PageType::Leaf, key_type);
        Self {
            pager,
            root_id,
            first_leaf_id: root_id,
            last_leaf_id: root_id,
            key_type,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_id
    }

    /// Number of levels from the root down to the leaves.
    pub fn height(&mut self) -> usize {
        let mut height = 1;
        let mut current = self.root_id;
        loop {
            let page = self.pager.acquire(current);
            if page.page_type() == PageType::Leaf {
                return height;
            }
            let next = if page.record_count() > 0 {
                child_id(page.value_by_index(0))
            } else {
                page.right_pointer()
                    .expect("internal page has no right pointer")
            };
            drop(page);
            height += 1;
            current = next;
        }
    }

    /// Returns the value stored for `key`, if any.
    pub fn search(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let leaf_id = self.find_leaf(key);
        let leaf = self.pager.acquire(leaf_id);
        leaf.get(key).map(|value| value.to_vec())
    }

    /// Inserts a record. The only recoverable failures are a duplicate
    /// key and a record too large for a page; page-full conditions are
    /// resolved internally by splitting.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        let payload = key.len() + value.len();
        if payload > MAX_RECORD_PAYLOAD {
            return Err(BTreeError::RecordTooLarge { size: payload });
        }

        let split = self.insert_into(self.root_id, key, value)?;
        if let Some(split) = split {
            // The root itself split: grow the tree by one level.
            let (new_root_id, mut root) = self.pager.allocate(PageType::Internal, self.key_type);
            root.insert_record(&split.promoted_key, &child_id_bytes(split.left_id))
                .expect("empty root must accept the promoted key");
            root.set_right_pointer(Some(split.right_id));
            drop(root);
            self.root_id = new_root_id;
            debug!(root = new_root_id.0, "root split, tree grew one level");
        }
        Ok(())
    }

    /// Descends to the leaf that owns `key`, releasing pins level by
    /// level.
    fn find_leaf(&mut self, key: &[u8]) -> PageId {
        let mut current = self.root_id;
        loop {
            let page = self.pager.acquire(current);
            if page.page_type() == PageType::Leaf {
                return current;
            }
            let next = choose_child(&page, key);
            drop(page);
            current = next;
        }
    }

    fn insert_into(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<SplitResult>, BTreeError> {
        let page_type = self.pager.acquire(page_id).page_type();
        match page_type {
            PageType::Leaf => self.insert_into_leaf(page_id, key, value),
            PageType::Internal => self.insert_into_internal(page_id, key, value),
        }
    }

    fn insert_into_internal(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<SplitResult>, BTreeError> {
        // Descent: walk towards the leaf.
        let child = {
            let page = self.pager.acquire(page_id);
            choose_child(&page, key)
        };
        let split = self.insert_into(child, key, value)?;

        // Unwind: absorb the child's split, possibly splitting this page
        // in turn.
        match split {
            Some(split) => Ok(self.absorb_split(page_id, split)),
            None => Ok(None),
        }
    }

    fn insert_into_leaf(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<SplitResult>, BTreeError> {
        let result = self.pager.acquire(page_id).insert_record(key, value);
        match result {
            Ok(()) => Ok(None),
            Err(PageError::DuplicateKey) => Err(BTreeError::DuplicateKey),
            Err(PageError::PageFull { .. }) => Ok(Some(self.split_leaf(page_id, key, value))),
            Err(err) => panic!("unexpected error inserting into leaf {}: {err}", page_id.0),
        }
    }

    /// Splits a full leaf into two fresh halves and inserts the pending
    /// record into the correct one. The promoted key is the first key of
    /// the right half; it is copied up, not removed.
    fn split_leaf(&mut self, page_id: PageId, key: &[u8], value: &[u8]) -> SplitResult {
        let (promoted_key, left_records, right_records, old_prev, old_next) = {
            let page = self.pager.acquire(page_id);
            let count = page.record_count();
            let mid = count / 2;
            (
                page.key_by_index(mid).to_vec(),
                page.extract_records(0, mid),
                page.extract_records(mid, count),
                page.prev_leaf(),
                page.next_leaf(),
            )
        };

        let (left_id, _) =
            self.pager
                .allocate_from_records(PageType::Leaf, self.key_type, &left_records);
        let (right_id, _) =
            self.pager
                .allocate_from_records(PageType::Leaf, self.key_type, &right_records);

        // Relink the leaf chain around the two new pages, updating the
        // termini when the old page was first or last.
        {
            let mut left = self.pager.acquire(left_id);
            left.set_prev_leaf(old_prev);
            left.set_next_leaf(Some(right_id));
        }
        {
            let mut right = self.pager.acquire(right_id);
            right.set_prev_leaf(Some(left_id));
            right.set_next_leaf(old_next);
        }
        match old_prev {
            Some(prev_id) => self.pager.acquire(prev_id).set_next_leaf(Some(left_id)),
            None => self.first_leaf_id = left_id,
        }
        match old_next {
            Some(next_id) => self.pager.acquire(next_id).set_prev_leaf(Some(right_id)),
            None => self.last_leaf_id = right_id,
        }

        let target = if key >= promoted_key.as_slice() {
            right_id
        } else {
            left_id
        };
        self.pager
            .acquire(target)
            .insert_record(key, value)
            .expect("freshly split leaf must accept the record");

        self.pager.free(page_id);
        trace!(
            old = page_id.0,
            left = left_id.0,
            right = right_id.0,
            "leaf split"
        );

        SplitResult {
            promoted_key,
            left_id,
            right_id,
            old_page_id: page_id,
        }
    }

    /// Rewrites the parent's reference to a split child and inserts the
    /// promoted separator, splitting the parent when it has no room.
    fn absorb_split(&mut self, page_id: PageId, split: SplitResult) -> Option<SplitResult> {
        let full = {
            let mut page = self.pager.acquire(page_id);

            // Exactly one reference to the old page exists: either the
            // right pointer or a single slot's child id, never both.
            if page.right_pointer() == Some(split.old_page_id) {
                page.set_right_pointer(Some(split.right_id));
            } else {
                let idx = (0..page.record_count())
                    .find(|&i| child_id(page.value_by_index(i)) == split.old_page_id)
                    .unwrap_or_else(|| {
                        panic!(
                            "page {} split but parent {} does not reference it",
                            split.old_page_id.0, page_id.0
                        )
                    });
                let separator = page.key_by_index(idx).to_vec();
                page.update_value(&separator, &child_id_bytes(split.right_id))
                    .expect("separator child rewrite cannot change size");
            }

            match page.insert_record(&split.promoted_key, &child_id_bytes(split.left_id)) {
                Ok(()) => false,
                Err(PageError::PageFull { .. }) => true,
                Err(PageError::DuplicateKey) => panic!(
                    "promoted key already present in parent page {}",
                    page_id.0
                ),
                Err(err) => panic!("unexpected error updating parent page {}: {err}", page_id.0),
            }
        };

        if full {
            Some(self.split_internal(page_id, split))
        } else {
            None
        }
    }

    /// Splits a full internal page. The mid key moves up, excluded from
    /// both halves; its child id becomes the left half's right pointer
    /// and the old right pointer moves to the right half.
    fn split_internal(&mut self, page_id: PageId, pending: SplitResult) -> SplitResult {
        let (promoted_key, mut left_records, mut right_records, mid_child, old_right) = {
            let page = self.pager.acquire(page_id);
            let count = page.record_count();
            let mid = count / 2;
            (
                page.key_by_index(mid).to_vec(),
                page.extract_records(0, mid),
                page.extract_records(mid + 1, count),
                child_id(page.value_by_index(mid)),
                page.right_pointer(),
            )
        };

        left_records.right_pointer = mid_child;
        right_records.right_pointer = old_right.expect("split internal page has no right pointer");

        let (left_id, _) =
            self.pager
                .allocate_from_records(PageType::Internal, self.key_type, &left_records);
        let (right_id, _) =
            self.pager
                .allocate_from_records(PageType::Internal, self.key_type, &right_records);

        let target = if pending.promoted_key >= promoted_key {
            right_id
        } else {
            left_id
        };
        self.pager
            .acquire(target)
            .insert_record(&pending.promoted_key, &child_id_bytes(pending.left_id))
            .expect("freshly split internal page must accept the separator");

        self.pager.free(page_id);
        trace!(
            old = page_id.0,
            left = left_id.0,
            right = right_id.0,
            "internal split"
        );

        SplitResult {
            promoted_key,
            left_id,
            right_id,
            old_page_id: page_id,
        }
    }
}

/// Picks the child to follow for `key` in an internal page. Equal keys go
/// right: a separator is the smallest key of its right subtree, so an
/// exact match descends into the child after the matching slot.
fn choose_child(page: &Page, key: &[u8]) -> PageId {
    let (i, found) = page.search_key(key);
    let idx = if found { i + 1 } else { i };
    if idx == page.record_count() {
        page.right_pointer()
            .expect("internal page has no right pointer")
    } else {
        child_id(page.value_by_index(idx))
    }
}

fn child_id(bytes: &[u8]) -> PageId {
    PageId(u32::from_be_bytes(
        bytes.try_into().expect("child pointer must be 4 bytes"),
    ))
}

fn child_id_bytes(id: PageId) -> [u8; 4] {
    id.0.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(n: u32) -> [u8; 4] {
        n.to_be_bytes()
    }

    fn int_value(n: u32) -> [u8; 16] {
        let mut value = [0u8; 16];
        for chunk in value.chunks_exact_mut(4) {
            chunk.copy_from_slice(&n.to_be_bytes());
        }
        value
    }

    /// Walks the leaf chain forward, checking both link directions and
    /// the termini, and returns the visited page ids.
    fn leaf_chain(tree: &mut BTree) -> Vec<PageId> {
        let mut ids = Vec::new();
        let mut prev = None;
        let mut current = Some(tree.first_leaf_id);
        while let Some(id) = current {
            let page = tree.pager.acquire(id);
            assert_eq!(page.page_type(), PageType::Leaf);
            assert_eq!(page.prev_leaf(), prev, "broken back link at page {}", id.0);
            ids.push(id);
            prev = Some(id);
            current = page.next_leaf();
        }
        assert_eq!(prev, Some(tree.last_leaf_id));
        ids
    }

    /// All keys of the leaf chain in forward order, asserted strictly
    /// ascending.
    fn leaf_chain_keys(tree: &mut BTree) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for id in leaf_chain(tree) {
            let page = tree.pager.acquire(id);
            for i in 0..page.record_count() {
                let key = page.key_by_index(i).to_vec();
                if let Some(last) = keys.last() {
                    assert!(last < &key, "leaf chain keys out of order");
                }
                keys.push(key);
            }
        }
        keys
    }

    #[test]
    fn empty_tree() {
        let mut tree = BTree::new(KeyType::Int);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.search(&int_key(1)), None);
        assert_eq!(leaf_chain(&mut tree).len(), 1);
    }

    #[test]
    fn insert_and_search_single_record() {
        let mut tree = BTree::new(KeyType::Int);
        tree.insert(&int_key(5), b"abc").unwrap();
        assert_eq!(tree.search(&int_key(5)), Some(b"abc".to_vec()));
        assert_eq!(tree.search(&int_key(6)), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = BTree::new(KeyType::Int);
        tree.insert(&int_key(1), b"first").unwrap();
        assert_eq!(
            tree.insert(&int_key(1), b"second"),
            Err(BTreeError::DuplicateKey)
        );
        assert_eq!(tree.search(&int_key(1)), Some(b"first".to_vec()));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut tree = BTree::new(KeyType::Int);
        let value = vec![0u8; MAX_RECORD_PAYLOAD + 1];
        assert_eq!(
            tree.insert(b"", &value),
            Err(BTreeError::RecordTooLarge {
                size: MAX_RECORD_PAYLOAD + 1
            })
        );

        // A record that exactly fills an empty page is accepted.
        let value = vec![0u8; MAX_RECORD_PAYLOAD - 4];
        tree.insert(&int_key(1), &value).unwrap();
        assert_eq!(tree.search(&int_key(1)), Some(value));
    }

    #[test]
    fn leaf_split_links_two_leaves() {
        let mut tree = BTree::new(KeyType::Int);
        // 4-byte keys with 16-byte values cost 28 bytes each, so a page
        // holds 290 of them; one more forces the first split.
        for n in 0..291 {
            tree.insert(&int_key(n), &int_value(n)).unwrap();
        }

        assert_eq!(tree.height(), 2);
        let chain = leaf_chain(&mut tree);
        assert_eq!(chain.len(), 2);
        assert_ne!(tree.first_leaf_id, tree.last_leaf_id);

        for n in 0..291 {
            assert_eq!(tree.search(&int_key(n)), Some(int_value(n).to_vec()));
        }
        assert_eq!(leaf_chain_keys(&mut tree).len(), 291);
    }

    #[test]
    fn sequential_inserts_keep_chain_sorted() {
        let mut tree = BTree::new(KeyType::Int);
        for n in 0..2000 {
            tree.insert(&int_key(n), &int_value(n)).unwrap();
        }

        let keys = leaf_chain_keys(&mut tree);
        assert_eq!(keys.len(), 2000);
        for (n, key) in keys.iter().enumerate() {
            assert_eq!(key.as_slice(), &int_key(n as u32)[..]);
        }
        for n in (0..2000).step_by(97) {
            assert_eq!(tree.search(&int_key(n)), Some(int_value(n).to_vec()));
        }
    }

    #[test]
    fn random_inserts_build_a_consistent_tree() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut tree = BTree::new(KeyType::Int);
        let mut rng = StdRng::seed_from_u64(7);
        let mut inserted = Vec::new();
        let mut duplicates = 0;
        for _ in 0..20_000 {
            let n = rng.gen::<u32>();
            match tree.insert(&int_key(n), &int_value(n)) {
                Ok(()) => inserted.push(n),
                Err(BTreeError::DuplicateKey) => duplicates += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        assert!(tree.height() >= 2);
        let keys = leaf_chain_keys(&mut tree);
        assert_eq!(keys.len(), inserted.len());
        assert_eq!(inserted.len() + duplicates, 20_000);

        inserted.sort_unstable();
        for (n, key) in inserted.iter().zip(&keys) {
            assert_eq!(key.as_slice(), &int_key(*n)[..]);
        }
        for n in inserted.iter().step_by(257) {
            assert_eq!(tree.search(&int_key(*n)), Some(int_value(*n).to_vec()));
        }
    }

    #[test]
    fn descent_takes_the_right_child_on_separator_match() {
        let mut tree = BTree::new(KeyType::Int);
        for n in 0..600 {
            tree.insert(&int_key(n), &int_value(n)).unwrap();
        }
        assert!(tree.height() >= 2);

        // Every separator key in the root must still be findable: an
        // exact match on a separator descends right, where the leaf copy
        // lives.
        let separators: Vec<Vec<u8>> = {
            let root = tree.pager.acquire(tree.root_id);
            (0..root.record_count())
                .map(|i| root.key_by_index(i).to_vec())
                .collect()
        };
        assert!(!separators.is_empty());
        for separator in separators {
            assert!(tree.search(&separator).is_some());
        }
    }
}
