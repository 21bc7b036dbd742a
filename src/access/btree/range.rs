//! Bidirectional range scans over the leaf chain.

use crate::access::btree::BTree;

/// An owned key/value pair produced by a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BTree {
    /// Returns the records with `from <= key < to` in ascending key
    /// order. An absent bound is unbounded.
    pub fn ascending_range(&mut self, from: Option<&[u8]>, to: Option<&[u8]>) -> Vec<Record> {
        let mut records = Vec::new();

        let (mut page_id, mut slot) = match from {
            Some(from) => {
                let leaf_id = self.find_leaf(from);
                // The insertion point is the first key >= from.
                let (idx, _) = self.pager.acquire(leaf_id).search_key(from);
                (leaf_id, idx)
            }
            None => (self.first_leaf_id, 0),
        };

        loop {
            let page = self.pager.acquire(page_id);
            while slot < page.record_count() {
                let key = page.key_by_index(slot);
                if let Some(to) = to {
                    if key >= to {
                        return records;
                    }
                }
                records.push(Record {
                    key: key.to_vec(),
                    value: page.value_by_index(slot).to_vec(),
                });
                slot += 1;
            }
            match page.next_leaf() {
                Some(next_id) => {
                    page_id = next_id;
                    slot = 0;
                }
                None => return records,
            }
        }
    }

    /// Returns the records with `to < key <= from` in descending key
    /// order. An absent bound is unbounded.
    pub fn descending_range(&mut self, from: Option<&[u8]>, to: Option<&[u8]>) -> Vec<Record> {
        let mut records = Vec::new();

        let (mut page_id, mut slot) = match from {
            Some(from) => {
                let leaf_id = self.find_leaf(from);
                let (idx, found) = self.pager.acquire(leaf_id).search_key(from);
                if found {
                    (leaf_id, idx)
                } else if idx > 0 {
                    // Not present: step one slot backward from the
                    // insertion point.
                    (leaf_id, idx - 1)
                } else {
                    // Every key in this leaf is greater than `from`.
                    let prev = self.pager.acquire(leaf_id).prev_leaf();
                    match prev {
                        Some(prev_id) => {
                            let count = self.pager.acquire(prev_id).record_count();
                            (prev_id, count - 1)
                        }
                        None => return records,
                    }
                }
            }
            None => {
                let count = self.pager.acquire(self.last_leaf_id).record_count();
                if count == 0 {
                    return records;
                }
                (self.last_leaf_id, count - 1)
            }
        };

        loop {
            let page = self.pager.acquire(page_id);
            loop {
                let key = page.key_by_index(slot);
                if let Some(to) = to {
                    if key <= to {
                        return records;
                    }
                }
                records.push(Record {
                    key: key.to_vec(),
                    value: page.value_by_index(slot).to_vec(),
                });
                if slot == 0 {
                    break;
                }
                slot -= 1;
            }
            let prev = page.prev_leaf();
            drop(page);
            match prev {
                Some(prev_id) => {
                    page_id = prev_id;
                    slot = self.pager.acquire(page_id).record_count() - 1;
                }
                None => return records,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::KeyType;

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

    fn record(n: u32) -> Record {
        Record {
            key: int_key(n).to_vec(),
            value: int_value(n).to_vec(),
        }
    }

    /// The range test seed: five alternating keys.
    fn odd_keys_tree() -> BTree {
        let mut tree = BTree::new(KeyType::Int);
        for n in [1, 3, 5, 7, 9] {
            tree.insert(&int_key(n), &int_value(n)).unwrap();
        }
        tree
    }

    #[test]
    fn ranges_on_an_empty_tree_are_empty() {
        let mut tree = BTree::new(KeyType::Int);
        assert_eq!(tree.ascending_range(None, None), vec![]);
        assert_eq!(tree.descending_range(None, None), vec![]);
        assert_eq!(tree.ascending_range(Some(&int_key(1)), None), vec![]);
        assert_eq!(tree.descending_range(Some(&int_key(1)), None), vec![]);
    }

    #[test]
    fn ascending_with_absent_lower_bound() {
        let mut tree = odd_keys_tree();
        let got = tree.ascending_range(None, Some(&int_key(5)));
        assert_eq!(got, vec![record(1), record(3)]);
    }

    #[test]
    fn ascending_with_absent_upper_bound() {
        let mut tree = odd_keys_tree();
        let got = tree.ascending_range(Some(&int_key(5)), None);
        assert_eq!(got, vec![record(5), record(7), record(9)]);
    }

    #[test]
    fn ascending_with_both_bounds_present() {
        let mut tree = odd_keys_tree();
        let got = tree.ascending_range(Some(&int_key(3)), Some(&int_key(7)));
        assert_eq!(got, vec![record(3), record(5)]);
    }

    #[test]
    fn ascending_with_missing_bounds() {
        let mut tree = odd_keys_tree();
        let got = tree.ascending_range(Some(&int_key(4)), Some(&int_key(8)));
        assert_eq!(got, vec![record(5), record(7)]);

        let got = tree.ascending_range(Some(&int_key(3)), Some(&int_key(6)));
        assert_eq!(got, vec![record(3), record(5)]);
    }

    #[test]
    fn ascending_full_scan() {
        let mut tree = odd_keys_tree();
        let got = tree.ascending_range(None, None);
        assert_eq!(
            got,
            vec![record(1), record(3), record(5), record(7), record(9)]
        );
    }

    #[test]
    fn ascending_with_equal_bounds_is_empty() {
        let mut tree = odd_keys_tree();
        assert_eq!(
            tree.ascending_range(Some(&int_key(5)), Some(&int_key(5))),
            vec![]
        );
    }

    #[test]
    fn ascending_past_the_largest_key_is_empty() {
        let mut tree = odd_keys_tree();
        assert_eq!(tree.ascending_range(Some(&int_key(10)), None), vec![]);
    }

    #[test]
    fn descending_with_absent_upper_bound() {
        let mut tree = odd_keys_tree();
        let got = tree.descending_range(None, Some(&int_key(5)));
        assert_eq!(got, vec![record(9), record(7)]);
    }

    #[test]
    fn descending_with_absent_lower_bound() {
        let mut tree = odd_keys_tree();
        let got = tree.descending_range(Some(&int_key(5)), None);
        assert_eq!(got, vec![record(5), record(3), record(1)]);
    }

    #[test]
    fn descending_with_both_bounds_present() {
        let mut tree = odd_keys_tree();
        let got = tree.descending_range(Some(&int_key(7)), Some(&int_key(3)));
        assert_eq!(got, vec![record(7), record(5)]);
    }

    #[test]
    fn descending_with_missing_bounds() {
        let mut tree = odd_keys_tree();
        let got = tree.descending_range(Some(&int_key(8)), Some(&int_key(2)));
        assert_eq!(got, vec![record(7), record(5), record(3)]);

        let got = tree.descending_range(Some(&int_key(7)), Some(&int_key(4)));
        assert_eq!(got, vec![record(7), record(5)]);
    }

    #[test]
    fn descending_full_scan() {
        let mut tree = odd_keys_tree();
        let got = tree.descending_range(None, None);
        assert_eq!(
            got,
            vec![record(9), record(7), record(5), record(3), record(1)]
        );
    }

    #[test]
    fn descending_below_the_smallest_key_is_empty() {
        let mut tree = odd_keys_tree();
        assert_eq!(tree.descending_range(Some(&int_key(0)), None), vec![]);
    }

    #[test]
    fn ranges_cross_leaf_boundaries() {
        let mut tree = BTree::new(KeyType::Int);
        for n in 0..1000 {
            tree.insert(&int_key(n), &int_value(n)).unwrap();
        }
        assert!(tree.height() >= 2);

        let ascending = tree.ascending_range(Some(&int_key(100)), Some(&int_key(900)));
        assert_eq!(ascending.len(), 800);
        assert_eq!(ascending.first(), Some(&record(100)));
        assert_eq!(ascending.last(), Some(&record(899)));

        let descending = tree.descending_range(Some(&int_key(899)), Some(&int_key(99)));
        assert_eq!(descending.len(), 800);
        assert_eq!(descending.first(), Some(&record(899)));
        assert_eq!(descending.last(), Some(&record(100)));

        let reversed: Vec<_> = descending.into_iter().rev().collect();
        assert_eq!(reversed, ascending);
    }
}
