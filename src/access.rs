pub mod btree;

pub use btree::{BTree, BTreeError, Record};
