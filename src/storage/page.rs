//! Slotted-page record container.
//!
//! A page is a fixed 8 KiB buffer with a 64-byte header, a slot directory
//! growing upward from the header, and a cell heap growing downward from
//! the end of the page. Slots are kept sorted by their cells' keys; cells
//! are append-only and deleted cells are orphaned until compaction.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{PageError, PAGE_SIZE};

/// Size of the fixed page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 64;

// Header field offsets. All multi-byte fields are big-endian.
const PAGE_ID_OFFSET: usize = 0; // u32
const SLOT_COUNT_OFFSET: usize = 4; // u16
const SLOT_ALLOC_OFFSET: usize = 6; // u16, first free byte above the slot directory
const CELL_ALLOC_OFFSET: usize = 8; // u16, first used byte of the cell heap
const FREE_SPACE_OFFSET: usize = 10; // u16, contiguous + reclaimable bytes
const PAGE_TYPE_OFFSET: usize = 12; // u8
const KEY_TYPE_OFFSET: usize = 13; // u8
const CHECKSUM_OFFSET: usize = 14; // u32, CRC-32 computed with this field zeroed
const RIGHT_POINTER_OFFSET: usize = 18; // u32, 0 = none
const PREV_LEAF_OFFSET: usize = 22; // u32, 0 = none
const NEXT_LEAF_OFFSET: usize = 26; // u32, 0 = none
// Bytes 30..64 are reserved and stay zero.

/// Size of a slot directory entry: cell offset (u16) and cell length (u16).
pub const SLOT_SIZE: usize = 4;
const SLOT_LENGTH_OFFSET: usize = 2;

/// Size of a cell header: key size (u16) and value size (u16).
pub const CELL_HEADER_SIZE: usize = 4;
const CELL_VALUE_SIZE_OFFSET: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Internal = 1,
    Leaf = 2,
}

impl PageType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Internal,
            2 => PageType::Leaf,
            _ => panic!("invalid page type: {value}"),
        }
    }
}

/// Advisory key encoding tag. The page itself always compares keys as raw
/// byte strings; this tag is metadata for higher layers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int = 1,
    String = 2,
}

impl KeyType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => KeyType::Int,
            2 => KeyType::String,
            _ => panic!("invalid key type: {value}"),
        }
    }
}

/// Byte-level snapshot of a page's live records, suitable for
/// [`Page::from_records`]. `slots` is the slot directory verbatim and
/// `cells` is the cell heap verbatim; the cells are always contiguous
/// (no orphans) and the slot offsets already point at them.
#[derive(Debug, Clone)]
pub struct PageRecords {
    pub slots: Vec<u8>,
    pub cells: Vec<u8>,
    /// Rightmost child pointer carried along for internal pages; the null
    /// id when not applicable.
    pub right_pointer: PageId,
}

#[derive(Clone)]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Constructs an empty page with an initialized header.
    pub fn new(page_id: PageId, page_type: PageType, key_type: KeyType) -> Self {
        let mut page = Self {
            data: [0; PAGE_SIZE],
        };
        page.write_u32(PAGE_ID_OFFSET, page_id.0);
        page.write_u16(SLOT_ALLOC_OFFSET, PAGE_HEADER_SIZE as u16);
        page.write_u16(CELL_ALLOC_OFFSET, PAGE_SIZE as u16);
        page.write_u16(FREE_SPACE_OFFSET, (PAGE_SIZE - PAGE_HEADER_SIZE) as u16);
        page.data[PAGE_TYPE_OFFSET] = page_type as u8;
        page.data[KEY_TYPE_OFFSET] = key_type as u8;
        page
    }

    /// Rebuilds a page from a byte-level snapshot. The caller guarantees
    /// the slot directory is sorted and well-formed and the cells are
    /// contiguous. Used when splitting a page into fresh halves.
    pub fn from_records(
        page_id: PageId,
        page_type: PageType,
        key_type: KeyType,
        records: &PageRecords,
    ) -> Self {
        debug_assert_eq!(records.slots.len() % SLOT_SIZE, 0);
        let slot_alloc = PAGE_HEADER_SIZE + records.slots.len();
        let cell_alloc = PAGE_SIZE - records.cells.len();
        debug_assert!(slot_alloc <= cell_alloc);

        let mut page = Self::new(page_id, page_type, key_type);
        page.data[PAGE_HEADER_SIZE..slot_alloc].copy_from_slice(&records.slots);
        page.data[cell_alloc..].copy_from_slice(&records.cells);
        page.write_u16(SLOT_COUNT_OFFSET, (records.slots.len() / SLOT_SIZE) as u16);
        page.write_u16(SLOT_ALLOC_OFFSET, slot_alloc as u16);
        page.write_u16(CELL_ALLOC_OFFSET, cell_alloc as u16);
        page.write_u16(FREE_SPACE_OFFSET, (cell_alloc - slot_alloc) as u16);
        page.write_u32(RIGHT_POINTER_OFFSET, records.right_pointer.0);
        page
    }

    /// Returns a byte-exact snapshot of the page's live contents. Compacts
    /// the cell heap first so the snapshot meets the no-orphan contract of
    /// [`Page::from_records`].
    pub fn records(&mut self) -> PageRecords {
        self.compact_cells();
        PageRecords {
            slots: self.data[PAGE_HEADER_SIZE..self.slot_alloc()].to_vec(),
            cells: self.data[self.cell_alloc()..].to_vec(),
            right_pointer: PageId(self.read_u32(RIGHT_POINTER_OFFSET)),
        }
    }

    /// Returns a snapshot containing only slots `[lo, hi)` with their
    /// cells packed against the end of the page. The source page is left
    /// untouched; the snapshot's right pointer is the null id.
    pub fn extract_records(&self, lo: usize, hi: usize) -> PageRecords {
        let count = self.record_count();
        assert!(
            lo <= hi && hi <= count,
            "slot range [{lo}, {hi}) out of bounds [0, {count})"
        );

        let mut cells = Vec::new();
        let mut sizes = Vec::with_capacity(hi - lo);
        for i in lo..hi {
            let cell = self.cell(i);
            cells.extend_from_slice(cell);
            sizes.push(cell.len());
        }

        let mut slots = Vec::with_capacity((hi - lo) * SLOT_SIZE);
        let mut offset = PAGE_SIZE - cells.len();
        for size in sizes {
            slots.extend_from_slice(&(offset as u16).to_be_bytes());
            slots.extend_from_slice(&(size as u16).to_be_bytes());
            offset += size;
        }

        PageRecords {
            slots,
            cells,
            right_pointer: PageId(0),
        }
    }

    /// Inserts a record keeping the slot directory sorted. Compacts the
    /// cell heap first when the contiguous hole is too small but the total
    /// free space suffices.
    pub fn insert_record(&mut self, key: &[u8], value: &[u8]) -> Result<(), PageError> {
        let (idx, found) = self.search_key(key);
        if found {
            return Err(PageError::DuplicateKey);
        }

        let cell_size = CELL_HEADER_SIZE + key.len() + value.len();
        let required = SLOT_SIZE + cell_size;
        if required > self.free_space() {
            return Err(PageError::PageFull {
                required,
                available: self.free_space(),
            });
        }
        if required > self.contiguous_free_space() {
            self.compact_cells();
        }

        let cell_offset = self.write_cell(key, value);
        self.insert_slot(idx, cell_offset, cell_size as u16);
        Ok(())
    }

    /// Deletes the record for `key`, returning whether it was present. The
    /// slot is removed immediately; the cell is orphaned and reclaimed at
    /// the next compaction.
    pub fn delete_record(&mut self, key: &[u8]) -> bool {
        let (idx, found) = self.search_key(key);
        if !found {
            return false;
        }

        let cell_size = self.cell_length(idx);
        let slot_offset = PAGE_HEADER_SIZE + idx * SLOT_SIZE;
        let slot_alloc = self.slot_alloc();
        if slot_offset + SLOT_SIZE < slot_alloc {
            self.data
                .copy_within(slot_offset + SLOT_SIZE..slot_alloc, slot_offset);
        }

        self.write_u16(SLOT_COUNT_OFFSET, (self.record_count() - 1) as u16);
        self.write_u16(SLOT_ALLOC_OFFSET, (slot_alloc - SLOT_SIZE) as u16);
        self.write_u16(
            FREE_SPACE_OFFSET,
            (self.free_space() + SLOT_SIZE + cell_size) as u16,
        );
        true
    }

    /// Rewrites the value of an existing record. Same-size values are
    /// rewritten in place (the child-pointer case); a size change goes
    /// through delete and reinsert.
    pub fn update_value(&mut self, key: &[u8], value: &[u8]) -> Result<(), PageError> {
        let (idx, found) = self.search_key(key);
        if !found {
            return Err(PageError::KeyNotFound);
        }

        let cell_offset = self.cell_offset(idx);
        let key_size = self.read_u16(cell_offset) as usize;
        let value_size = self.read_u16(cell_offset + CELL_VALUE_SIZE_OFFSET) as usize;
        if value.len() == value_size {
            let value_offset = cell_offset + CELL_HEADER_SIZE + key_size;
            self.data[value_offset..value_offset + value_size].copy_from_slice(value);
            return Ok(());
        }

        self.delete_record(key);
        self.insert_record(key, value)
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let (idx, found) = self.search_key(key);
        if found {
            Some(self.value_by_index(idx))
        } else {
            None
        }
    }

    /// Half-open binary search over the slot directory. Returns the slot
    /// index and whether the key was found; when not found the index is
    /// the insertion point.
    pub fn search_key(&self, key: &[u8]) -> (usize, bool) {
        let mut left = 0;
        let mut right = self.record_count();
        while left < right {
            let mid = left + (right - left) / 2;
            match key.cmp(self.key_by_index(mid)) {
                Ordering::Equal => return (mid, true),
                Ordering::Greater => left = mid + 1,
                Ordering::Less => right = mid,
            }
        }
        (left, false)
    }

    pub fn key_by_index(&self, idx: usize) -> &[u8] {
        self.check_slot_index(idx);
        let cell_offset = self.cell_offset(idx);
        let key_size = self.read_u16(cell_offset) as usize;
        &self.data[cell_offset + CELL_HEADER_SIZE..cell_offset + CELL_HEADER_SIZE + key_size]
    }

    pub fn value_by_index(&self, idx: usize) -> &[u8] {
        self.check_slot_index(idx);
        let cell_offset = self.cell_offset(idx);
        let key_size = self.read_u16(cell_offset) as usize;
        let value_size = self.read_u16(cell_offset + CELL_VALUE_SIZE_OFFSET) as usize;
        let value_offset = cell_offset + CELL_HEADER_SIZE + key_size;
        &self.data[value_offset..value_offset + value_size]
    }

    pub fn record_count(&self) -> usize {
        self.read_u16(SLOT_COUNT_OFFSET) as usize
    }

    pub fn page_id(&self) -> PageId {
        PageId(self.read_u32(PAGE_ID_OFFSET))
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.data[PAGE_TYPE_OFFSET])
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::from_u8(self.data[KEY_TYPE_OFFSET])
    }

    /// Total free space: the contiguous hole plus orphaned cell bytes.
    pub fn free_space(&self) -> usize {
        self.read_u16(FREE_SPACE_OFFSET) as usize
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub fn right_pointer(&self) -> Option<PageId> {
        Self::pointer_from(self.read_u32(RIGHT_POINTER_OFFSET))
    }

    pub fn set_right_pointer(&mut self, id: Option<PageId>) {
        self.write_u32(RIGHT_POINTER_OFFSET, id.map_or(0, |id| id.0));
    }

    pub fn prev_leaf(&self) -> Option<PageId> {
        Self::pointer_from(self.read_u32(PREV_LEAF_OFFSET))
    }

    pub fn set_prev_leaf(&mut self, id: Option<PageId>) {
        self.write_u32(PREV_LEAF_OFFSET, id.map_or(0, |id| id.0));
    }

    pub fn next_leaf(&self) -> Option<PageId> {
        Self::pointer_from(self.read_u32(NEXT_LEAF_OFFSET))
    }

    pub fn set_next_leaf(&mut self, id: Option<PageId>) {
        self.write_u32(NEXT_LEAF_OFFSET, id.map_or(0, |id| id.0));
    }

    /// Stamps the page checksum. Boundary operation: the inner write path
    /// never maintains it.
    pub fn set_checksum(&mut self) {
        let checksum = self.calculate_checksum();
        self.write_u32(CHECKSUM_OFFSET, checksum);
    }

    pub fn verify_checksum(&self) -> bool {
        self.read_u32(CHECKSUM_OFFSET) == self.calculate_checksum()
    }

    /// CRC-32 (IEEE) over the page with the checksum field treated as
    /// zeroed.
    fn calculate_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    fn pointer_from(raw: u32) -> Option<PageId> {
        if raw == 0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    fn slot_alloc(&self) -> usize {
        self.read_u16(SLOT_ALLOC_OFFSET) as usize
    }

    fn cell_alloc(&self) -> usize {
        self.read_u16(CELL_ALLOC_OFFSET) as usize
    }

    /// Free bytes between the slot directory and the cell heap.
    fn contiguous_free_space(&self) -> usize {
        self.cell_alloc() - self.slot_alloc()
    }

    fn check_slot_index(&self, idx: usize) {
        let count = self.record_count();
        assert!(idx < count, "slot index {idx} out of bounds [0, {count})");
    }

    fn cell_offset(&self, idx: usize) -> usize {
        self.read_u16(PAGE_HEADER_SIZE + idx * SLOT_SIZE) as usize
    }

    fn cell_length(&self, idx: usize) -> usize {
        self.read_u16(PAGE_HEADER_SIZE + idx * SLOT_SIZE + SLOT_LENGTH_OFFSET) as usize
    }

    /// The entire cell (header + key + value) at the given slot.
    fn cell(&self, idx: usize) -> &[u8] {
        let offset = self.cell_offset(idx);
        &self.data[offset..offset + self.cell_length(idx)]
    }

    /// Appends a cell to the heap and returns its offset.
    fn write_cell(&mut self, key: &[u8], value: &[u8]) -> u16 {
        let cell_size = CELL_HEADER_SIZE + key.len() + value.len();
        let offset = self.cell_alloc() - cell_size;

        self.write_u16(offset, key.len() as u16);
        self.write_u16(offset + CELL_VALUE_SIZE_OFFSET, value.len() as u16);
        self.data[offset + CELL_HEADER_SIZE..offset + CELL_HEADER_SIZE + key.len()]
            .copy_from_slice(key);
        self.data[offset + CELL_HEADER_SIZE + key.len()..offset + cell_size]
            .copy_from_slice(value);

        self.write_u16(CELL_ALLOC_OFFSET, offset as u16);
        self.write_u16(FREE_SPACE_OFFSET, (self.free_space() - cell_size) as u16);
        offset as u16
    }

    /// Inserts a slot at `idx`, shifting later slots right.
    fn insert_slot(&mut self, idx: usize, cell_offset: u16, cell_length: u16) {
        let count = self.record_count();
        debug_assert!(idx <= count);

        let slot_offset = PAGE_HEADER_SIZE + idx * SLOT_SIZE;
        let slot_alloc = self.slot_alloc();
        if idx < count {
            self.data
                .copy_within(slot_offset..slot_alloc, slot_offset + SLOT_SIZE);
        }

        self.data[slot_offset..slot_offset + SLOT_LENGTH_OFFSET]
            .copy_from_slice(&cell_offset.to_be_bytes());
        self.data[slot_offset + SLOT_LENGTH_OFFSET..slot_offset + SLOT_SIZE]
            .copy_from_slice(&cell_length.to_be_bytes());

        self.write_u16(SLOT_COUNT_OFFSET, (count + 1) as u16);
        self.write_u16(SLOT_ALLOC_OFFSET, (slot_alloc + SLOT_SIZE) as u16);
        self.write_u16(FREE_SPACE_OFFSET, (self.free_space() - SLOT_SIZE) as u16);
    }

    /// Packs the live cells contiguously against the end of the page and
    /// rewrites every slot offset, reclaiming orphaned cells.
    fn compact_cells(&mut self) {
        let count = self.record_count();
        let mut cells = Vec::new();
        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let cell = self.cell(i);
            cells.extend_from_slice(cell);
            sizes.push(cell.len());
        }

        let start = PAGE_SIZE - cells.len();
        let mut offset = start;
        for (i, size) in sizes.into_iter().enumerate() {
            self.write_u16(PAGE_HEADER_SIZE + i * SLOT_SIZE, offset as u16);
            offset += size;
        }

        self.data[start..].copy_from_slice(&cells);
        self.write_u16(CELL_ALLOC_OFFSET, start as u16);
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }
}
