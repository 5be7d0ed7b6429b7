use std::cell::RefCell;
use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::rc::Rc;

use log::debug;
use lru::LruCache;

use crate::chunk::ChunkStream;
use crate::error::{Error, Result};
use crate::structures::*;

const NODE_CACHE_SIZE: usize = 8192;

/// Compare an on-disk key against a query prefix. `None` fields are
/// wildcards and compare equal.
pub fn cmp_key(
    key: &btrfs_disk_key,
    objectid: Option<u64>,
    item_type: Option<u8>,
    offset: Option<u64>,
) -> Ordering {
    if let Some(objectid) = objectid {
        match key.objectid.cmp(&objectid) {
            Ordering::Equal => {}
            order => return order,
        }
    }
    if let Some(item_type) = item_type {
        match key.item_type.cmp(&item_type) {
            Ordering::Equal => {}
            order => return order,
        }
    }
    if let Some(offset) = offset {
        match key.offset.cmp(&offset) {
            Ordering::Equal => {}
            order => return order,
        }
    }
    Ordering::Equal
}

/// A decoded tree node: the raw block plus its parsed header. Keys, branch
/// pointers and leaf items are decoded out of `data` on demand.
#[derive(Debug)]
pub(crate) struct Node {
    data: Vec<u8>,
    pub header: btrfs_header,
}

impl Node {
    fn stride(&self) -> usize {
        if self.header.level > 0 {
            BTRFS_KEY_PTR_SIZE
        } else {
            BTRFS_ITEM_SIZE
        }
    }

    fn slot(&self, index: u32, len: usize) -> Result<&[u8]> {
        if index >= self.header.nritems {
            return Err(Error::Invalid(format!(
                "item index {index} out of range ({} items)",
                self.header.nritems
            )));
        }
        let offset = BTRFS_HEADER_SIZE + self.stride() * index as usize;
        self.data.get(offset..offset + len).ok_or_else(|| {
            Error::Invalid(format!("node at {:#x} too small for its items", self.header.bytenr))
        })
    }

    fn key_at(&self, index: u32) -> Result<btrfs_disk_key> {
        btrfs_disk_key::parse(self.slot(index, BTRFS_DISK_KEY_SIZE)?)
    }

    fn item_at(&self, index: u32) -> Result<btrfs_item> {
        btrfs_item::parse(self.slot(index, BTRFS_ITEM_SIZE)?)
    }

    fn key_ptr_at(&self, index: u32) -> Result<btrfs_key_ptr> {
        btrfs_key_ptr::parse(self.slot(index, BTRFS_KEY_PTR_SIZE)?)
    }

    /// The data area of a leaf item. Item offsets count from the end of the
    /// node header.
    fn item_data(&self, item: &btrfs_item) -> Result<&[u8]> {
        let offset = BTRFS_HEADER_SIZE + item.offset as usize;
        self.data.get(offset..offset + item.size as usize).ok_or_else(|| {
            Error::Invalid(format!(
                "item data {}+{} escapes node at {:#x}",
                item.offset, item.size, self.header.bytenr
            ))
        })
    }
}

/// A Btrfs B-tree, rooted either directly at a node address (chunk and root
/// trees) or at a `root_item` from the root tree (everything else).
///
/// Cloning is cheap and shares the node cache.
#[derive(Clone, Debug)]
pub struct BTree {
    stream: Rc<ChunkStream>,
    node_size: u32,
    root_offset: u64,
    root_item: Option<Rc<btrfs_root_item>>,
    nodes: Rc<RefCell<LruCache<u64, Rc<Node>>>>,
}

impl BTree {
    pub fn from_offset(stream: Rc<ChunkStream>, node_size: u32, root_offset: u64) -> Self {
        BTree {
            stream,
            node_size,
            root_offset,
            root_item: None,
            nodes: Rc::new(RefCell::new(LruCache::new(
                NonZeroUsize::new(NODE_CACHE_SIZE).unwrap(),
            ))),
        }
    }

    pub fn from_root_item(stream: Rc<ChunkStream>, node_size: u32, item: btrfs_root_item) -> Self {
        let root_offset = item.bytenr;
        BTree {
            stream,
            node_size,
            root_offset,
            root_item: Some(Rc::new(item)),
            nodes: Rc::new(RefCell::new(LruCache::new(
                NonZeroUsize::new(NODE_CACHE_SIZE).unwrap(),
            ))),
        }
    }

    pub fn root_item(&self) -> Option<&btrfs_root_item> {
        self.root_item.as_deref()
    }

    /// A new cursor positioned nowhere; the first operation descends from
    /// the root.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            btree: self.clone(),
            frames: Vec::new(),
        }
    }

    /// Search for exactly one item. The key must match the query in every
    /// non-wildcard field or the lookup fails with `NotFound`.
    pub fn find(
        &self,
        objectid: Option<u64>,
        item_type: Option<u8>,
        offset: Option<u64>,
    ) -> Result<(btrfs_item, Vec<u8>)> {
        let mut cursor = self.cursor();
        if !cursor.search(objectid, item_type, offset)? {
            return Err(Error::NotFound(format!(
                "no item with key ({objectid:?}, {item_type:?}, {offset:?})"
            )));
        }
        let (item, data) = cursor.get()?;
        if cmp_key(&item.key, objectid, item_type, offset) != Ordering::Equal {
            return Err(Error::NotFound(format!(
                "no item with key ({objectid:?}, {item_type:?}, {offset:?})"
            )));
        }
        Ok((item, data))
    }

    fn read_node(&self, address: u64) -> Result<Rc<Node>> {
        if let Some(node) = self.nodes.borrow_mut().get(&address) {
            return Ok(Rc::clone(node));
        }

        debug!("read node at {address:#x}");
        let data = self.stream.read_exact_at(address, self.node_size as usize)?;
        let header = btrfs_header::parse(&data)?;
        if header.bytenr != address {
            return Err(Error::Invalid(format!(
                "node at {address:#x} claims bytenr {:#x}",
                header.bytenr
            )));
        }

        let node = Rc::new(Node { data, header });
        self.nodes.borrow_mut().put(address, Rc::clone(&node));
        Ok(node)
    }
}

#[derive(Debug)]
struct Frame {
    node: Rc<Node>,
    index: u32,
}

/// A cursor over a [`BTree`]: a stack of `(node, index)` frames from the
/// root down to the current position.
#[derive(Debug)]
pub struct Cursor {
    btree: BTree,
    frames: Vec<Frame>,
}

impl Cursor {
    /// Clear the path and stand on the root node again.
    pub fn reset(&mut self) -> Result<()> {
        self.frames.clear();
        self.push(self.btree.root_offset, false)
    }

    fn ensure_root(&mut self) -> Result<()> {
        if self.frames.is_empty() {
            self.push(self.btree.root_offset, false)?;
        }
        Ok(())
    }

    /// Descend into the node at `address`. `at_end` positions on the last
    /// item instead of the first.
    fn push(&mut self, address: u64, at_end: bool) -> Result<()> {
        let node = self.btree.read_node(address)?;
        let index = if at_end {
            node.header.nritems.saturating_sub(1)
        } else {
            0
        };
        self.frames.push(Frame { node, index });
        Ok(())
    }

    fn top(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| Error::Internal("cursor is not positioned".into()))
    }

    fn level(&self) -> Result<u8> {
        Ok(self.top()?.node.header.level)
    }

    /// Whether the cursor stands on an item (false only for an empty tree).
    pub fn has_item(&self) -> bool {
        self.frames
            .last()
            .map_or(false, |f| f.index < f.node.header.nritems)
    }

    /// The key at the current position, leaf or branch.
    pub fn key(&self) -> Result<btrfs_disk_key> {
        let frame = self.top()?;
        frame.node.key_at(frame.index)
    }

    fn key_ptr(&self) -> Result<btrfs_key_ptr> {
        let frame = self.top()?;
        frame.node.key_ptr_at(frame.index)
    }

    /// The leaf item at the current position.
    pub fn item(&self) -> Result<btrfs_item> {
        let frame = self.top()?;
        if frame.node.header.level > 0 {
            return Err(Error::Internal("cursor is not on a leaf".into()));
        }
        frame.node.item_at(frame.index)
    }

    /// The leaf item and a copy of its data area.
    pub fn get(&self) -> Result<(btrfs_item, Vec<u8>)> {
        let frame = self.top()?;
        if frame.node.header.level > 0 {
            return Err(Error::Internal("cursor is not on a leaf".into()));
        }
        let item = frame.node.item_at(frame.index)?;
        let data = frame.node.item_data(&item)?.to_vec();
        Ok((item, data))
    }

    /// Advance to the next leaf item, climbing and descending as needed.
    /// `Ok(false)` means the tree is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        if !self.next_node()? {
            return Ok(false);
        }
        while self.level()? > 0 {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, false)?;
        }
        Ok(true)
    }

    /// Advance to the next node position (one level below the nearest
    /// non-exhausted ancestor).
    pub fn next_node(&mut self) -> Result<bool> {
        while let Some(frame) = self.frames.last() {
            if frame.index + 1 < frame.node.header.nritems {
                break;
            }
            self.frames.pop();
        }

        let Some(frame) = self.frames.last_mut() else {
            return Ok(false);
        };
        frame.index += 1;
        let descend = frame.node.header.level > 0;
        if descend {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, false)?;
        }
        Ok(true)
    }

    /// Step back to the previous leaf item. Mirror of [`Cursor::next`].
    pub fn prev(&mut self) -> Result<bool> {
        if !self.prev_node()? {
            return Ok(false);
        }
        while self.level()? > 0 {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, true)?;
        }
        Ok(true)
    }

    pub fn prev_node(&mut self) -> Result<bool> {
        while let Some(frame) = self.frames.last() {
            if frame.index > 0 {
                break;
            }
            self.frames.pop();
        }

        let Some(frame) = self.frames.last_mut() else {
            return Ok(false);
        };
        frame.index -= 1;
        let descend = frame.node.header.level > 0;
        if descend {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, true)?;
        }
        Ok(true)
    }

    /// Move to the first leaf item of the tree.
    pub fn first(&mut self) -> Result<()> {
        self.reset()?;
        while self.level()? > 0 {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, false)?;
        }
        Ok(())
    }

    /// Move to the last leaf item of the tree.
    pub fn last(&mut self) -> Result<()> {
        self.reset()?;
        if let Some(frame) = self.frames.last_mut() {
            frame.index = frame.node.header.nritems.saturating_sub(1);
        }
        while self.level()? > 0 {
            let ptr = self.key_ptr()?;
            self.push(ptr.blockptr, true)?;
        }
        Ok(())
    }

    /// Binary-search for the smallest key >= the query prefix and stand on
    /// it. Returns false when every key in the tree is smaller. A missing
    /// `offset` compares as 0 while descending, so the cursor lands on the
    /// first item of a run.
    pub fn search(
        &mut self,
        objectid: Option<u64>,
        item_type: Option<u8>,
        offset: Option<u64>,
    ) -> Result<bool> {
        self.ensure_root()?;
        debug!(
            "search: root {:#x} query ({objectid:?}, {item_type:?}, {offset:?})",
            self.btree.root_offset
        );

        loop {
            let node = Rc::clone(&self.top()?.node);
            let nritems = node.header.nritems;
            if nritems == 0 {
                return Ok(false);
            }

            let mut min_idx = 0_u32;
            let mut max_idx = nritems - 1;
            while min_idx != max_idx {
                let test_idx = (min_idx + max_idx) / 2;
                let key = node.key_at(test_idx)?;
                if cmp_key(&key, objectid, item_type, Some(offset.unwrap_or(0)))
                    == Ordering::Less
                {
                    min_idx = test_idx + 1;
                } else {
                    max_idx = test_idx;
                }
            }

            let result = cmp_key(&node.key_at(min_idx)?, objectid, item_type, offset);
            if node.header.level > 0 {
                let mut idx = min_idx;
                if result == Ordering::Greater && idx > 0 {
                    // The matching subtree is the one whose first key is
                    // still <= the query.
                    idx -= 1;
                }
                if let Some(frame) = self.frames.last_mut() {
                    frame.index = idx;
                }
                let ptr = node.key_ptr_at(idx)?;
                self.push(ptr.blockptr, false)?;
                continue;
            }

            if result != Ordering::Less {
                // A matching or larger key counts as a win; the caller
                // checks prefix equality.
                if let Some(frame) = self.frames.last_mut() {
                    frame.index = min_idx;
                }
                return Ok(true);
            }
            if min_idx == nritems - 1 {
                // Every key in this leaf is smaller; carry on in the next
                // node, worst case landing on a larger key.
                if let Some(frame) = self.frames.last_mut() {
                    frame.index = min_idx;
                }
                if self.next_node()? {
                    continue;
                }
                return Ok(false);
            }
            return Ok(false);
        }
    }

    /// Search, then yield items while the key still matches the query.
    /// With `ignore_offset` the offset only seeds the search position.
    pub fn iter(
        self,
        objectid: Option<u64>,
        item_type: Option<u8>,
        offset: Option<u64>,
        ignore_offset: bool,
    ) -> ItemIter {
        ItemIter {
            cursor: self,
            objectid,
            item_type,
            offset,
            ignore_offset,
            walk: false,
            started: false,
            done: false,
        }
    }

    /// Visit every leaf item from first to last, yielding the ones that
    /// match the query.
    pub fn walk(
        self,
        objectid: Option<u64>,
        item_type: Option<u8>,
        offset: Option<u64>,
    ) -> ItemIter {
        ItemIter {
            cursor: self,
            objectid,
            item_type,
            offset,
            ignore_offset: false,
            walk: true,
            started: false,
            done: false,
        }
    }
}

/// Lazy item sequence produced by [`Cursor::iter`] and [`Cursor::walk`].
#[derive(Debug)]
pub struct ItemIter {
    cursor: Cursor,
    objectid: Option<u64>,
    item_type: Option<u8>,
    offset: Option<u64>,
    ignore_offset: bool,
    walk: bool,
    started: bool,
    done: bool,
}

impl Iterator for ItemIter {
    type Item = Result<(btrfs_item, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if !self.started {
                self.started = true;
                if self.walk {
                    if let Err(e) = self.cursor.first() {
                        self.done = true;
                        return Some(Err(e));
                    }
                } else {
                    match self
                        .cursor
                        .search(self.objectid, self.item_type, self.offset)
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            self.done = true;
                            return None;
                        }
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
            } else {
                match self.cursor.next() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            if !self.cursor.has_item() {
                // Empty tree.
                self.done = true;
                return None;
            }

            let key = match self.cursor.key() {
                Ok(key) => key,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let offset = if self.ignore_offset { None } else { self.offset };
            if cmp_key(&key, self.objectid, self.item_type, offset) == Ordering::Equal {
                return Some(self.cursor.get());
            }
            if !self.walk {
                self.done = true;
                return None;
            }
            // walk skips non-matching items
        }
    }
}
