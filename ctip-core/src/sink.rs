//! Result assembly from out-of-order block writes.
//!
//! A transcode result arrives as independently-addressable blocks: the
//! server opens blocks (adjacent to the most recently opened one, or spliced
//! before an existing one), streams bytes into any open block, and closes
//! blocks it is done with. Block ids are never carried by the open packets;
//! both peers count block creations in lock-step, so the id is the creation
//! ordinal. The sink reassembles a deterministic byte stream from any
//! cross-block delivery order while preserving order strictly within a
//! block.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::CtipError;
use crate::meta::MetaSource;

/// The minimal sink contract for one result unit.
pub trait BlockBuilder: Send {
    /// Open a new block adjacent to the last opened block. Returns the new
    /// block id (the creation ordinal).
    fn add_block(&mut self) -> Result<i32, CtipError>;

    /// Open a new block spliced immediately before `anchor`.
    fn insert_block_before(&mut self, anchor: i32) -> Result<i32, CtipError>;

    /// Append bytes to an open block.
    fn write(&mut self, id: i32, data: &[u8]) -> Result<(), CtipError>;

    /// No further writes to `anchor`. Idempotent.
    fn close_block(&mut self, anchor: i32) -> Result<(), CtipError>;

    /// Freeze the unit. No block may be written afterwards.
    fn finish(&mut self) -> Result<(), CtipError>;
}

/// Receives result units as the server produces them.
pub trait Results: Send {
    /// Whether the sink will accept another unit.
    fn has_next(&self) -> bool;

    /// Open the next result unit.
    fn next_builder(&mut self, meta: &MetaSource) -> Result<Box<dyn BlockBuilder>, CtipError>;

    /// The operation producing units has ended.
    fn end(&mut self) -> Result<(), CtipError>;
}

// ── In-memory builder ────────────────────────────────────────────────

struct BlockRecord {
    data: Vec<u8>,
    open: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Assembles one unit in memory.
///
/// Blocks live in an arena indexed by id; assembly order is a doubly-linked
/// chain of arena indices, giving O(1) splice for insert-before without
/// moving any payload bytes.
pub struct MemoryBuilder {
    blocks: Vec<BlockRecord>,
    head: Option<usize>,
    cursor: Option<usize>,
    finished: bool,
    out: Option<Arc<Mutex<Vec<u8>>>>,
}

impl MemoryBuilder {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            head: None,
            cursor: None,
            finished: false,
            out: None,
        }
    }

    /// A builder that copies the assembled unit into `out` on finish.
    pub fn shared(out: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            out: Some(out),
            ..Self::new()
        }
    }

    /// Concatenate the blocks in assembly order.
    pub fn assemble(&self) -> Bytes {
        let mut buf = Vec::new();
        let mut at = self.head;
        while let Some(i) = at {
            buf.extend_from_slice(&self.blocks[i].data);
            at = self.blocks[i].next;
        }
        Bytes::from(buf)
    }

    fn record(&mut self, id: i32) -> Result<&mut BlockRecord, CtipError> {
        if self.finished {
            return Err(CtipError::ProtocolViolation("block write after finish"));
        }
        usize::try_from(id)
            .ok()
            .and_then(|i| self.blocks.get_mut(i))
            .ok_or(CtipError::ProtocolViolation("unknown block id"))
    }

    fn new_record(&mut self) -> Result<usize, CtipError> {
        if self.finished {
            return Err(CtipError::ProtocolViolation("block opened after finish"));
        }
        self.blocks.push(BlockRecord {
            data: Vec::new(),
            open: true,
            prev: None,
            next: None,
        });
        Ok(self.blocks.len() - 1)
    }
}

impl Default for MemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder for MemoryBuilder {
    fn add_block(&mut self) -> Result<i32, CtipError> {
        let new = self.new_record()?;
        match self.cursor {
            // Link after the most recently opened block.
            Some(at) => {
                let next = self.blocks[at].next;
                self.blocks[new].prev = Some(at);
                self.blocks[new].next = next;
                self.blocks[at].next = Some(new);
                if let Some(n) = next {
                    self.blocks[n].prev = Some(new);
                }
            }
            None => self.head = Some(new),
        }
        self.cursor = Some(new);
        Ok(new as i32)
    }

    fn insert_block_before(&mut self, anchor: i32) -> Result<i32, CtipError> {
        self.record(anchor)?;
        let at = anchor as usize;
        let new = self.new_record()?;
        let prev = self.blocks[at].prev;
        self.blocks[new].prev = prev;
        self.blocks[new].next = Some(at);
        self.blocks[at].prev = Some(new);
        match prev {
            Some(p) => self.blocks[p].next = Some(new),
            None => self.head = Some(new),
        }
        self.cursor = Some(new);
        Ok(new as i32)
    }

    fn write(&mut self, id: i32, data: &[u8]) -> Result<(), CtipError> {
        let record = self.record(id)?;
        if !record.open {
            return Err(CtipError::ProtocolViolation("write to a closed block"));
        }
        record.data.extend_from_slice(data);
        Ok(())
    }

    fn close_block(&mut self, anchor: i32) -> Result<(), CtipError> {
        self.record(anchor)?.open = false;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CtipError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(out) = &self.out {
            let assembled = self.assemble();
            let mut out = out.lock().map_err(|_| CtipError::ChannelClosed)?;
            out.extend_from_slice(&assembled);
        }
        Ok(())
    }
}

/// Accepts and discards everything while keeping the id counter in
/// lock-step with the peer.
pub struct NopBuilder {
    next_id: i32,
}

impl NopBuilder {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }
}

impl Default for NopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBuilder for NopBuilder {
    fn add_block(&mut self) -> Result<i32, CtipError> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn insert_block_before(&mut self, _anchor: i32) -> Result<i32, CtipError> {
        self.add_block()
    }

    fn write(&mut self, _id: i32, _data: &[u8]) -> Result<(), CtipError> {
        Ok(())
    }

    fn close_block(&mut self, _anchor: i32) -> Result<(), CtipError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CtipError> {
        Ok(())
    }
}

// ── Results implementations ──────────────────────────────────────────

/// Collects exactly one result unit into a shared buffer; any further
/// units are silently discarded.
pub struct SingleResult {
    out: Arc<Mutex<Vec<u8>>>,
    meta: Option<MetaSource>,
    units: usize,
}

impl SingleResult {
    pub fn new() -> Self {
        Self {
            out: Arc::new(Mutex::new(Vec::new())),
            meta: None,
            units: 0,
        }
    }

    /// Handle to the collected bytes; populated once the unit finishes.
    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.out)
    }

    /// Metadata of the collected unit, once opened.
    pub fn meta(&self) -> Option<&MetaSource> {
        self.meta.as_ref()
    }
}

impl Default for SingleResult {
    fn default() -> Self {
        Self::new()
    }
}

impl Results for SingleResult {
    fn has_next(&self) -> bool {
        self.units == 0
    }

    fn next_builder(&mut self, meta: &MetaSource) -> Result<Box<dyn BlockBuilder>, CtipError> {
        self.units += 1;
        if self.units == 1 {
            self.meta = Some(meta.clone());
            Ok(Box::new(MemoryBuilder::shared(Arc::clone(&self.out))))
        } else {
            Ok(Box::new(NopBuilder::new()))
        }
    }

    fn end(&mut self) -> Result<(), CtipError> {
        Ok(())
    }
}

/// Discards every unit.
pub struct NopResults;

impl Results for NopResults {
    fn has_next(&self) -> bool {
        true
    }

    fn next_builder(&mut self, _meta: &MetaSource) -> Result<Box<dyn BlockBuilder>, CtipError> {
        Ok(Box::new(NopBuilder::new()))
    }

    fn end(&mut self) -> Result<(), CtipError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_writes_stay_ordered() {
        let mut b = MemoryBuilder::new();
        let a = b.add_block().unwrap();
        let c = b.add_block().unwrap();
        assert_eq!((a, c), (0, 1));

        b.write(a, b"A1").unwrap();
        b.write(c, b"B1").unwrap();
        b.write(a, b"A2").unwrap();
        b.write(c, b"B2").unwrap();
        b.finish().unwrap();

        assert_eq!(&b.assemble()[..], b"A1A2B1B2");
    }

    #[test]
    fn delivery_order_across_ids_does_not_matter() {
        // Same ops, writes delivered in two different cross-id orders.
        let run = |order: &[(i32, &[u8])]| {
            let mut b = MemoryBuilder::new();
            b.add_block().unwrap();
            b.add_block().unwrap();
            b.add_block().unwrap();
            for (id, data) in order {
                b.write(*id, data).unwrap();
            }
            b.finish().unwrap();
            b.assemble()
        };

        let x = run(&[(0, b"aa"), (1, b"bb"), (2, b"cc")]);
        let y = run(&[(2, b"cc"), (0, b"aa"), (1, b"bb")]);
        assert_eq!(x, y);
        assert_eq!(&x[..], b"aabbcc");
    }

    #[test]
    fn insert_before_splices() {
        let mut b = MemoryBuilder::new();
        let first = b.add_block().unwrap();
        b.write(first, b"tail").unwrap();
        let spliced = b.insert_block_before(first).unwrap();
        b.write(spliced, b"head ").unwrap();
        b.finish().unwrap();
        assert_eq!(&b.assemble()[..], b"head tail");
    }

    #[test]
    fn insert_before_head_becomes_head() {
        let mut b = MemoryBuilder::new();
        let first = b.add_block().unwrap();
        let second = b.insert_block_before(first).unwrap();
        let third = b.insert_block_before(second).unwrap();
        b.write(first, b"3").unwrap();
        b.write(second, b"2").unwrap();
        b.write(third, b"1").unwrap();
        assert_eq!(&b.assemble()[..], b"123");
    }

    #[test]
    fn add_after_insert_follows_cursor() {
        let mut b = MemoryBuilder::new();
        let first = b.add_block().unwrap();
        let spliced = b.insert_block_before(first).unwrap();
        let after = b.add_block().unwrap();
        b.write(first, b"C").unwrap();
        b.write(spliced, b"A").unwrap();
        b.write(after, b"B").unwrap();
        assert_eq!(&b.assemble()[..], b"ABC");
    }

    #[test]
    fn closed_and_unknown_blocks_reject_writes() {
        let mut b = MemoryBuilder::new();
        let id = b.add_block().unwrap();
        b.close_block(id).unwrap();
        assert!(b.write(id, b"x").is_err());
        assert!(b.write(7, b"x").is_err());
        assert!(b.write(-1, b"x").is_err());
        // close is idempotent
        b.close_block(id).unwrap();
    }

    #[test]
    fn finish_freezes() {
        let mut b = MemoryBuilder::new();
        let id = b.add_block().unwrap();
        b.write(id, b"x").unwrap();
        b.finish().unwrap();
        assert!(b.write(id, b"y").is_err());
        assert!(b.add_block().is_err());
        assert_eq!(&b.assemble()[..], b"x");
    }

    #[test]
    fn single_result_collects_first_unit_only() {
        let mut results = SingleResult::new();
        let out = results.buffer();
        let meta = MetaSource::new(".", Some("application/pdf".into()), None, Some(3));

        assert!(results.has_next());
        let mut builder = results.next_builder(&meta).unwrap();
        let id = builder.add_block().unwrap();
        builder.write(id, b"%PDF").unwrap();
        builder.finish().unwrap();

        assert!(!results.has_next());
        let mut second = results.next_builder(&MetaSource::uri_only("x")).unwrap();
        let id = second.add_block().unwrap();
        second.write(id, b"discarded").unwrap();
        second.finish().unwrap();
        results.end().unwrap();

        assert_eq!(&out.lock().unwrap()[..], b"%PDF");
        assert_eq!(results.meta().unwrap().mime_type.as_deref(), Some("application/pdf"));
    }
}
