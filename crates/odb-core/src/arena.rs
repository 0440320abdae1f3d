//! Shared arena: a fixed-size mmap region with a block allocator.
//!
//! Layout:
//! ```text
//! [ ArenaHeader (128 B) ][ block ][ block ] ... [ block ]
//! block = [ size: u32 | tag: u32 ][ payload ... ]
//! ```
//! Free blocks keep the offset of the next free block in the first four
//! payload bytes; the free list is ordered by address. All offsets handed
//! out are payload offsets, stable until freed or relocated by `resize`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OdbError, Result};

pub const ARENA_MAGIC: u32 = 0x4F44_4231; // "ODB1"
pub const ARENA_VERSION: u32 = 1;
pub const ARENA_HEADER_SIZE: usize = 128;
pub const BLOCK_HEADER_SIZE: usize = 8;
pub const BLOCK_ALIGN: usize = 8;
pub const MIN_BLOCK_SIZE: usize = 16;

/// Smallest usable data region
pub const MIN_CAPACITY: usize = 4096;
/// Offsets are 32 bit
pub const MAX_CAPACITY: usize = u32::MAX as usize - ARENA_HEADER_SIZE;

const TAG_USED: u32 = 0x5553_4544;
const TAG_FREE: u32 = 0x4652_4545;

const FLAG_CORRUPTED: u64 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArenaHeader {
    pub magic: u32,
    pub version: u32,
    /// Odd while a mutation is in progress
    pub write_seq: u64,
    pub total_size: u64,
    pub data_start: u64,
    pub data_end: u64,
    pub free_head: u64,
    pub root_key: u64,
    pub flags: u64,
    pub commit_gen: u64,
    pub next_serial: u64,
    pub allocated: u64,
    pub free: u64,
    pub crc32: u32,
    pub _pad: u32,
    pub _reserved: [u64; 3],
}

const _: () = assert!(std::mem::size_of::<ArenaHeader>() == ARENA_HEADER_SIZE);

impl ArenaHeader {
    /// CRC over the fields that never change after initialization
    fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.magic.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.total_size.to_le_bytes());
        hasher.update(&self.data_start.to_le_bytes());
        hasher.update(&self.data_end.to_le_bytes());
        hasher.update(&self.root_key.to_le_bytes());
        hasher.finalize()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    size: u32,
    tag: u32,
}

/// Space accounting snapshot returned by [`Arena::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArenaStats {
    /// Size of the data region; `allocated + free == capacity`
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

/// Arena manager
pub struct Arena {
    mmap: MmapMut,
    path: Option<PathBuf>,
    created: bool,
    /// Pre-images of every byte range written since `begin_undo`
    undo: Option<Vec<(usize, Vec<u8>)>>,
}

/// Block size holding `payload` bytes, `None` when it cannot be represented
fn block_size_for(payload: usize) -> Option<usize> {
    let raw = payload.checked_add(BLOCK_HEADER_SIZE + BLOCK_ALIGN - 1)?;
    let size = (raw & !(BLOCK_ALIGN - 1)).max(MIN_BLOCK_SIZE);
    u32::try_from(size).ok()?;
    Some(size)
}

fn validate_capacity(capacity: usize) -> Result<usize> {
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
        return Err(OdbError::OutOfRange {
            index: capacity,
            count: MAX_CAPACITY,
        });
    }
    Ok(capacity & !(BLOCK_ALIGN - 1))
}

impl Arena {
    /// Create or open the arena backing file at `path`.
    ///
    /// A new (empty) file is sized to hold `capacity` data bytes. An existing
    /// file keeps its own size; header validation is left to the caller via
    /// [`Arena::verify_header`].
    pub fn open_or_create(path: &Path, capacity: usize) -> Result<Self> {
        let capacity = validate_capacity(capacity)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        let created = len == 0;
        if created {
            file.set_len((ARENA_HEADER_SIZE + capacity) as u64)?;
            info!(path = %path.display(), capacity, "Created new arena file");
        } else if len < ARENA_HEADER_SIZE + MIN_CAPACITY {
            return Err(OdbError::corrupted(format!(
                "arena file {} is only {len} bytes",
                path.display()
            )));
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let mut arena = Self {
            mmap,
            path: Some(path.to_path_buf()),
            created,
            undo: None,
        };
        if created {
            arena.initialize();
            arena.mmap.flush()?;
        }
        Ok(arena)
    }

    /// Open an existing arena file without creating it
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < ARENA_HEADER_SIZE + MIN_CAPACITY {
            return Err(OdbError::corrupted(format!(
                "arena file {} is only {len} bytes",
                path.display()
            )));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            path: Some(path.to_path_buf()),
            created: false,
            undo: None,
        })
    }

    /// Private arena in an anonymous mapping
    pub fn anonymous(capacity: usize) -> Result<Self> {
        let capacity = validate_capacity(capacity)?;
        let mmap = MmapMut::map_anon(ARENA_HEADER_SIZE + capacity)?;
        let mut arena = Self {
            mmap,
            path: None,
            created: true,
            undo: None,
        };
        arena.initialize();
        Ok(arena)
    }

    /// Discard the contents and lay out an empty arena
    pub fn reinitialize(&mut self) -> Result<()> {
        self.mmap.fill(0);
        self.initialize();
        self.created = true;
        self.flush()
    }

    fn initialize(&mut self) {
        let total = self.mmap.len();
        let data_start = ARENA_HEADER_SIZE;
        let data_end = data_start + ((total - data_start) & !(BLOCK_ALIGN - 1));
        let mut header = ArenaHeader {
            magic: ARENA_MAGIC,
            version: ARENA_VERSION,
            write_seq: 0,
            total_size: total as u64,
            data_start: data_start as u64,
            data_end: data_end as u64,
            free_head: data_start as u64,
            root_key: 0,
            flags: 0,
            commit_gen: 0,
            next_serial: 1,
            allocated: 0,
            free: (data_end - data_start) as u64,
            crc32: 0,
            _pad: 0,
            _reserved: [0; 3],
        };
        header.crc32 = header.compute_crc();
        self.put_header(&header);
        self.put_block(
            data_start,
            BlockHeader {
                size: (data_end - data_start) as u32,
                tag: TAG_FREE,
            },
        );
        self.set_next_free(data_start, 0);
        debug!(capacity = data_end - data_start, "Initialized arena header");
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// True if this handle laid out a fresh arena
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn flush(&self) -> Result<()> {
        if self.path.is_some() {
            self.mmap.flush()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Header
    // -----------------------------------------------------------------------

    pub fn header(&self) -> ArenaHeader {
        unsafe { std::ptr::read_unaligned(self.mmap.as_ptr() as *const ArenaHeader) }
    }

    fn put_header(&mut self, header: &ArenaHeader) {
        self.touch(0, ARENA_HEADER_SIZE);
        unsafe {
            std::ptr::write_unaligned(self.mmap.as_mut_ptr() as *mut ArenaHeader, *header);
        }
    }

    fn update_header(&mut self, f: impl FnOnce(&mut ArenaHeader)) {
        let mut header = self.header();
        f(&mut header);
        self.put_header(&header);
    }

    /// Validate magic, version, CRC and data bounds
    pub fn verify_header(&self) -> Result<()> {
        let h = self.header();
        if h.magic != ARENA_MAGIC {
            return Err(OdbError::corrupted(format!("bad arena magic {:#x}", h.magic)));
        }
        if h.version != ARENA_VERSION {
            return Err(OdbError::corrupted(format!(
                "unsupported arena version {}",
                h.version
            )));
        }
        let computed = h.compute_crc();
        if computed != h.crc32 {
            warn!(stored = h.crc32, computed, "Arena header CRC mismatch");
            return Err(OdbError::corrupted("arena header CRC mismatch"));
        }
        let bounds_ok = h.total_size as usize == self.mmap.len()
            && h.data_start as usize == ARENA_HEADER_SIZE
            && h.data_end <= h.total_size
            && h.data_start < h.data_end;
        if !bounds_ok {
            return Err(OdbError::corrupted("arena data bounds do not match the mapping"));
        }
        Ok(())
    }

    fn write_seq_atomic(&self) -> &AtomicU64 {
        // write_seq sits at offset 8 of a page-aligned mapping
        let ptr = unsafe { self.mmap.as_ptr().add(8) } as *const AtomicU64;
        unsafe { &*ptr }
    }

    /// Mark the start of a mutation (write sequence becomes odd)
    pub fn begin_write(&mut self) {
        let seq = self.write_seq_atomic();
        let current = seq.load(Ordering::Acquire);
        if current & 1 == 0 {
            seq.store(current + 1, Ordering::Release);
        }
    }

    /// Mark the end of a mutation (write sequence becomes even)
    pub fn end_write(&mut self) {
        let seq = self.write_seq_atomic();
        let current = seq.load(Ordering::Acquire);
        if current & 1 != 0 {
            seq.store(current + 1, Ordering::Release);
        }
    }

    /// A writer died between `begin_write` and `end_write`
    pub fn interrupted_writer(&self) -> bool {
        self.write_seq_atomic().load(Ordering::Acquire) & 1 != 0
    }

    pub fn recover_writer(&mut self) {
        let stale = self.write_seq_atomic().load(Ordering::Acquire);
        if stale & 1 != 0 {
            warn!(
                stale_seq = stale,
                "Arena write sequence stuck at odd value (previous writer crashed). Recovering."
            );
            self.end_write();
        }
    }

    pub fn is_marked_corrupted(&self) -> bool {
        self.header().flags & FLAG_CORRUPTED != 0
    }

    pub fn mark_corrupted(&mut self) {
        self.update_header(|h| h.flags |= FLAG_CORRUPTED);
    }

    pub fn clear_corrupted(&mut self) {
        self.update_header(|h| h.flags &= !FLAG_CORRUPTED);
    }

    pub fn root(&self) -> u32 {
        self.header().root_key as u32
    }

    pub fn set_root(&mut self, offset: u32) {
        self.update_header(|h| {
            h.root_key = offset as u64;
            h.crc32 = h.compute_crc();
        });
    }

    pub fn commit_gen(&self) -> u64 {
        self.header().commit_gen
    }

    /// Advance and return the global commit generation
    pub fn next_commit_gen(&mut self) -> u64 {
        let mut gen = 0;
        self.update_header(|h| {
            h.commit_gen += 1;
            gen = h.commit_gen;
        });
        gen
    }

    /// Allocate a key serial number
    pub fn next_serial(&mut self) -> u64 {
        let mut serial = 0;
        self.update_header(|h| {
            serial = h.next_serial;
            h.next_serial += 1;
        });
        serial
    }

    // -----------------------------------------------------------------------
    // Undo journal
    // -----------------------------------------------------------------------

    /// Start recording pre-images so the next writes can be rolled back
    pub fn begin_undo(&mut self) {
        self.undo = Some(Vec::new());
    }

    pub fn in_undo(&self) -> bool {
        self.undo.is_some()
    }

    /// Keep everything written since `begin_undo`
    pub fn discard_undo(&mut self) {
        self.undo = None;
    }

    /// Restore every byte written since `begin_undo`, newest first
    pub fn rollback(&mut self) {
        let Some(log) = self.undo.take() else {
            return;
        };
        let restored = log.len();
        for (offset, bytes) in log.into_iter().rev() {
            self.mmap[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        debug!(restored, "Rolled back arena writes");
    }

    /// Record the current contents of a range about to be written
    fn touch(&mut self, offset: usize, len: usize) {
        if let Some(log) = self.undo.as_mut() {
            let end = (offset + len).min(self.mmap.len());
            log.push((offset, self.mmap[offset..end].to_vec()));
        }
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    fn data_bounds(&self) -> (usize, usize) {
        let h = self.header();
        (h.data_start as usize, h.data_end as usize)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let (start, end) = self.data_bounds();
        let end = end.min(self.mmap.len());
        match offset.checked_add(len) {
            Some(stop) if offset >= start && stop <= end => Ok(()),
            _ => Err(OdbError::corrupted(format!(
                "access {offset}+{len} outside arena data [{start}, {end})"
            ))),
        }
    }

    /// Copy a `repr(C)` value out of the arena
    pub fn read<T: Copy>(&self, offset: usize) -> Result<T> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        Ok(unsafe { std::ptr::read_unaligned(self.mmap.as_ptr().add(offset) as *const T) })
    }

    /// Copy a `repr(C)` value into the arena
    pub fn write<T: Copy>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        self.touch(offset, std::mem::size_of::<T>());
        unsafe {
            std::ptr::write_unaligned(self.mmap.as_mut_ptr().add(offset) as *mut T, *value);
        }
        Ok(())
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(&self.mmap[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_range(offset, len)?;
        self.touch(offset, len);
        Ok(&mut self.mmap[offset..offset + len])
    }

    /// Copy `len` bytes between two ranges of the data region
    pub fn copy(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        self.check_range(from, len)?;
        self.check_range(to, len)?;
        self.touch(to, len);
        self.mmap.copy_within(from..from + len, to);
        Ok(())
    }

    fn block(&self, block: usize) -> Result<BlockHeader> {
        self.read::<BlockHeader>(block)
    }

    fn put_block(&mut self, block: usize, header: BlockHeader) {
        self.touch(block, BLOCK_HEADER_SIZE);
        unsafe {
            std::ptr::write_unaligned(self.mmap.as_mut_ptr().add(block) as *mut BlockHeader, header);
        }
    }

    /// Header of a block reached through the free list, validated
    fn free_block(&self, block: usize) -> Result<BlockHeader> {
        let (_, end) = self.data_bounds();
        let header = self.block(block)?;
        let size = header.size as usize;
        if header.tag != TAG_FREE || size < MIN_BLOCK_SIZE || block + size > end {
            return Err(OdbError::corrupted(format!(
                "free list entry {block} is not a valid free block"
            )));
        }
        Ok(header)
    }

    fn next_free(&self, block: usize) -> Result<usize> {
        Ok(self.read::<u32>(block + BLOCK_HEADER_SIZE)? as usize)
    }

    fn set_next_free(&mut self, block: usize, next: usize) {
        self.touch(block + BLOCK_HEADER_SIZE, 4);
        unsafe {
            std::ptr::write_unaligned(
                self.mmap.as_mut_ptr().add(block + BLOCK_HEADER_SIZE) as *mut u32,
                next as u32,
            );
        }
    }

    fn set_free_head(&mut self, block: usize) {
        self.update_header(|h| h.free_head = block as u64);
    }

    fn adjust_accounting(&mut self, allocated_delta: isize) {
        self.update_header(|h| {
            h.allocated = (h.allocated as i64 + allocated_delta as i64) as u64;
            h.free = (h.free as i64 - allocated_delta as i64) as u64;
        });
    }

    /// Resolve a payload offset to its live block, validating it
    fn used_block(&self, offset: usize) -> Result<(usize, BlockHeader)> {
        let (start, end) = self.data_bounds();
        if offset < start + BLOCK_HEADER_SIZE || offset >= end || offset % BLOCK_ALIGN != 0 {
            return Err(OdbError::corrupted(format!("invalid block offset {offset}")));
        }
        let block = offset - BLOCK_HEADER_SIZE;
        let header = self.block(block)?;
        if header.tag != TAG_USED
            || (header.size as usize) < MIN_BLOCK_SIZE
            || block + header.size as usize > end
        {
            return Err(OdbError::corrupted(format!(
                "offset {offset} is not a live allocation"
            )));
        }
        Ok((block, header))
    }

    /// True if `offset` is the payload of a live allocation
    pub fn is_live(&self, offset: usize) -> bool {
        self.used_block(offset).is_ok()
    }

    /// Usable payload bytes of the allocation at `offset`
    pub fn payload_size(&self, offset: usize) -> Result<usize> {
        let (_, header) = self.used_block(offset)?;
        Ok(header.size as usize - BLOCK_HEADER_SIZE)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` zeroed bytes and return the payload offset.
    ///
    /// Free blocks are merged as soon as they are released, so a failed
    /// first-fit scan means no single free block is large enough.
    pub fn allocate(&mut self, size: usize) -> Result<u32> {
        let need = self.block_size_within(size)?;
        if let Some(offset) = self.try_allocate(need)? {
            return Ok(offset);
        }
        Err(self.out_of_space(size))
    }

    fn out_of_space(&self, requested: usize) -> OdbError {
        OdbError::OutOfSpace {
            requested,
            largest_free: self.largest_free().unwrap_or(0),
        }
    }

    /// Block size for `size` payload bytes if it can fit in the data region
    fn block_size_within(&self, size: usize) -> Result<usize> {
        let (start, end) = self.data_bounds();
        match block_size_for(size) {
            Some(need) if need <= end - start => Ok(need),
            _ => Err(self.out_of_space(size)),
        }
    }

    /// Fail `OutOfSpace` unless `count` items of `item_size` bytes could fit
    /// in the data region at all; returns the byte length
    pub fn ensure_room(&self, count: usize, item_size: usize) -> Result<usize> {
        let len = count
            .checked_mul(item_size)
            .ok_or_else(|| self.out_of_space(usize::MAX))?;
        self.block_size_within(len)?;
        Ok(len)
    }

    fn try_allocate(&mut self, need: usize) -> Result<Option<u32>> {
        let mut prev = 0usize;
        let mut cur = self.header().free_head as usize;
        let mut hops = 0usize;
        while cur != 0 {
            hops += 1;
            if hops > self.mmap.len() / MIN_BLOCK_SIZE {
                return Err(OdbError::corrupted("free list does not terminate"));
            }
            let size = self.free_block(cur)?.size as usize;
            let next = self.next_free(cur)?;
            if size >= need {
                let taken = if size - need >= MIN_BLOCK_SIZE {
                    let rest = cur + need;
                    self.put_block(
                        rest,
                        BlockHeader {
                            size: (size - need) as u32,
                            tag: TAG_FREE,
                        },
                    );
                    self.set_next_free(rest, next);
                    self.link_after(prev, rest);
                    need
                } else {
                    self.link_after(prev, next);
                    size
                };
                self.put_block(
                    cur,
                    BlockHeader {
                        size: taken as u32,
                        tag: TAG_USED,
                    },
                );
                let payload = cur + BLOCK_HEADER_SIZE;
                self.touch(payload, taken - BLOCK_HEADER_SIZE);
                self.mmap[payload..cur + taken].fill(0);
                self.adjust_accounting(taken as isize);
                return Ok(Some(payload as u32));
            }
            prev = cur;
            cur = next;
        }
        Ok(None)
    }

    /// Point `prev`'s next link (or the list head when `prev == 0`) at `next`
    fn link_after(&mut self, prev: usize, next: usize) {
        if prev == 0 {
            self.set_free_head(next);
        } else {
            self.set_next_free(prev, next);
        }
    }

    /// Release the allocation at `offset`; the payload is zeroed
    pub fn free(&mut self, offset: u32) -> Result<()> {
        let (block, header) = self.used_block(offset as usize)?;
        self.release_block(block, header.size as usize)
    }

    fn release_block(&mut self, block: usize, size: usize) -> Result<()> {
        self.touch(block + BLOCK_HEADER_SIZE, size - BLOCK_HEADER_SIZE);
        self.mmap[block + BLOCK_HEADER_SIZE..block + size].fill(0);
        self.put_block(
            block,
            BlockHeader {
                size: size as u32,
                tag: TAG_FREE,
            },
        );
        self.adjust_accounting(-(size as isize));

        // Find the insertion point in the address-ordered list
        let mut prev = 0usize;
        let mut cur = self.header().free_head as usize;
        while cur != 0 && cur < block {
            prev = cur;
            cur = self.next_free(cur)?;
        }

        // Merge with the following block
        let mut size = size;
        if cur != 0 && block + size == cur {
            let next_header = self.free_block(cur)?;
            let after = self.next_free(cur)?;
            size += next_header.size as usize;
            self.touch(cur, BLOCK_HEADER_SIZE + 4);
            self.mmap[cur..cur + BLOCK_HEADER_SIZE + 4].fill(0);
            self.put_block(
                block,
                BlockHeader {
                    size: size as u32,
                    tag: TAG_FREE,
                },
            );
            self.set_next_free(block, after);
        } else {
            self.set_next_free(block, cur);
        }

        // Merge into the preceding block
        if prev != 0 {
            let prev_header = self.free_block(prev)?;
            if prev + prev_header.size as usize == block {
                let after = self.next_free(block)?;
                self.put_block(
                    prev,
                    BlockHeader {
                        size: prev_header.size + size as u32,
                        tag: TAG_FREE,
                    },
                );
                self.set_next_free(prev, after);
                self.touch(block, BLOCK_HEADER_SIZE + 4);
                self.mmap[block..block + BLOCK_HEADER_SIZE + 4].fill(0);
                return Ok(());
            }
        }
        self.link_after(prev, block);
        Ok(())
    }

    /// Resize the allocation at `offset` to hold `new_size` bytes.
    ///
    /// Shrinks in place, grows in place when the following block is free and
    /// large enough, otherwise relocates. Returns the (possibly new) payload
    /// offset; on failure the original allocation is untouched.
    pub fn resize(&mut self, offset: u32, new_size: usize) -> Result<u32> {
        let (block, header) = self.used_block(offset as usize)?;
        let cur = header.size as usize;
        let need = self.block_size_within(new_size)?;

        if need <= cur {
            if cur - need >= MIN_BLOCK_SIZE {
                self.put_block(
                    block,
                    BlockHeader {
                        size: need as u32,
                        tag: TAG_USED,
                    },
                );
                // The tail counts as allocated until release_block returns it
                self.release_block(block + need, cur - need)?;
            }
            return Ok(offset);
        }

        let next = block + cur;
        let (_, end) = self.data_bounds();
        if next < end {
            let next_header = self.block(next)?;
            let combined = cur + next_header.size as usize;
            if next_header.tag == TAG_FREE && combined >= need {
                self.unlink_free(next)?;
                let taken = if combined - need >= MIN_BLOCK_SIZE {
                    let rest = block + need;
                    self.put_block(
                        rest,
                        BlockHeader {
                            size: (combined - need) as u32,
                            tag: TAG_USED,
                        },
                    );
                    self.adjust_accounting((combined - need) as isize);
                    self.release_block(rest, combined - need)?;
                    need
                } else {
                    combined
                };
                self.put_block(
                    block,
                    BlockHeader {
                        size: taken as u32,
                        tag: TAG_USED,
                    },
                );
                self.touch(next, block + taken - next);
                self.mmap[next..block + taken].fill(0);
                self.adjust_accounting((taken - cur) as isize);
                return Ok(offset);
            }
        }

        let moved = self.allocate(new_size)?;
        let keep = (cur - BLOCK_HEADER_SIZE).min(new_size);
        self.touch(moved as usize, keep);
        self.mmap
            .copy_within(offset as usize..offset as usize + keep, moved as usize);
        self.free(offset)?;
        debug!(from = offset, to = moved, new_size, "Relocated arena block");
        Ok(moved)
    }

    fn unlink_free(&mut self, target: usize) -> Result<()> {
        let mut prev = 0usize;
        let mut cur = self.header().free_head as usize;
        while cur != 0 {
            let next = self.next_free(cur)?;
            if cur == target {
                self.link_after(prev, next);
                return Ok(());
            }
            prev = cur;
            cur = next;
        }
        Err(OdbError::corrupted(format!(
            "free block {target} missing from free list"
        )))
    }

    /// Largest payload a single allocation could currently get
    pub fn largest_free(&self) -> Result<usize> {
        let mut largest = 0usize;
        let mut cur = self.header().free_head as usize;
        let mut hops = 0usize;
        while cur != 0 {
            hops += 1;
            if hops > self.mmap.len() / MIN_BLOCK_SIZE {
                return Err(OdbError::corrupted("free list does not terminate"));
            }
            largest = largest.max(self.free_block(cur)?.size as usize);
            cur = self.next_free(cur)?;
        }
        Ok(largest.saturating_sub(BLOCK_HEADER_SIZE))
    }

    /// Accounting counters from the header, without walking blocks
    pub fn stats(&self) -> ArenaStats {
        let h = self.header();
        ArenaStats {
            capacity: (h.data_end - h.data_start) as usize,
            allocated: h.allocated as usize,
            free: h.free as usize,
            used_blocks: 0,
            free_blocks: 0,
            largest_free: self.largest_free().unwrap_or(0),
        }
    }

    /// Walk every block and the free list; report corruption, never repair.
    pub fn check(&self) -> Result<ArenaStats> {
        self.verify_header()?;
        let h = self.header();
        let (start, end) = (h.data_start as usize, h.data_end as usize);

        let mut stats = ArenaStats {
            capacity: end - start,
            ..Default::default()
        };
        let mut free_blocks = Vec::new();
        let mut pos = start;
        while pos < end {
            let header = self.block(pos)?;
            let size = header.size as usize;
            if size < MIN_BLOCK_SIZE || size % BLOCK_ALIGN != 0 || pos + size > end {
                return Err(OdbError::corrupted(format!(
                    "block at {pos} has invalid size {size}"
                )));
            }
            match header.tag {
                TAG_USED => {
                    stats.allocated += size;
                    stats.used_blocks += 1;
                }
                TAG_FREE => {
                    stats.free += size;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(size - BLOCK_HEADER_SIZE);
                    free_blocks.push(pos);
                }
                tag => {
                    return Err(OdbError::corrupted(format!(
                        "block at {pos} has bad tag {tag:#x}"
                    )))
                }
            }
            pos += size;
        }
        if pos != end {
            return Err(OdbError::corrupted("blocks overrun the data region"));
        }

        // The free list must visit exactly the free blocks, in address order
        let mut listed = 0usize;
        let mut last = 0usize;
        let mut cur = h.free_head as usize;
        while cur != 0 {
            if cur <= last {
                return Err(OdbError::corrupted(format!(
                    "free list out of order or cyclic at {cur}"
                )));
            }
            if free_blocks.binary_search(&cur).is_err() {
                return Err(OdbError::corrupted(format!(
                    "free list entry {cur} is not a free block"
                )));
            }
            listed += 1;
            last = cur;
            cur = self.next_free(cur)?;
        }
        if listed != free_blocks.len() {
            return Err(OdbError::corrupted(format!(
                "{} free blocks but {listed} on the free list",
                free_blocks.len()
            )));
        }

        if stats.allocated + stats.free != stats.capacity
            || stats.allocated as u64 != h.allocated
            || stats.free as u64 != h.free
        {
            return Err(OdbError::corrupted(format!(
                "accounting drift: walked {}+{}, header {}+{}, capacity {}",
                stats.allocated, stats.free, h.allocated, h.free, stats.capacity
            )));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::anonymous(8192).unwrap()
    }

    #[test]
    fn test_fresh_arena_is_all_free() {
        let a = arena();
        let stats = a.check().unwrap();
        assert_eq!(stats.capacity, 8192);
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.free, 8192);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn test_allocate_free_coalesces() {
        let mut a = arena();
        let x = a.allocate(100).unwrap();
        let y = a.allocate(200).unwrap();
        let z = a.allocate(50).unwrap();
        assert!(x < y && y < z);
        let s = a.check().unwrap();
        assert_eq!(s.allocated + s.free, s.capacity);

        a.free(y).unwrap();
        a.free(x).unwrap();
        a.free(z).unwrap();
        let s = a.check().unwrap();
        assert_eq!(s.allocated, 0);
        assert_eq!(s.free_blocks, 1);
    }

    #[test]
    fn test_allocation_is_zeroed_after_reuse() {
        let mut a = arena();
        let x = a.allocate(32).unwrap();
        a.bytes_mut(x as usize, 32).unwrap().fill(0xAB);
        a.free(x).unwrap();
        let y = a.allocate(32).unwrap();
        assert!(a.bytes(y as usize, 32).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_double_free_is_reported() {
        let mut a = arena();
        let x = a.allocate(16).unwrap();
        a.free(x).unwrap();
        assert!(matches!(a.free(x), Err(OdbError::Corrupted { .. })));
    }

    #[test]
    fn test_out_of_space_reports_largest_free() {
        let mut a = arena();
        let err = a.allocate(10_000).unwrap_err();
        match err {
            OdbError::OutOfSpace {
                requested,
                largest_free,
            } => {
                assert_eq!(requested, 10_000);
                assert_eq!(largest_free, 8192 - BLOCK_HEADER_SIZE);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_requests_fail_without_panicking() {
        let mut a = arena();
        for size in [usize::MAX, usize::MAX - 3, u32::MAX as usize] {
            assert!(matches!(a.allocate(size), Err(OdbError::OutOfSpace { .. })));
        }
        assert!(matches!(
            a.ensure_room(usize::MAX / 4, 8),
            Err(OdbError::OutOfSpace { .. })
        ));
        assert_eq!(a.ensure_room(10, 4).unwrap(), 40);

        let x = a.allocate(16).unwrap();
        assert!(matches!(a.resize(x, usize::MAX), Err(OdbError::OutOfSpace { .. })));
        assert_eq!(a.check().unwrap().allocated, 24);
    }

    #[test]
    fn test_rollback_restores_allocator_state() {
        let mut a = arena();
        let kept = a.allocate(40).unwrap();
        a.bytes_mut(kept as usize, 4).unwrap().copy_from_slice(b"keep");
        let before = a.check().unwrap();

        a.begin_undo();
        let x = a.allocate(100).unwrap();
        a.bytes_mut(x as usize, 3).unwrap().copy_from_slice(b"tmp");
        a.free(kept).unwrap();
        let _ = a.next_commit_gen();
        a.rollback();

        assert!(!a.in_undo());
        assert_eq!(a.check().unwrap(), before);
        assert_eq!(a.bytes(kept as usize, 4).unwrap(), b"keep");
        assert!(!a.is_live(x as usize));
        assert_eq!(a.commit_gen(), 0);
    }

    #[test]
    fn test_resize_grow_in_place_and_relocate() {
        let mut a = arena();
        let x = a.allocate(16).unwrap();
        a.bytes_mut(x as usize, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);

        // Next block is the big free block: grows in place
        let x2 = a.resize(x, 64).unwrap();
        assert_eq!(x, x2);
        assert!(a.payload_size(x2 as usize).unwrap() >= 64);

        // Block a neighbour in, then growing must relocate
        let _wall = a.allocate(8).unwrap();
        let x3 = a.resize(x2, 512).unwrap();
        assert_ne!(x3, x2);
        assert_eq!(a.bytes(x3 as usize, 4).unwrap(), &[1, 2, 3, 4]);
        a.check().unwrap();

        // Shrink keeps the offset
        let x4 = a.resize(x3, 8).unwrap();
        assert_eq!(x4, x3);
        let s = a.check().unwrap();
        assert_eq!(s.allocated + s.free, s.capacity);
    }

    #[test]
    fn test_check_detects_bad_tag() {
        let mut a = arena();
        let x = a.allocate(16).unwrap() as usize;
        a.mmap[x - 4..x].copy_from_slice(&0xDEADu32.to_le_bytes());
        assert!(matches!(a.check(), Err(OdbError::Corrupted { .. })));
    }

    #[test]
    fn test_write_sequence_marks_interrupted_writer() {
        let mut a = arena();
        a.begin_write();
        assert!(a.interrupted_writer());
        a.recover_writer();
        assert!(!a.interrupted_writer());
    }

    #[test]
    fn test_file_backed_reopen_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let x = {
            let mut a = Arena::open_or_create(&path, 8192).unwrap();
            assert!(a.was_created());
            let x = a.allocate(8).unwrap();
            a.bytes_mut(x as usize, 8).unwrap().copy_from_slice(b"persist!");
            a.flush().unwrap();
            x
        };
        let a = Arena::open_or_create(&path, 8192).unwrap();
        assert!(!a.was_created());
        a.verify_header().unwrap();
        assert_eq!(a.bytes(x as usize, 8).unwrap(), b"persist!");
    }
}
