//! Best-fit coalescing heap for mid-size allocations.
//!
//! Every block in a region — allocated, free, fragment or sentinel —
//! carries a 16-byte header: one word of `size | tag`, one word holding
//! the previous block's size for backward traversal. The header chain
//! tiles the region exactly from the leading sentinel to the trailing
//! sentinel, and no two adjacent blocks are ever both free: a free
//! rejoining the chain merges with free or fragment neighbors in O(1)
//! using the prev-size back link.
//!
//! Free blocks are indexed by host-side [`nodes::FreeNode`] records in
//! per-region size buckets. Allocation is best-fit with address
//! biasing: buckets sort ascending by (size, address), regions are
//! searched oldest first, so small requests take the smallest
//! sufficient hole and ties prefer low addresses, letting young regions
//! drain and be released.
//!
//! An allocation's offcut becomes a new free block when it can hold a
//! node, a node-less `fragment` when it can only hold a header, and is
//! swallowed into the allocation when it cannot even hold that.

pub(crate) mod nodes;

use crate::config::CoalesceTierConfig;
use crate::error::IntegrityError;
use crate::stats::TierStats;
use nodes::{BucketArray, BucketMap, NodePool, NUM_BUCKETS};
use stratheap_vm::{align_up, MappingLayer, SpanOracle, VirtualMemory};
use std::sync::Arc;

const WORD: usize = std::mem::size_of::<usize>();

/// Block header: `size | tag` word plus prev-size word.
pub(crate) const HEADER_BYTES: usize = 2 * WORD;

/// Offset of the prev-size word within a header.
const OFF_PREV: usize = WORD;

/// Region boundary sentinel; never allocated, never coalesced.
const TAG_FIXED: usize = 0;
const TAG_ALLOCATED: usize = 1;
/// Free block with a node in the buckets.
const TAG_FREE: usize = 2;
/// Free block too small to carry a node; reclaimed by neighbor merge.
const TAG_FRAGMENT: usize = 3;

/// Sizes are multiples of the alignment (>= 16), leaving the low bits
/// for the tag.
const TAG_MASK: usize = 0xF;

fn split_word(word: usize) -> (usize, usize) {
    (word & !TAG_MASK, word & TAG_MASK)
}

struct CoalesceRegion {
    base: usize,
    /// Total bytes in free and fragment blocks, headers included.
    free_total: usize,
    buckets: BucketArray,
}

/// Best-fit coalescing allocator for one size range.
pub struct CoalesceHeap {
    layer: Arc<MappingLayer>,
    oracle: Arc<SpanOracle>,
    max_size: usize,
    region_size: usize,
    align: usize,
    /// Smallest block that can carry a free node.
    min_block: usize,
    map: BucketMap,
    pool: NodePool,
    /// Append order doubles as age order; allocation scans oldest first.
    regions: Vec<CoalesceRegion>,
    used_bytes: usize,
    allocated_blocks: usize,
    free_blocks: usize,
}

impl CoalesceHeap {
    pub fn new(layer: Arc<MappingLayer>, oracle: Arc<SpanOracle>, config: &CoalesceTierConfig) -> Self {
        let align = config.alignment.max(16);
        let min_block = HEADER_BYTES + align;
        let bucket_hi = align_up(config.max_size, align) + HEADER_BYTES;
        Self {
            layer,
            oracle,
            max_size: config.max_size,
            region_size: config.region_size,
            align,
            min_block,
            map: BucketMap::new(min_block, bucket_hi),
            pool: NodePool::default(),
            regions: Vec::new(),
            used_bytes: 0,
            allocated_blocks: 0,
            free_blocks: 0,
        }
    }

    /// Largest request this tier serves.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Usable bytes of a region once both sentinels are placed.
    fn capacity(&self) -> usize {
        self.region_size - 2 * HEADER_BYTES
    }

    pub fn alloc(&mut self, mem: &VirtualMemory, size: usize) -> Option<usize> {
        let user = align_up(size.max(1), self.align);
        debug_assert!(user <= self.max_size, "dispatcher routed an oversized request");
        let total = user + HEADER_BYTES;

        let (region_idx, node_idx) = match self.find_node(total) {
            Some(found) => found,
            None => {
                self.create_region(mem)?;
                let region_idx = self.regions.len() - 1;
                let node_idx = self.regions[region_idx]
                    .buckets
                    .find(&self.pool, &self.map, total)
                    .expect("fresh region holds any in-range request");
                (region_idx, node_idx)
            }
        };

        self.regions[region_idx]
            .buckets
            .remove(&mut self.pool, node_idx);
        let (block, node_size) = {
            let node = self.pool.get(node_idx);
            (node.block, node.size)
        };
        let offcut = node_size - total;

        let alloc_size = if offcut < HEADER_BYTES {
            // Offcut cannot hold a header: swallow it into the allocation.
            if !self.layer.commit(block, node_size) {
                self.regions[region_idx]
                    .buckets
                    .insert(&mut self.pool, &self.map, node_idx);
                return None;
            }
            mem.write_usize(block, node_size | TAG_ALLOCATED);
            self.pool.release(node_idx);
            self.free_blocks -= 1;
            node_size
        } else {
            // Split: allocation at the low end, offcut keeps the high end.
            let keeps_node = offcut >= self.min_block;
            let commit_len = total + HEADER_BYTES + if keeps_node { WORD } else { 0 };
            if !self.layer.commit(block, commit_len) {
                self.regions[region_idx]
                    .buckets
                    .insert(&mut self.pool, &self.map, node_idx);
                return None;
            }
            mem.write_usize(block, total | TAG_ALLOCATED);
            let offcut_h = block + total;
            mem.write_usize(offcut_h + OFF_PREV, total);
            if keeps_node {
                mem.write_usize(offcut_h, offcut | TAG_FREE);
                {
                    let node = self.pool.get_mut(node_idx);
                    node.block = offcut_h;
                    node.size = offcut;
                }
                mem.write_usize(offcut_h + HEADER_BYTES, node_idx as usize);
                self.regions[region_idx]
                    .buckets
                    .insert(&mut self.pool, &self.map, node_idx);
            } else {
                mem.write_usize(offcut_h, offcut | TAG_FRAGMENT);
                self.pool.release(node_idx);
            }
            // The block after the original free node starts where it
            // always did; only its back link changes.
            mem.write_usize(block + node_size + OFF_PREV, offcut);
            total
        };

        self.regions[region_idx].free_total -= alloc_size;
        self.used_bytes += alloc_size - HEADER_BYTES;
        self.allocated_blocks += 1;
        Some(block + HEADER_BYTES)
    }

    pub fn free(&mut self, mem: &VirtualMemory, ptr: usize) {
        let h = ptr - HEADER_BYTES;
        let region_idx = self
            .region_of(h)
            .unwrap_or_else(|| panic!("coalesce: free of foreign pointer {ptr:#x}"));

        let (size, tag) = split_word(mem.read_usize(h));
        if tag != TAG_ALLOCATED {
            panic!(
                "coalesce: free of non-allocated block at {ptr:#x} (tag {tag}); double free or heap corruption"
            );
        }
        let prev_size = mem.read_usize(h + OFF_PREV);

        let mut start = h;
        let mut merged = size;
        let mut reuse: Option<u32> = None;
        let mut merged_neighbors = 0usize;

        // Forward neighbor; fragments merge like free blocks, they just
        // bring no node with them.
        let next_h = h + size;
        let (next_size, next_tag) = split_word(mem.read_usize(next_h));
        match next_tag {
            TAG_FREE => {
                let idx = self.node_of(mem, next_h, next_size);
                self.regions[region_idx].buckets.remove(&mut self.pool, idx);
                reuse = Some(idx);
                merged += next_size;
                merged_neighbors += 1;
            }
            TAG_FRAGMENT => {
                merged += next_size;
                merged_neighbors += 1;
            }
            _ => {}
        }

        // Backward neighbor via the prev-size back link.
        let prev_h = h - prev_size;
        let (back_size, back_tag) = split_word(mem.read_usize(prev_h));
        debug_assert!(
            back_size == prev_size,
            "coalesce: prev-size back link broken at {h:#x}"
        );
        match back_tag {
            TAG_FREE => {
                let idx = self.node_of(mem, prev_h, back_size);
                self.regions[region_idx].buckets.remove(&mut self.pool, idx);
                if let Some(extra) = reuse.replace(idx) {
                    self.pool.release(extra);
                }
                start = prev_h;
                merged += prev_size;
                merged_neighbors += 1;
            }
            TAG_FRAGMENT => {
                start = prev_h;
                merged += prev_size;
                merged_neighbors += 1;
            }
            _ => {}
        }

        self.used_bytes -= size - HEADER_BYTES;
        self.allocated_blocks -= 1;

        if merged == self.capacity() {
            // Last allocation in the region freed: the whole span is one
            // free block again, so the region goes back to the OS.
            if let Some(idx) = reuse {
                self.pool.release(idx);
            }
            self.free_blocks -= merged_neighbors;
            let base = self.regions[region_idx].base;
            self.oracle.remove_span(base, self.region_size);
            self.regions.remove(region_idx);
            self.layer.release(base);
            log::debug!("coalesce: region {base:#x} emptied and released");
            return;
        }

        mem.write_usize(start, merged | TAG_FREE);
        let idx = match reuse {
            Some(idx) => {
                let node = self.pool.get_mut(idx);
                node.block = start;
                node.size = merged;
                idx
            }
            None => self.pool.alloc(start, merged),
        };
        mem.write_usize(start + HEADER_BYTES, idx as usize);
        mem.write_usize(start + merged + OFF_PREV, merged);
        self.regions[region_idx]
            .buckets
            .insert(&mut self.pool, &self.map, idx);
        self.regions[region_idx].free_total += size;
        self.free_blocks = self.free_blocks + 1 - merged_neighbors;

        // Pages wholly inside the free span go back to the OS (lazily);
        // the header and node word stay committed.
        let keep = HEADER_BYTES + WORD;
        self.layer.decommit(start + keep, merged - keep);
    }

    /// Usable bytes of an allocated block.
    #[must_use]
    pub fn usable_size(&self, mem: &VirtualMemory, ptr: usize) -> usize {
        let h = ptr - HEADER_BYTES;
        let (size, tag) = split_word(mem.read_usize(h));
        assert!(
            tag == TAG_ALLOCATED,
            "coalesce: size query on non-allocated block at {ptr:#x}"
        );
        size - HEADER_BYTES
    }

    /// Ownership check against the region list, valid under the tier
    /// lock; the lock-free path is the shared [`SpanOracle`].
    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.region_of(ptr).is_some()
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn stats(&self) -> TierStats {
        let committed: usize = self
            .regions
            .iter()
            .filter_map(|r| self.layer.vm().committed_in(r.base))
            .sum();
        let overhead =
            (self.allocated_blocks + self.free_blocks + 2 * self.regions.len()) * HEADER_BYTES;
        TierStats {
            used: self.used_bytes,
            unused: committed.saturating_sub(self.used_bytes + overhead),
            overhead,
            reserved: self.regions.len() * self.region_size,
        }
    }

    fn region_of(&self, addr: usize) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| addr >= r.base && addr < r.base + self.region_size)
    }

    /// Resolves a free block's node from the index word after its
    /// header, cross-checking both directions.
    fn node_of(&self, mem: &VirtualMemory, h: usize, size: usize) -> u32 {
        let idx = mem.read_usize(h + HEADER_BYTES) as u32;
        let node = self.pool.get(idx);
        assert!(
            node.block == h && node.size == size,
            "coalesce: free node desync at {h:#x}; heap corruption"
        );
        idx
    }

    /// Oldest-first best-fit search across regions.
    fn find_node(&self, total: usize) -> Option<(usize, u32)> {
        for (region_idx, region) in self.regions.iter().enumerate() {
            if let Some(node_idx) = region.buckets.find(&self.pool, &self.map, total) {
                return Some((region_idx, node_idx));
            }
        }
        None
    }

    fn create_region(&mut self, mem: &VirtualMemory) -> Option<()> {
        let align = self.align.max(stratheap_vm::page_size());
        let base = self.layer.reserve(self.region_size, align)?;
        let trail = base + self.region_size - HEADER_BYTES;
        // Sentinels, the initial free header and its node word are the
        // only bytes that need backing in an empty region.
        if !self.layer.commit(base, 2 * HEADER_BYTES + WORD) || !self.layer.commit(trail, HEADER_BYTES)
        {
            self.layer.release(base);
            return None;
        }
        let capacity = self.capacity();
        mem.write_usize(base, HEADER_BYTES | TAG_FIXED);
        mem.write_usize(base + OFF_PREV, 0);
        let first = base + HEADER_BYTES;
        mem.write_usize(first, capacity | TAG_FREE);
        mem.write_usize(first + OFF_PREV, HEADER_BYTES);
        mem.write_usize(trail, HEADER_BYTES | TAG_FIXED);
        mem.write_usize(trail + OFF_PREV, capacity);

        let node_idx = self.pool.alloc(first, capacity);
        mem.write_usize(first + HEADER_BYTES, node_idx as usize);

        self.oracle.insert_span(base, self.region_size);
        let mut buckets = BucketArray::new();
        buckets.insert(&mut self.pool, &self.map, node_idx);
        self.regions.push(CoalesceRegion {
            base,
            free_total: capacity,
            buckets,
        });
        self.free_blocks += 1;
        log::debug!(
            "coalesce: new region {base:#x} ({:#x} bytes, capacity {capacity:#x})",
            self.region_size
        );
        Some(())
    }

    /// Walks every region's header chain and bucket lists.
    pub fn check_integrity(&self, mem: &VirtualMemory) -> Result<(), IntegrityError> {
        let mut total_nodes = 0usize;
        let mut total_used = 0usize;
        for region in &self.regions {
            let base = region.base;
            let trail = base + self.region_size - HEADER_BYTES;

            let (lead_size, lead_tag) = split_word(mem.read_usize(base));
            if lead_size != HEADER_BYTES || lead_tag != TAG_FIXED {
                return Err(IntegrityError::HeaderChainBroken { base, offset: 0 });
            }

            let mut h = base + HEADER_BYTES;
            let mut prev = HEADER_BYTES;
            let mut prior_was_free = false;
            let mut free_bytes = 0usize;
            let mut noded_blocks = 0usize;
            while h != trail {
                if h > trail {
                    return Err(IntegrityError::HeaderChainBroken {
                        base,
                        offset: h - base,
                    });
                }
                let (size, tag) = split_word(mem.read_usize(h));
                if size == 0 || size % self.align != 0 || tag == TAG_FIXED {
                    return Err(IntegrityError::HeaderChainBroken {
                        base,
                        offset: h - base,
                    });
                }
                if mem.read_usize(h + OFF_PREV) != prev {
                    return Err(IntegrityError::PrevSizeMismatch {
                        base,
                        offset: h - base,
                    });
                }
                let is_free = tag == TAG_FREE || tag == TAG_FRAGMENT;
                if is_free && prior_was_free {
                    return Err(IntegrityError::AdjacentFree {
                        base,
                        offset: h - base,
                    });
                }
                if is_free {
                    free_bytes += size;
                }
                if tag == TAG_FREE {
                    let idx = mem.read_usize(h + HEADER_BYTES) as u32;
                    let node = self.pool.get(idx);
                    if node.block != h || node.size != size {
                        return Err(IntegrityError::NodeHeaderMismatch {
                            node: idx as usize,
                            addr: h,
                        });
                    }
                    noded_blocks += 1;
                }
                if tag == TAG_ALLOCATED {
                    total_used += size - HEADER_BYTES;
                }
                prior_was_free = is_free;
                prev = size;
                h += size;
            }
            let (trail_size, trail_tag) = split_word(mem.read_usize(trail));
            if trail_size != HEADER_BYTES || trail_tag != TAG_FIXED {
                return Err(IntegrityError::HeaderChainBroken {
                    base,
                    offset: trail - base,
                });
            }
            if mem.read_usize(trail + OFF_PREV) != prev {
                return Err(IntegrityError::PrevSizeMismatch {
                    base,
                    offset: trail - base,
                });
            }
            if free_bytes != region.free_total {
                return Err(IntegrityError::FreeAccountingMismatch {
                    nodes: free_bytes,
                    regions: region.free_total,
                });
            }

            // Bucket lists: sorted, bound to this region, counts agree
            // with the chain walk.
            let mut bucket_nodes = 0usize;
            for bucket in 0..NUM_BUCKETS {
                let nodes = region.buckets.bucket_nodes(&self.pool, bucket);
                let mut last: Option<(usize, usize)> = None;
                for &idx in &nodes {
                    let node = self.pool.get(idx);
                    if node.block < base || node.block >= base + self.region_size {
                        return Err(IntegrityError::NodeHeaderMismatch {
                            node: idx as usize,
                            addr: node.block,
                        });
                    }
                    let key = if bucket == NUM_BUCKETS - 1 {
                        (node.block, 0)
                    } else {
                        (node.size, node.block)
                    };
                    if let Some(prev_key) = last
                        && prev_key > key
                    {
                        return Err(IntegrityError::BucketOrder {
                            bucket,
                            node: idx as usize,
                        });
                    }
                    last = Some(key);
                }
                bucket_nodes += nodes.len();
            }
            if bucket_nodes != noded_blocks {
                return Err(IntegrityError::FreeAccountingMismatch {
                    nodes: bucket_nodes,
                    regions: noded_blocks,
                });
            }
            total_nodes += bucket_nodes;
        }
        if total_nodes != self.pool.live_count() {
            return Err(IntegrityError::FreeAccountingMismatch {
                nodes: self.pool.live_count(),
                regions: total_nodes,
            });
        }
        if total_used != self.used_bytes {
            return Err(IntegrityError::FreeAccountingMismatch {
                nodes: total_used,
                regions: self.used_bytes,
            });
        }
        Ok(())
    }
}
