//! The pass pipeline around the core: pass configuration and the context
//! trait the host implements, the mark-live fallback, dead-stripping, and
//! address allocation with per-block working memory.

use crate::error::Result;
use crate::graph::BlockId;
use crate::graph::LinkGraph;
use crate::graph::SectionId;
use anyhow::Context;
use linker_utils::aarch64::PAGE_SIZE;
use linker_utils::macho::Prot;
use std::fmt::Display;
use std::ops::Range;
use tracing::debug;

/// The target a graph is linked for. Contexts use this to decide whether to
/// register their own passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triple {
    Arm64AppleDarwin,
}

impl Display for Triple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Triple::Arm64AppleDarwin => f.write_str("arm64-apple-darwin"),
        }
    }
}

/// A graph transformation run at a fixed point in the pipeline.
pub type Pass<'data> = Box<dyn FnMut(&mut LinkGraph<'data>) -> Result + 'data>;

#[derive(Default)]
pub struct PassConfiguration<'data> {
    /// Run before dead-stripping; at least one of these must establish
    /// liveness roots.
    pub pre_prune_passes: Vec<Pass<'data>>,
    /// Run after dead-stripping, before allocation. GOT/stub synthesis lives
    /// here.
    pub post_prune_passes: Vec<Pass<'data>>,
}

/// What the host supplies to a link invocation: pass hooks, external symbol
/// resolution and memory.
pub trait JitLinkContext<'data> {
    fn should_add_default_target_passes(&self, _triple: Triple) -> bool {
        true
    }

    /// A pass establishing liveness roots. When `None`, every symbol is
    /// marked live.
    fn get_mark_live_pass(&self, _triple: Triple) -> Option<Pass<'data>> {
        None
    }

    fn modify_pass_config(
        &mut self,
        _triple: Triple,
        _config: &mut PassConfiguration<'data>,
    ) -> Result {
        Ok(())
    }

    /// Resolves external symbols to absolute addresses in the host process,
    /// one address per name, in order.
    fn lookup(&mut self, names: &[&str]) -> Result<Vec<u64>>;

    fn allocator(&mut self) -> &mut dyn Allocator;

    /// Called with the error before a failed link returns it.
    fn notify_failed(&mut self, _error: &crate::error::Error) {}
}

/// The fallback mark-live pass: keeps everything.
pub fn mark_all_symbols_live(graph: &mut LinkGraph) {
    for id in graph.symbol_ids() {
        graph.symbol_mut(id).set_live(true);
    }
}

/// Dead-strips the graph: blocks reachable from live symbols (transitively,
/// via edges) survive; everything else is marked dead and ignored from here
/// on.
pub fn prune(graph: &mut LinkGraph) {
    let mut live = vec![false; graph.num_blocks()];
    let mut worklist: Vec<BlockId> = Vec::new();

    for id in graph.symbol_ids() {
        let symbol = graph.symbol(id);
        if symbol.is_live() {
            if let Some(block) = symbol.block() {
                if !std::mem::replace(&mut live[block.as_usize()], true) {
                    worklist.push(block);
                }
            }
        }
    }

    while let Some(block_id) = worklist.pop() {
        for edge in graph.block(block_id).edges() {
            if let Some(target_block) = graph.symbol(edge.target).block() {
                if !std::mem::replace(&mut live[target_block.as_usize()], true) {
                    worklist.push(target_block);
                }
            }
        }
    }

    let mut dead = 0_usize;
    for block_id in graph.block_ids() {
        if !live[block_id.as_usize()] {
            graph.mark_block_dead(block_id);
            dead += 1;
        }
    }
    if dead > 0 {
        debug!("pruned {dead} dead blocks");
    }
}

/// Assigns final addresses to live blocks and provides the writable working
/// memory the fixup encoder runs over. The finalized memory is handed back to
/// the host, which owns mapping and protection.
pub trait Allocator {
    fn allocate(&mut self, graph: &mut LinkGraph) -> Result<Allocation>;
}

/// Working memory for the whole image. Addresses map 1:1 onto offsets from
/// `base`.
#[derive(Debug)]
pub struct Allocation {
    base: u64,
    memory: Vec<u8>,
    block_ranges: Vec<Option<Range<usize>>>,
    segments: Vec<(Prot, Range<usize>)>,
}

impl Allocation {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// The page-aligned protection segments of the image, for the host to
    /// apply when installing it.
    pub fn segments(&self) -> &[(Prot, Range<usize>)] {
        &self.segments
    }

    pub fn block_mem_mut(&mut self, block: BlockId) -> &mut [u8] {
        let range = self.block_ranges[block.as_usize()]
            .clone()
            .expect("block was not allocated");
        &mut self.memory[range]
    }

    pub fn bytes_at(&self, address: u64, len: usize) -> Option<&[u8]> {
        let offset = address.checked_sub(self.base)? as usize;
        self.memory.get(offset..offset + len)
    }
}

/// Lays the image out as one contiguous span from a fixed base: sections are
/// grouped by protection, each group starting on a fresh page so the host can
/// mprotect the segments independently.
pub struct BumpAllocator {
    pub base: u64,
}

impl BumpAllocator {
    pub fn new(base: u64) -> Self {
        BumpAllocator { base }
    }
}

impl Allocator for BumpAllocator {
    fn allocate(&mut self, graph: &mut LinkGraph) -> Result<Allocation> {
        let mut block_ranges = vec![None; graph.num_blocks()];
        let mut memory = Vec::new();
        let mut address = self.base;
        let mut segments = Vec::new();

        for prot in [Prot::RX, Prot::R, Prot::RW] {
            let sections: Vec<SectionId> = graph
                .section_ids()
                .filter(|id| graph.section(*id).prot == prot)
                .collect();
            let blocks: Vec<BlockId> = sections
                .iter()
                .flat_map(|id| graph.section(*id).blocks())
                .copied()
                .filter(|id| !graph.block(*id).is_dead())
                .collect();
            if blocks.is_empty() {
                continue;
            }

            address = address.next_multiple_of(PAGE_SIZE);
            let segment_start = (address - self.base) as usize;

            for block_id in blocks {
                let block = graph.block(block_id);
                address = address.next_multiple_of(block.alignment());
                let offset = (address - self.base) as usize;
                let size = block.size() as usize;
                memory.resize(offset + size, 0);
                memory[offset..offset + size].copy_from_slice(block.content());
                block_ranges[block_id.as_usize()] = Some(offset..offset + size);
                let end = address
                    .checked_add(size as u64)
                    .context("image layout overflows the address space")?;
                debug!(
                    "placed block at {address:#x}..{end:#x} in {}",
                    graph.section(block.section()).name
                );
                graph.set_block_address(block_id, address);
                address = end;
            }
            segments.push((prot, segment_start..(address - self.base) as usize));
        }

        Ok(Allocation {
            base: self.base,
            memory,
            block_ranges,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linker_utils::aarch64::EdgeKind;
    use std::borrow::Cow;

    #[test]
    fn test_prune_keeps_reachable_blocks() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let root = graph.add_content_block(text, Cow::Owned(vec![0; 8]), 0x0, 4);
        let reached = graph.add_content_block(text, Cow::Owned(vec![0; 8]), 0x8, 4);
        let dead = graph.add_content_block(text, Cow::Owned(vec![0; 8]), 0x10, 4);

        let main = graph.add_defined_symbol(
            Some("_main".into()),
            root,
            0,
            8,
            crate::graph::SymbolScope::Global,
            true,
            true,
        );
        let helper = graph.add_anonymous_symbol(reached, 0, 8, true, false);
        graph.add_anonymous_symbol(dead, 0, 8, true, false);
        graph.block_mut(root).add_edge(EdgeKind::Branch26, 0, helper, 0);

        prune(&mut graph);

        assert!(!graph.block(root).is_dead());
        assert!(!graph.block(reached).is_dead());
        assert!(graph.block(dead).is_dead());
        assert!(graph.symbol(main).is_live());
    }

    #[test]
    fn test_bump_allocator_layout() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let code = graph.add_content_block(text, Cow::Owned(vec![0xaa; 6]), 0, 4);
        let code2 = graph.add_content_block(text, Cow::Owned(vec![0xbb; 4]), 6, 4);
        let data = graph.add_section("__data", Prot::RW);
        let bytes = graph.add_content_block(data, Cow::Owned(vec![0xcc; 8]), 8, 8);

        let mut allocator = BumpAllocator::new(0x10000);
        let allocation = allocator.allocate(&mut graph).unwrap();

        // Blocks keep their alignment; protection groups start on new pages.
        assert_eq!(graph.block(code).address(), 0x10000);
        assert_eq!(graph.block(code2).address(), 0x10008);
        assert_eq!(graph.block(bytes).address(), 0x11000);
        assert_eq!(allocation.bytes_at(0x10000, 6).unwrap(), &[0xaa; 6]);
        assert_eq!(allocation.bytes_at(0x11000, 8).unwrap(), &[0xcc; 8]);
        assert_eq!(
            allocation.segments(),
            &[(Prot::RX, 0x0..0xc), (Prot::RW, 0x1000..0x1008)]
        );
    }
}
