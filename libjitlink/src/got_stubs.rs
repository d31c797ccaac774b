//! Post-prune GOT and stub synthesis. Walks every edge in the graph; edges
//! that need GOT indirection are retargeted at a synthesized 8-byte GOT entry,
//! and branches to external symbols are retargeted at a synthesized trampoline
//! that loads the destination from the target's GOT entry.

use crate::error::Result;
use crate::graph::BlockId;
use crate::graph::LinkGraph;
use crate::graph::SectionId;
use crate::graph::SymbolId;
use linker_utils::aarch64::EdgeKind;
use linker_utils::aarch64::BR_X16;
use linker_utils::aarch64::LDR_X16_SELF_LITERAL;
use linker_utils::macho::Prot;
use std::borrow::Cow;
use tracing::debug;

pub const GOT_SECTION_NAME: &str = "$__GOT";
pub const STUBS_SECTION_NAME: &str = "$__STUBS";

const GOT_ENTRY_SIZE: u64 = 8;
const STUB_SIZE: u64 = 8;

/// `ldr x16, <literal at +0>; br x16`. The LDRLiteral19 edge at offset 0
/// points the load at the target's GOT entry.
fn stub_content() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(STUB_SIZE as usize);
    bytes.extend_from_slice(&LDR_X16_SELF_LITERAL.to_le_bytes());
    bytes.extend_from_slice(&BR_X16.to_le_bytes());
    bytes
}

#[derive(Default)]
struct GotStubsBuilder {
    got_section: Option<SectionId>,
    stubs_section: Option<SectionId>,
    got_entries: foldhash::HashMap<SymbolId, SymbolId>,
    stubs: foldhash::HashMap<SymbolId, SymbolId>,
}

pub fn synthesize_got_and_stubs(graph: &mut LinkGraph) -> Result {
    let mut builder = GotStubsBuilder::default();
    // Snapshot the block list: blocks created during the walk hold edges that
    // must not be rewritten again.
    let block_ids: Vec<BlockId> = graph.live_block_ids().collect();
    for block_id in block_ids {
        for edge_index in 0..graph.block(block_id).edges().len() {
            let edge = graph.block(block_id).edges()[edge_index];
            match edge.kind {
                // The fixup encoder treats these like Page21/PageOffset12, so
                // retargeting at the GOT entry is all that's needed.
                EdgeKind::GotPage21 | EdgeKind::GotPageOffset12 => {
                    let entry = builder.got_entry(graph, edge.target);
                    graph.block_mut(block_id).edges_mut()[edge_index].target = entry;
                }
                EdgeKind::PointerToGot => {
                    let entry = builder.got_entry(graph, edge.target);
                    let edge = &mut graph.block_mut(block_id).edges_mut()[edge_index];
                    edge.target = entry;
                    edge.kind = EdgeKind::Delta32;
                }
                EdgeKind::Branch26 if !graph.symbol(edge.target).is_defined() => {
                    let stub = builder.stub(graph, edge.target);
                    graph.block_mut(block_id).edges_mut()[edge_index].target = stub;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

impl GotStubsBuilder {
    /// Returns the GOT entry symbol for `target`, creating it on first use:
    /// an 8-byte zeroed block holding a single Pointer64 edge to the real
    /// target.
    fn got_entry(&mut self, graph: &mut LinkGraph, target: SymbolId) -> SymbolId {
        if let Some(&entry) = self.got_entries.get(&target) {
            return entry;
        }
        let section = *self
            .got_section
            .get_or_insert_with(|| graph.add_section(GOT_SECTION_NAME, Prot::R));
        let block = graph.add_content_block(
            section,
            Cow::Owned(vec![0; GOT_ENTRY_SIZE as usize]),
            0,
            GOT_ENTRY_SIZE,
        );
        graph
            .block_mut(block)
            .add_edge(EdgeKind::Pointer64, 0, target, 0);
        let entry = graph.add_anonymous_symbol(block, 0, GOT_ENTRY_SIZE, false, false);
        debug!("created GOT entry for {}", graph.symbol(target));
        self.got_entries.insert(target, entry);
        entry
    }

    /// Returns the stub symbol for `target`, creating it (and the GOT entry
    /// it loads from) on first use.
    fn stub(&mut self, graph: &mut LinkGraph, target: SymbolId) -> SymbolId {
        if let Some(&stub) = self.stubs.get(&target) {
            return stub;
        }
        let got_entry = self.got_entry(graph, target);
        let section = *self
            .stubs_section
            .get_or_insert_with(|| graph.add_section(STUBS_SECTION_NAME, Prot::RX));
        let block = graph.add_content_block(section, Cow::Owned(stub_content()), 0, 4);
        graph
            .block_mut(block)
            .add_edge(EdgeKind::LdrLiteral19, 0, got_entry, 0);
        let stub = graph.add_anonymous_symbol(block, 0, STUB_SIZE, true, false);
        debug!("created stub for {}", graph.symbol(target));
        self.stubs.insert(target, stub);
        stub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;

    fn edge_at(graph: &LinkGraph, block: BlockId, index: usize) -> Edge {
        graph.block(block).edges()[index]
    }

    #[test]
    fn test_got_edges_share_one_entry() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let block = graph.add_content_block(text, Cow::Owned(vec![0; 16]), 0x1000, 4);
        let x = graph.add_external_symbol("_x".into());
        graph.block_mut(block).add_edge(EdgeKind::GotPage21, 0, x, 0);
        graph.block_mut(block).add_edge(EdgeKind::GotPageOffset12, 4, x, 0);
        graph.block_mut(block).add_edge(EdgeKind::PointerToGot, 8, x, 0);

        synthesize_got_and_stubs(&mut graph).unwrap();

        let got = graph.section_by_name(GOT_SECTION_NAME).unwrap();
        assert_eq!(graph.section(got).blocks().len(), 1);

        let entry_block = graph.section(got).blocks()[0];
        let entry_edges = graph.block(entry_block).edges();
        assert_eq!(entry_edges.len(), 1);
        assert_eq!(entry_edges[0].kind, EdgeKind::Pointer64);
        assert_eq!(entry_edges[0].target, x);

        // All three edges now point at the same GOT entry symbol; the page
        // forms keep their kind, PointerToGOT becomes Delta32.
        let e0 = edge_at(&graph, block, 0);
        let e1 = edge_at(&graph, block, 1);
        let e2 = edge_at(&graph, block, 2);
        assert_eq!(e0.kind, EdgeKind::GotPage21);
        assert_eq!(e1.kind, EdgeKind::GotPageOffset12);
        assert_eq!(e2.kind, EdgeKind::Delta32);
        assert_eq!(e0.target, e1.target);
        assert_eq!(e1.target, e2.target);
        assert_eq!(graph.symbol(e0.target).block(), Some(entry_block));
    }

    #[test]
    fn test_external_branch_gets_stub_reusing_got_entry() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let caller =
            graph.add_content_block(text, Cow::Owned(vec![0x00, 0x00, 0x00, 0x94]), 0x1000, 4);
        let puts = graph.add_external_symbol("_puts".into());
        graph.block_mut(caller).add_edge(EdgeKind::Branch26, 0, puts, 0);
        // A second branch to the same target must reuse the stub.
        graph.block_mut(caller).add_edge(EdgeKind::Branch26, 0, puts, 0);

        synthesize_got_and_stubs(&mut graph).unwrap();

        let stubs = graph.section_by_name(STUBS_SECTION_NAME).unwrap();
        assert_eq!(graph.section(stubs).blocks().len(), 1);
        let stub_block = graph.section(stubs).blocks()[0];
        assert_eq!(
            graph.block(stub_block).content(),
            &[0x10, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1f, 0xd6]
        );

        let branch = edge_at(&graph, caller, 0);
        assert_eq!(branch.kind, EdgeKind::Branch26);
        assert_eq!(graph.symbol(branch.target).block(), Some(stub_block));
        assert_eq!(branch.target, edge_at(&graph, caller, 1).target);

        // The stub's literal load points at the target's GOT entry, which in
        // turn holds a Pointer64 to the real target.
        let ldr = edge_at(&graph, stub_block, 0);
        assert_eq!(ldr.kind, EdgeKind::LdrLiteral19);
        let got_block = graph.symbol(ldr.target).block().unwrap();
        let pointer = edge_at(&graph, got_block, 0);
        assert_eq!(pointer.kind, EdgeKind::Pointer64);
        assert_eq!(pointer.target, puts);
    }

    #[test]
    fn test_branch_to_defined_symbol_is_untouched() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let caller =
            graph.add_content_block(text, Cow::Owned(vec![0x00, 0x00, 0x00, 0x94]), 0x1000, 4);
        let callee = graph.add_content_block(text, Cow::Owned(vec![0; 4]), 0x1004, 4);
        let g = graph.add_defined_symbol(
            Some("_g".into()),
            callee,
            0,
            4,
            crate::graph::SymbolScope::Global,
            true,
            true,
        );
        graph.block_mut(caller).add_edge(EdgeKind::Branch26, 0, g, 0);

        synthesize_got_and_stubs(&mut graph).unwrap();

        assert!(graph.section_by_name(STUBS_SECTION_NAME).is_none());
        assert_eq!(edge_at(&graph, caller, 0).target, g);
    }
}
