//! The symbolic link graph: sections owning blocks of bytes, symbols naming
//! positions within blocks (or nothing, for externals) and typed edges
//! recording relocations between them.
//!
//! The graph is an arena. Entities are referred to by id newtypes; removal is
//! expressed by marking blocks dead so that ids stay stable across pruning.

use crate::error::Result;
use anyhow::bail;
use linker_utils::aarch64::EdgeKind;
use linker_utils::macho::Prot;
use std::borrow::Cow;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SectionId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl SymbolId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A named group of blocks sharing memory protection in the final image.
pub struct Section {
    pub name: String,
    pub prot: Prot,
    blocks: Vec<BlockId>,
}

impl Section {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }
}

/// A contiguous range of bytes with an address, owned by a section. The
/// address is the object-file address until the allocator reassigns it.
pub struct Block<'data> {
    section: SectionId,
    address: u64,
    content: Cow<'data, [u8]>,
    alignment: u64,
    edges: Vec<Edge>,
    dead: bool,
}

impl<'data> Block<'data> {
    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn end_address(&self) -> u64 {
        self.address + self.size()
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edges_mut(&mut self) -> &mut [Edge] {
        &mut self.edges
    }

    pub fn add_edge(&mut self, kind: EdgeKind, offset: u64, target: SymbolId, addend: i64) {
        self.edges.push(Edge {
            kind,
            offset,
            target,
            addend,
        });
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

/// A relocation at (block, byte offset) against a target symbol.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub kind: EdgeKind,
    pub offset: u64,
    pub target: SymbolId,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Local,
    Global,
}

enum SymbolValue {
    Defined { block: BlockId, offset: u64 },
    External { resolved_address: Option<u64> },
}

/// A named or anonymous reference to a position within a block, or an
/// unresolved external.
pub struct Symbol<'data> {
    name: Option<Cow<'data, str>>,
    value: SymbolValue,
    size: u64,
    scope: SymbolScope,
    callable: bool,
    live: bool,
}

impl<'data> Symbol<'data> {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.value, SymbolValue::Defined { .. })
    }

    pub fn block(&self) -> Option<BlockId> {
        match self.value {
            SymbolValue::Defined { block, .. } => Some(block),
            SymbolValue::External { .. } => None,
        }
    }

    pub fn offset_in_block(&self) -> u64 {
        match self.value {
            SymbolValue::Defined { offset, .. } => offset,
            SymbolValue::External { .. } => 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn scope(&self) -> SymbolScope {
        self.scope
    }

    pub fn is_callable(&self) -> bool {
        self.callable
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name().unwrap_or("<anonymous>"))
    }
}

/// The closed collection of sections, blocks and symbols for one link
/// invocation, plus the factory operations that mint new ones.
#[derive(Default)]
pub struct LinkGraph<'data> {
    sections: Vec<Section>,
    blocks: Vec<Block<'data>>,
    symbols: Vec<Symbol<'data>>,
}

impl<'data> LinkGraph<'data> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, name: &str, prot: Prot) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(Section {
            name: name.to_owned(),
            prot,
            blocks: Vec::new(),
        });
        id
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|section| section.name == name)
            .map(|i| SectionId(i as u32))
    }

    pub fn add_content_block(
        &mut self,
        section: SectionId,
        content: Cow<'data, [u8]>,
        address: u64,
        alignment: u64,
    ) -> BlockId {
        debug_assert!(alignment.is_power_of_two());
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            section,
            address,
            content,
            alignment,
            edges: Vec::new(),
            dead: false,
        });
        self.sections[section.as_usize()].blocks.push(id);
        id
    }

    pub fn add_defined_symbol(
        &mut self,
        name: Option<Cow<'data, str>>,
        block: BlockId,
        offset: u64,
        size: u64,
        scope: SymbolScope,
        callable: bool,
        live: bool,
    ) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name,
            value: SymbolValue::Defined { block, offset },
            size,
            scope,
            callable,
            live,
        });
        id
    }

    /// Registers an anonymous local symbol at `offset` within `block`. Used
    /// for synthesized GOT entries, stubs and CFI records.
    pub fn add_anonymous_symbol(
        &mut self,
        block: BlockId,
        offset: u64,
        size: u64,
        callable: bool,
        live: bool,
    ) -> SymbolId {
        self.add_defined_symbol(None, block, offset, size, SymbolScope::Local, callable, live)
    }

    pub fn add_external_symbol(&mut self, name: Cow<'data, str>) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: Some(name),
            value: SymbolValue::External {
                resolved_address: None,
            },
            size: 0,
            scope: SymbolScope::Global,
            callable: false,
            live: false,
        });
        id
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.as_usize()]
    }

    pub fn block(&self, id: BlockId) -> &Block<'data> {
        &self.blocks[id.as_usize()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block<'data> {
        &mut self.blocks[id.as_usize()]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.as_usize()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len() as u32).map(SectionId)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Blocks that survived pruning, in creation order.
    pub fn live_block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_ids().filter(|id| !self.block(*id).is_dead())
    }

    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    /// The final address of a symbol. For defined symbols this follows the
    /// owning block's (possibly reassigned) address; externals must have been
    /// resolved first.
    pub fn symbol_address(&self, id: SymbolId) -> Result<u64> {
        let symbol = self.symbol(id);
        match symbol.value {
            SymbolValue::Defined { block, offset } => Ok(self.block(block).address() + offset),
            SymbolValue::External { resolved_address } => match resolved_address {
                Some(address) => Ok(address),
                None => bail!(crate::error::LinkError::SymbolNotFound(format!(
                    "external symbol {symbol} has not been resolved"
                ))),
            },
        }
    }

    pub fn set_resolved_address(&mut self, id: SymbolId, address: u64) {
        if let SymbolValue::External { resolved_address } = &mut self.symbols[id.as_usize()].value {
            *resolved_address = Some(address);
        }
    }

    pub fn set_block_address(&mut self, id: BlockId, address: u64) {
        self.blocks[id.as_usize()].address = address;
    }

    pub fn mark_block_dead(&mut self, id: BlockId) {
        self.blocks[id.as_usize()].dead = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_operations() {
        let mut graph = LinkGraph::new();
        let text = graph.add_section("__text", Prot::RX);
        let block = graph.add_content_block(text, Cow::Owned(vec![0; 16]), 0x1000, 4);
        let symbol = graph.add_defined_symbol(
            Some("_f".into()),
            block,
            8,
            8,
            SymbolScope::Global,
            true,
            false,
        );
        assert_eq!(graph.symbol_address(symbol).unwrap(), 0x1008);
        assert_eq!(graph.block(block).end_address(), 0x1010);
        assert_eq!(graph.section(text).blocks(), &[block]);

        graph.set_block_address(block, 0x5000);
        assert_eq!(graph.symbol_address(symbol).unwrap(), 0x5008);
    }

    #[test]
    fn test_external_symbol_resolution() {
        let mut graph = LinkGraph::new();
        let external = graph.add_external_symbol("_puts".into());
        assert!(graph.symbol_address(external).is_err());
        graph.set_resolved_address(external, 0x7fff_0000);
        assert_eq!(graph.symbol_address(external).unwrap(), 0x7fff_0000);
    }
}
