//! Builds the link graph from a parsed Mach-O object. Sections become graph
//! sections, section contents are split into blocks at symbol boundaries, and
//! relocation records become typed edges, including the paired
//! SUBTRACTOR/UNSIGNED and ADDEND forms.

use crate::aarch64::classify_relocation;
use crate::eh_frame;
use crate::error::LinkError;
use crate::error::Result;
use crate::graph::BlockId;
use crate::graph::LinkGraph;
use crate::graph::SectionId;
use crate::graph::SymbolId;
use crate::graph::SymbolScope;
use crate::macho::ObjectFile;
use anyhow::bail;
use anyhow::ensure;
use itertools::Itertools;
use linker_utils::aarch64::is_adrp;
use linker_utils::aarch64::is_b_or_bl;
use linker_utils::aarch64::is_ldr64_imm;
use linker_utils::aarch64::EdgeKind;
use linker_utils::macho::Prot;
use object::macho;
use object::macho::RelocationInfo;
use object::LittleEndian;
use std::borrow::Cow;
use tracing::debug;

/// Hook type for sections whose edges can't be recovered from relocation
/// records and need bespoke parsing (only `__eh_frame` today).
type SectionParser<'data> = fn(&mut GraphBuilder<'data>, usize) -> Result;

pub(crate) struct GraphBuilder<'data> {
    pub(crate) object: ObjectFile<'data>,
    pub(crate) graph: LinkGraph<'data>,
    /// Graph section per object section; None for custom-parsed sections.
    graph_sections: Vec<Option<SectionId>>,
    /// Graph symbol per nlist entry; None for entries that produce no symbol
    /// (stabs).
    symbols_by_index: Vec<Option<SymbolId>>,
    pub(crate) address_index: AddressIndex,
    custom_parsers: Vec<(&'static str, SectionParser<'data>)>,
}

/// Defined symbols ordered by address, for recovering the symbol (and hence
/// block) covering an arbitrary address.
#[derive(Default)]
pub(crate) struct AddressIndex {
    entries: Vec<(u64, SymbolId)>,
}

impl AddressIndex {
    fn insert(&mut self, address: u64, symbol: SymbolId) {
        self.entries.push((address, symbol));
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|(address, _)| *address);
    }

    pub(crate) fn find(&self, graph: &LinkGraph, address: u64) -> Result<SymbolId> {
        let i = self.entries.partition_point(|(a, _)| *a <= address);
        let not_found = || -> crate::error::Error {
            LinkError::SymbolNotFound(format!("no symbol covering address {address:#x}")).into()
        };
        let &(_, symbol) = self.entries.get(i.wrapping_sub(1)).ok_or_else(not_found)?;
        let block = graph
            .symbol(symbol)
            .block()
            .expect("address index only holds defined symbols");
        if address >= graph.block(block).end_address() {
            return Err(not_found());
        }
        Ok(symbol)
    }
}

struct DefinedSym<'data> {
    nlist_index: usize,
    address: u64,
    name: &'data str,
    is_external: bool,
    is_alt_entry: bool,
}

pub(crate) fn build_graph(object: ObjectFile<'_>) -> Result<LinkGraph<'_>> {
    let mut builder = GraphBuilder::new(object);
    builder.graphify()?;
    builder.address_index.sort();
    builder.run_custom_parsers()?;
    builder.add_relocations()?;
    Ok(builder.graph)
}

impl<'data> GraphBuilder<'data> {
    fn new(object: ObjectFile<'data>) -> Self {
        let num_sections = object.sections.len();
        let num_symbols = object.symbols.len();
        let mut builder = GraphBuilder {
            object,
            graph: LinkGraph::new(),
            graph_sections: vec![None; num_sections],
            symbols_by_index: vec![None; num_symbols],
            address_index: AddressIndex::default(),
            custom_parsers: Vec::new(),
        };
        builder.add_custom_section_parser("__eh_frame", eh_frame::parse_eh_frame_section);
        builder
    }

    fn add_custom_section_parser(&mut self, name: &'static str, parser: SectionParser<'data>) {
        self.custom_parsers.push((name, parser));
    }

    fn custom_parser_for(&self, name: &str) -> Option<SectionParser<'data>> {
        self.custom_parsers
            .iter()
            .find(|(parser_name, _)| *parser_name == name)
            .map(|(_, parser)| *parser)
    }

    /// Creates graph sections, splits section contents into blocks at symbol
    /// boundaries and registers all symbols.
    fn graphify(&mut self) -> Result {
        let e = LittleEndian;

        for index in 0..self.object.sections.len() {
            let section = &self.object.sections[index];
            if self.custom_parser_for(section.name).is_some() {
                continue;
            }
            let prot = if section.has_instructions() {
                Prot::RX
            } else {
                Prot::RW
            };
            debug!(
                "graphifying section {},{} with prot {prot}",
                section.segment_name, section.name
            );
            let name = section.name;
            self.graph_sections[index] = Some(self.graph.add_section(name, prot));
        }

        let mut defined: Vec<Vec<DefinedSym<'data>>> = Vec::new();
        defined.resize_with(self.object.sections.len(), Vec::new);

        let symbols = self.object.symbols;
        for (index, nlist) in symbols.iter().enumerate() {
            if nlist.n_type & macho::N_STAB != 0 {
                continue;
            }
            let name = self.object.symbol_name(nlist)?;
            match nlist.n_type & macho::N_TYPE {
                macho::N_UNDF => {
                    ensure!(
                        nlist.n_value.get(e) == 0,
                        "common symbol {name} is not supported"
                    );
                    self.symbols_by_index[index] =
                        Some(self.graph.add_external_symbol(Cow::Borrowed(name)));
                }
                macho::N_SECT => {
                    let ordinal = usize::from(nlist.n_sect);
                    ensure!(
                        (1..=self.object.sections.len()).contains(&ordinal),
                        "symbol {name} names invalid section ordinal {ordinal}"
                    );
                    defined[ordinal - 1].push(DefinedSym {
                        nlist_index: index,
                        address: nlist.n_value.get(e),
                        name,
                        is_external: nlist.n_type & macho::N_EXT != 0,
                        is_alt_entry: nlist.n_desc.get(e) & macho::N_ALT_ENTRY != 0,
                    });
                }
                n_type => bail!("unsupported symbol type {n_type:#x} for {name}"),
            }
        }

        for (section_index, syms) in defined.into_iter().enumerate() {
            self.graphify_section(section_index, syms)?;
        }
        Ok(())
    }

    fn graphify_section(
        &mut self,
        section_index: usize,
        mut syms: Vec<DefinedSym<'data>>,
    ) -> Result {
        let section = &self.object.sections[section_index];
        let section_address = section.address;
        let section_end = section_address + section.size;
        let is_zerofill = section.is_zerofill;
        let content = section.content;
        let section_alignment = section.alignment;
        let callable = section.has_instructions();
        let section_name = section.name;

        let Some(graph_section) = self.graph_sections[section_index] else {
            ensure!(
                syms.is_empty(),
                "section {section_name} is custom-parsed but defines symbols"
            );
            return Ok(());
        };

        syms.sort_by_key(|sym| sym.address);
        for sym in &syms {
            ensure!(
                (section_address..=section_end).contains(&sym.address),
                "symbol {} lies outside section {section_name}",
                sym.name
            );
        }
        if section.size == 0 {
            ensure!(
                syms.is_empty(),
                "section {section_name} is empty but defines symbols"
            );
            return Ok(());
        }

        // Alt-entry symbols don't start a new block; everything else splits
        // the section.
        let mut boundaries: Vec<u64> = syms
            .iter()
            .filter(|sym| !sym.is_alt_entry && sym.address < section_end)
            .map(|sym| sym.address)
            .dedup()
            .collect();
        if boundaries.first().copied() != Some(section_address) {
            boundaries.insert(0, section_address);
        }

        let mut blocks: Vec<(u64, BlockId)> = Vec::with_capacity(boundaries.len());
        for (i, &start) in boundaries.iter().enumerate() {
            let end = boundaries.get(i + 1).copied().unwrap_or(section_end);
            let block_content = if is_zerofill {
                Cow::Owned(vec![0_u8; (end - start) as usize])
            } else {
                Cow::Borrowed(
                    &content[(start - section_address) as usize..(end - section_address) as usize],
                )
            };
            let alignment = if start == section_address {
                section_alignment
            } else {
                1_u64
                    << start
                        .trailing_zeros()
                        .min(section_alignment.trailing_zeros())
            };
            let block = self
                .graph
                .add_content_block(graph_section, block_content, start, alignment);
            blocks.push((start, block));
        }

        let mut named_starts = foldhash::HashSet::default();
        for (i, sym) in syms.iter().enumerate() {
            let slot = blocks.partition_point(|(address, _)| *address <= sym.address) - 1;
            let (block_start, block) = blocks[slot];
            let size_end = syms[i + 1..]
                .iter()
                .map(|next| next.address)
                .find(|address| *address > sym.address)
                .unwrap_or(section_end);
            let scope = if sym.is_external {
                SymbolScope::Global
            } else {
                SymbolScope::Local
            };
            let id = self.graph.add_defined_symbol(
                Some(Cow::Borrowed(sym.name)),
                block,
                sym.address - block_start,
                size_end - sym.address,
                scope,
                callable,
                false,
            );
            self.symbols_by_index[sym.nlist_index] = Some(id);
            self.address_index.insert(sym.address, id);
            if !sym.is_alt_entry {
                named_starts.insert(sym.address);
            }
        }

        // Content before the first symbol (or a fully anonymous section)
        // still needs a symbol so that address lookups can reach its block.
        for &(start, block) in &blocks {
            if !named_starts.contains(&start) {
                let size = self.graph.block(block).size();
                let id = self.graph.add_anonymous_symbol(block, 0, size, callable, false);
                self.address_index.insert(start, id);
            }
        }
        Ok(())
    }

    fn run_custom_parsers(&mut self) -> Result {
        for index in 0..self.object.sections.len() {
            if let Some(parser) = self.custom_parser_for(self.object.sections[index].name) {
                parser(self, index)?;
            }
        }
        Ok(())
    }

    fn add_relocations(&mut self) -> Result {
        for section_index in 0..self.object.sections.len() {
            self.add_section_relocations(section_index)?;
        }
        Ok(())
    }

    /// Walks one section's relocation records in file order. SUBTRACTOR
    /// records consume the following UNSIGNED; ADDEND records consume the
    /// following BRANCH26/PAGE21/PAGEOFF12.
    fn add_section_relocations(&mut self, section_index: usize) -> Result {
        let e = LittleEndian;
        let section = &self.object.sections[section_index];
        let section_address = section.address;
        let relocations = section.relocations;

        let mut i = 0;
        while i < relocations.len() {
            ensure!(
                !relocations[i].r_scattered(e, macho::CPU_TYPE_ARM64),
                "scattered relocations are not supported"
            );
            let mut ri = relocations[i].info(e);
            let mut kind = classify_relocation(&ri)?;
            let fixup_address = section_address + u64::from(ri.r_address);
            debug!("processing {kind} relocation at {fixup_address:#x}");

            let fixup_block = self.block_covering(fixup_address)?;
            let block = self.graph.block(fixup_block);
            let block_address = block.address();
            let block_end = block.end_address();
            if fixup_address + (1_u64 << ri.r_length) > block_end {
                return Err(LinkError::FixupOutOfBlock {
                    fixup_address,
                    block_end,
                }
                .into());
            }
            let offset_in_block = (fixup_address - block_address) as usize;

            let mut pair_addend = 0_i64;
            if kind == EdgeKind::PairedAddend {
                pair_addend = i64::from(ri.r_symbolnum);
                i += 1;
                let Some(next) = relocations.get(i) else {
                    return Err(LinkError::MalformedPair(format!(
                        "unpaired ADDEND relocation at {fixup_address:#x}"
                    ))
                    .into());
                };
                ri = next.info(e);
                kind = classify_relocation(&ri)?;
                if !matches!(
                    kind,
                    EdgeKind::Branch26 | EdgeKind::Page21 | EdgeKind::PageOffset12
                ) {
                    return Err(LinkError::MalformedPair(format!(
                        "ADDEND may not decorate a {kind} relocation"
                    ))
                    .into());
                }
                if section_address + u64::from(ri.r_address) != fixup_address {
                    return Err(LinkError::MalformedPair(
                        "ADDEND and its partner point at different addresses".to_owned(),
                    )
                    .into());
                }
                debug!("  pair is {kind}");
            }

            let (kind, target, addend) = match kind {
                EdgeKind::Branch26 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    let instr = self.stored_u32(fixup_block, offset_in_block);
                    if !is_b_or_bl(instr) {
                        return Err(LinkError::MalformedInstruction {
                            kind,
                            expected: "a B or BL with a zero addend",
                            found: instr,
                        }
                        .into());
                    }
                    (kind, target, pair_addend)
                }
                EdgeKind::Pointer32 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    let addend = i64::from(self.stored_u32(fixup_block, offset_in_block));
                    (kind, target, addend)
                }
                EdgeKind::Pointer64 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    let addend = self.stored_u64(fixup_block, offset_in_block) as i64;
                    (kind, target, addend)
                }
                EdgeKind::Pointer64Anon => {
                    let stored = self.stored_u64(fixup_block, offset_in_block);
                    let target = self.address_index.find(&self.graph, stored)?;
                    let addend = stored.wrapping_sub(self.graph.symbol_address(target)?) as i64;
                    (kind, target, addend)
                }
                EdgeKind::Page21 | EdgeKind::GotPage21 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    let instr = self.stored_u32(fixup_block, offset_in_block);
                    if !is_adrp(instr) {
                        return Err(LinkError::MalformedInstruction {
                            kind,
                            expected: "an ADRP with a zero addend",
                            found: instr,
                        }
                        .into());
                    }
                    (kind, target, pair_addend)
                }
                EdgeKind::PageOffset12 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    (kind, target, pair_addend)
                }
                EdgeKind::GotPageOffset12 => {
                    let target = self.symbol_by_index(ri.r_symbolnum)?;
                    let instr = self.stored_u32(fixup_block, offset_in_block);
                    if !is_ldr64_imm(instr) {
                        return Err(LinkError::MalformedInstruction {
                            kind,
                            expected: "a 64-bit LDR immediate with a zero addend",
                            found: instr,
                        }
                        .into());
                    }
                    (kind, target, 0)
                }
                EdgeKind::PointerToGot => (kind, self.symbol_by_index(ri.r_symbolnum)?, 0),
                EdgeKind::Delta32 | EdgeKind::Delta64 => {
                    let sub_ri = ri;
                    i += 1;
                    let unsigned_ri = relocations.get(i).map(|r| r.info(e));
                    self.parse_pair_relocation(
                        fixup_block,
                        &sub_ri,
                        fixup_address,
                        offset_in_block,
                        unsigned_ri,
                    )?
                }
                _ => unreachable!("classifier does not produce {kind}"),
            };

            debug!(
                "  edge {kind} at {fixup_address:#x} -> {} + {addend:#x}",
                self.graph.symbol(target)
            );
            self.graph.block_mut(fixup_block).add_edge(
                kind,
                fixup_address - block_address,
                target,
                addend,
            );
            i += 1;
        }
        Ok(())
    }

    /// Parses a SUBTRACTOR/UNSIGNED pair. The SUBTRACTOR names symbol A, the
    /// UNSIGNED names symbol B; the stored value V biases the difference.
    /// Which of A's and B's blocks the fixup lands in decides between
    /// Delta (B - fixup) and NegDelta (fixup - A) forms.
    fn parse_pair_relocation(
        &self,
        block_to_fix: BlockId,
        sub_ri: &RelocationInfo,
        fixup_address: u64,
        offset_in_block: usize,
        unsigned_ri: Option<RelocationInfo>,
    ) -> Result<(EdgeKind, SymbolId, i64)> {
        let malformed =
            |message: String| -> crate::error::Error { LinkError::MalformedPair(message).into() };

        let Some(un_ri) = unsigned_ri else {
            return Err(malformed(
                "SUBTRACTOR without a paired UNSIGNED relocation".to_owned(),
            ));
        };
        if un_ri.r_type != macho::ARM64_RELOC_UNSIGNED || un_ri.r_pcrel {
            return Err(malformed(format!(
                "SUBTRACTOR must be followed by an UNSIGNED relocation, found type {}",
                linker_utils::macho::arm64_rel_type_to_string(un_ri.r_type)
            )));
        }
        if sub_ri.r_address != un_ri.r_address {
            return Err(malformed(
                "SUBTRACTOR and paired UNSIGNED point to different addresses".to_owned(),
            ));
        }
        if sub_ri.r_length != un_ri.r_length {
            return Err(malformed(
                "length of SUBTRACTOR and paired UNSIGNED must match".to_owned(),
            ));
        }

        let from = self.symbol_by_index(sub_ri.r_symbolnum)?;

        let mut fixup_value = if sub_ri.r_length == 3 {
            self.stored_u64(block_to_fix, offset_in_block) as i64
        } else {
            i64::from(self.stored_u32(block_to_fix, offset_in_block) as i32)
        };

        let to = if un_ri.r_extern {
            self.symbol_by_index(un_ri.r_symbolnum)?
        } else {
            let to = self.address_index.find(&self.graph, fixup_value as u64)?;
            fixup_value -= self.graph.symbol_address(to)? as i64;
            to
        };

        let is_64 = sub_ri.r_length == 3;
        if self.graph.symbol(from).block() == Some(block_to_fix) {
            let kind = if is_64 {
                EdgeKind::Delta64
            } else {
                EdgeKind::Delta32
            };
            let from_address = self.graph.symbol_address(from)? as i64;
            let addend = fixup_value + (fixup_address as i64 - from_address);
            Ok((kind, to, addend))
        } else if self.graph.symbol(to).block() == Some(block_to_fix) {
            let kind = if is_64 {
                EdgeKind::NegDelta64
            } else {
                EdgeKind::NegDelta32
            };
            let to_address = self.graph.symbol_address(to)? as i64;
            let addend = fixup_value - (fixup_address as i64 - to_address);
            Ok((kind, from, addend))
        } else {
            Err(malformed(
                "SUBTRACTOR must fix up either 'A' or 'B'".to_owned(),
            ))
        }
    }

    fn symbol_by_index(&self, index: u32) -> Result<SymbolId> {
        self.symbols_by_index
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| {
                LinkError::SymbolNotFound(format!("invalid symbol table index {index}")).into()
            })
    }

    fn block_covering(&self, address: u64) -> Result<BlockId> {
        let symbol = self.address_index.find(&self.graph, address)?;
        Ok(self
            .graph
            .symbol(symbol)
            .block()
            .expect("address index only holds defined symbols"))
    }

    fn stored_u32(&self, block: BlockId, offset: usize) -> u32 {
        let content = self.graph.block(block).content();
        u32::from_le_bytes(*content[offset..].first_chunk::<4>().unwrap())
    }

    fn stored_u64(&self, block: BlockId, offset: usize) -> u64 {
        let content = self.graph.block(block).content();
        u64::from_le_bytes(*content[offset..].first_chunk::<8>().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_index() {
        let mut graph = LinkGraph::new();
        let section = graph.add_section("__text", Prot::RX);
        let block = graph.add_content_block(section, Cow::Owned(vec![0; 16]), 0x1000, 4);
        let symbol = graph.add_anonymous_symbol(block, 0, 16, false, false);

        let mut index = AddressIndex::default();
        index.insert(0x1000, symbol);
        index.sort();

        assert_eq!(index.find(&graph, 0x1000).unwrap(), symbol);
        assert_eq!(index.find(&graph, 0x100f).unwrap(), symbol);
        assert!(index.find(&graph, 0xfff).is_err());
        assert!(index.find(&graph, 0x1010).is_err());
    }
}
