//! Custom parser for `__eh_frame`. Mach-O objects carry no relocation records
//! for this section, so the CFI records are decoded directly: every CIE/FDE
//! becomes its own block, FDEs get a NegDelta32 edge back to their CIE and
//! Delta64 edges for the pc-begin and LSDA pointers. Re-encoding those edges
//! after address assignment rewrites the unwind info for the final image.

use crate::error::Result;
use crate::graph::SymbolId;
use crate::graph_builder::GraphBuilder;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use linker_utils::aarch64::EdgeKind;
use linker_utils::macho::Prot;
use std::borrow::Cow;
use tracing::debug;

const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_SDATA8: u8 = 0x0c;

/// The only FDE pointer encoding we accept: 8-byte signed PC-relative.
const SUPPORTED_POINTER_ENCODING: u8 = DW_EH_PE_PCREL | DW_EH_PE_SDATA8;

const RECORD_ALIGNMENT: u64 = 8;

/// Byte size of an encoded pointer, used to skip the CIE's personality
/// pointer.
fn encoded_pointer_size(encoding: u8) -> Result<usize> {
    match encoding & 0x0f {
        0x0 => Ok(8),
        0x2 | 0xa => Ok(2),
        0x3 | 0xb => Ok(4),
        0x4 | 0xc => Ok(8),
        _ => bail!("unsupported DWARF pointer encoding {encoding:#x}"),
    }
}

#[derive(Clone, Copy)]
struct CieInfo {
    symbol: SymbolId,
    fde_pointer_encoding: Option<u8>,
    lsda_encoding: Option<u8>,
    has_aug_data: bool,
}

pub(crate) fn parse_eh_frame_section(
    builder: &mut GraphBuilder<'_>,
    section_index: usize,
) -> Result {
    let section = &builder.object.sections[section_index];
    ensure!(
        !section.is_zerofill,
        "__eh_frame section is marked zero-fill"
    );
    let data = section.content;
    let section_address = section.address;
    let graph_section = builder.graph.add_section(section.name, Prot::R);

    let mut cies = foldhash::HashMap::default();
    let mut offset = 0_usize;
    while offset < data.len() {
        let header = data
            .get(offset..offset + 8)
            .context("truncated CFI record header")?;
        let length = u32::from_le_bytes(*header.first_chunk::<4>().unwrap());
        if length == 0 {
            break;
        }
        ensure!(
            length != 0xffff_ffff,
            "extended-length CFI records are not supported"
        );
        let record_end = offset + 4 + length as usize;
        let record = data
            .get(offset..record_end)
            .context("CFI record extends past end of __eh_frame")?;
        let record_address = section_address + offset as u64;

        let block = builder.graph.add_content_block(
            graph_section,
            Cow::Borrowed(record),
            record_address,
            RECORD_ALIGNMENT,
        );
        // Unwind info must survive pruning for the whole image, so record
        // symbols are born live.
        let symbol = builder
            .graph
            .add_anonymous_symbol(block, 0, record.len() as u64, false, true);

        let cie_pointer = u32::from_le_bytes(*header[4..].first_chunk::<4>().unwrap());
        if cie_pointer == 0 {
            debug!("CIE at {record_address:#x}");
            cies.insert(record_address, parse_cie(record, symbol)?);
        } else {
            let cie_address = record_address + 4 - u64::from(cie_pointer);
            let Some(cie) = cies.get(&cie_address).copied() else {
                bail!("FDE at {record_address:#x} references unknown CIE at {cie_address:#x}");
            };
            debug!("FDE at {record_address:#x} for CIE at {cie_address:#x}");
            parse_fde(builder, block, record, record_address, &cie)?;
        }
        offset = record_end;
    }
    Ok(())
}

fn parse_cie(record: &[u8], symbol: SymbolId) -> Result<CieInfo> {
    let mut rest = record.get(8..).context("truncated CIE")?;
    let version = read_u8(&mut rest)?;
    ensure!(version == 1 || version == 3, "unsupported CIE version {version}");

    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .context("unterminated CIE augmentation string")?;
    let augmentation = std::str::from_utf8(&rest[..nul]).context("bad CIE augmentation string")?;
    rest = &rest[nul + 1..];

    let _code_alignment = read_uleb(&mut rest)?;
    let _data_alignment = read_sleb(&mut rest)?;
    if version == 1 {
        read_u8(&mut rest)?;
    } else {
        read_uleb(&mut rest)?;
    }

    let mut info = CieInfo {
        symbol,
        fde_pointer_encoding: None,
        lsda_encoding: None,
        has_aug_data: false,
    };
    let mut characters = augmentation.chars();
    if augmentation.starts_with('z') {
        info.has_aug_data = true;
        characters.next();
        let _aug_data_length = read_uleb(&mut rest)?;
        for c in characters {
            match c {
                'L' => info.lsda_encoding = Some(read_u8(&mut rest)?),
                'P' => {
                    let encoding = read_u8(&mut rest)?;
                    let size = encoded_pointer_size(encoding)?;
                    rest = rest.get(size..).context("truncated personality pointer")?;
                }
                'R' => info.fde_pointer_encoding = Some(read_u8(&mut rest)?),
                _ => bail!("unsupported CIE augmentation character {c:?}"),
            }
        }
    } else {
        ensure!(
            augmentation.is_empty(),
            "CIE augmentation {augmentation:?} without augmentation data"
        );
    }
    Ok(info)
}

fn parse_fde(
    builder: &mut GraphBuilder<'_>,
    block: crate::graph::BlockId,
    record: &[u8],
    record_address: u64,
    cie: &CieInfo,
) -> Result {
    builder
        .graph
        .block_mut(block)
        .add_edge(EdgeKind::NegDelta32, 4, cie.symbol, 0);

    let encoding = cie.fde_pointer_encoding.unwrap_or(SUPPORTED_POINTER_ENCODING);
    ensure!(
        encoding == SUPPORTED_POINTER_ENCODING,
        "unsupported FDE pointer encoding {encoding:#x}"
    );

    // pc-begin at offset 8, pc-range (a plain length, no edge) at 16.
    ensure!(record.len() >= 24, "FDE too short for pc-begin and pc-range");
    add_pointer_edge(builder, block, record, record_address, 8)?;

    if cie.has_aug_data {
        let mut rest = &record[24..];
        let _aug_data_length = read_uleb(&mut rest)?;
        if cie.lsda_encoding.is_some() {
            let lsda_offset = record.len() - rest.len();
            ensure!(
                record.len() >= lsda_offset + 8,
                "FDE too short for LSDA pointer"
            );
            add_pointer_edge(builder, block, record, record_address, lsda_offset)?;
        }
    }
    Ok(())
}

/// Reads an 8-byte PC-relative pointer field, recovers the symbol it refers
/// to and adds a Delta64 edge that re-encodes it.
fn add_pointer_edge(
    builder: &mut GraphBuilder<'_>,
    block: crate::graph::BlockId,
    record: &[u8],
    record_address: u64,
    field_offset: usize,
) -> Result {
    let stored = i64::from_le_bytes(*record[field_offset..].first_chunk::<8>().unwrap());
    let field_address = record_address + field_offset as u64;
    let target_address = field_address.wrapping_add_signed(stored);
    let target = builder.address_index.find(&builder.graph, target_address)?;
    let addend = target_address.wrapping_sub(builder.graph.symbol_address(target)?) as i64;
    builder
        .graph
        .block_mut(block)
        .add_edge(EdgeKind::Delta64, field_offset as u64, target, addend);
    Ok(())
}

fn read_u8(rest: &mut &[u8]) -> Result<u8> {
    let (&value, tail) = rest.split_first().context("truncated CFI record")?;
    *rest = tail;
    Ok(value)
}

fn read_uleb(rest: &mut &[u8]) -> Result<u64> {
    leb128::read::unsigned(rest).context("truncated ULEB128 value")
}

fn read_sleb(rest: &mut &[u8]) -> Result<i64> {
    leb128::read::signed(rest).context("truncated SLEB128 value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkGraph;

    fn dummy_symbol() -> (LinkGraph<'static>, SymbolId) {
        let mut graph = LinkGraph::new();
        let section = graph.add_section("__eh_frame", Prot::R);
        let block = graph.add_content_block(section, Cow::Owned(vec![0; 8]), 0, 8);
        let symbol = graph.add_anonymous_symbol(block, 0, 8, false, true);
        (graph, symbol)
    }

    #[test]
    fn test_parse_cie() {
        let (_graph, symbol) = dummy_symbol();
        // length, cie id 0, version 1, "zR", code align 1, data align -8,
        // return address register 30, aug data {0x1c}
        let mut record = vec![0_u8; 8];
        record[0..4].copy_from_slice(&20_u32.to_le_bytes());
        record.extend_from_slice(&[1, b'z', b'R', 0, 1, 0x78, 30, 1, 0x1c]);

        let info = parse_cie(&record, symbol).unwrap();
        assert_eq!(info.fde_pointer_encoding, Some(0x1c));
        assert!(info.lsda_encoding.is_none());
        assert!(info.has_aug_data);
    }

    #[test]
    fn test_parse_cie_rejects_unknown_augmentation() {
        let (_graph, symbol) = dummy_symbol();
        let mut record = vec![0_u8; 8];
        record[0..4].copy_from_slice(&20_u32.to_le_bytes());
        record.extend_from_slice(&[1, b'z', b'Q', 0, 1, 0x78, 30, 1, 0x1c]);
        assert!(parse_cie(&record, symbol).is_err());
    }
}
