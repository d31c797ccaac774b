//! Classification of raw Mach-O/arm64 relocation records into edge kinds, and
//! the fixup encoder that packs computed relocation values into AArch64
//! instruction immediates.

use crate::error::LinkError;
use crate::error::Result;
use crate::graph::BlockId;
use crate::graph::Edge;
use crate::graph::LinkGraph;
use anyhow::bail;
use linker_utils::aarch64::encode_adrp_page21;
use linker_utils::aarch64::encode_branch26;
use linker_utils::aarch64::encode_imm12;
use linker_utils::aarch64::encode_ldr_literal19;
use linker_utils::aarch64::is_adrp;
use linker_utils::aarch64::is_b_or_bl;
use linker_utils::aarch64::is_ldr64_imm;
use linker_utils::aarch64::page;
use linker_utils::aarch64::page_offset12_shift;
use linker_utils::aarch64::EdgeKind;
use linker_utils::aarch64::LDR_X16_SELF_LITERAL;
use linker_utils::bit_misc::fits_signed;
use linker_utils::bit_misc::fits_unsigned;
use linker_utils::bit_misc::is_aligned;
use object::macho;
use object::macho::RelocationInfo;

/// Maps a raw relocation record to the edge kind it will produce. Only the
/// combinations in the table below are valid arm64 relocations; everything
/// else is rejected. SUBTRACTOR records come back as provisional
/// Delta32/Delta64 and may be flipped to NegDelta32/NegDelta64 by the pair
/// parser.
pub(crate) fn classify_relocation(ri: &RelocationInfo) -> Result<EdgeKind> {
    let kind = match (ri.r_type, ri.r_pcrel, ri.r_extern, ri.r_length) {
        (macho::ARM64_RELOC_UNSIGNED, false, true, 3) => EdgeKind::Pointer64,
        (macho::ARM64_RELOC_UNSIGNED, false, false, 3) => EdgeKind::Pointer64Anon,
        (macho::ARM64_RELOC_UNSIGNED, false, _, 2) => EdgeKind::Pointer32,
        (macho::ARM64_RELOC_SUBTRACTOR, false, true, 2) => EdgeKind::Delta32,
        (macho::ARM64_RELOC_SUBTRACTOR, false, true, 3) => EdgeKind::Delta64,
        (macho::ARM64_RELOC_BRANCH26, true, true, 2) => EdgeKind::Branch26,
        (macho::ARM64_RELOC_PAGE21, true, true, 2) => EdgeKind::Page21,
        (macho::ARM64_RELOC_PAGEOFF12, false, true, 2) => EdgeKind::PageOffset12,
        (macho::ARM64_RELOC_GOT_LOAD_PAGE21, true, true, 2) => EdgeKind::GotPage21,
        (macho::ARM64_RELOC_GOT_LOAD_PAGEOFF12, false, true, 2) => EdgeKind::GotPageOffset12,
        (macho::ARM64_RELOC_POINTER_TO_GOT, true, true, 2) => EdgeKind::PointerToGot,
        (macho::ARM64_RELOC_ADDEND, false, false, 2) => EdgeKind::PairedAddend,
        _ => {
            return Err(LinkError::UnsupportedRelocation {
                r_address: ri.r_address,
                r_symbolnum: ri.r_symbolnum,
                r_type: ri.r_type,
                r_pcrel: ri.r_pcrel,
                r_extern: ri.r_extern,
                r_length: ri.r_length,
            }
            .into())
        }
    };
    Ok(kind)
}

/// Applies one edge to the block's working memory. `work` covers the whole
/// block; the fixup site is at `edge.offset` within it. Opcode patterns were
/// validated when the edge was created, so they are only re-checked in debug
/// builds; range and alignment of the computed value are always checked.
pub(crate) fn apply_fixup(
    graph: &LinkGraph,
    block_id: BlockId,
    edge: &Edge,
    work: &mut [u8],
) -> Result {
    let block = graph.block(block_id);
    let fixup_address = block.address() + edge.offset;
    let target = graph.symbol_address(edge.target)?;
    let offset = edge.offset as usize;

    let out_of_range = |value: i64| -> crate::error::Error {
        LinkError::TargetOutOfRange {
            kind: edge.kind,
            value,
            fixup_address,
        }
        .into()
    };
    let misaligned = |value: i64| -> crate::error::Error {
        LinkError::Misalignment {
            kind: edge.kind,
            value,
            fixup_address,
        }
        .into()
    };

    match edge.kind {
        EdgeKind::Branch26 => {
            let value = (target as i64)
                .wrapping_sub(fixup_address as i64)
                .wrapping_add(edge.addend);
            if !is_aligned(value, 4) {
                return Err(misaligned(value));
            }
            if !fits_signed(value, 28) {
                return Err(out_of_range(value));
            }
            let raw = read_u32(work, offset);
            crate::debug_assert_bail!(
                is_b_or_bl(raw),
                "Branch26 fixup site does not hold a B or BL: {raw:#010x}"
            );
            write_u32(work, offset, encode_branch26(raw, value));
        }
        EdgeKind::Pointer32 => {
            let value = (target as i64).wrapping_add(edge.addend) as u64;
            if !fits_unsigned(value, 32) {
                return Err(out_of_range(value as i64));
            }
            write_u32(work, offset, value as u32);
        }
        EdgeKind::Pointer64 | EdgeKind::Pointer64Anon => {
            let value = (target as i64).wrapping_add(edge.addend) as u64;
            write_u64(work, offset, value);
        }
        EdgeKind::Page21 | EdgeKind::GotPage21 => {
            crate::debug_assert_bail!(
                edge.addend == 0,
                "{} fixup with non-zero addend {}",
                edge.kind,
                edge.addend
            );
            let page_delta = (page(target) as i64).wrapping_sub(page(fixup_address) as i64);
            if !fits_signed(page_delta, 31) {
                return Err(out_of_range(page_delta));
            }
            let raw = read_u32(work, offset);
            crate::debug_assert_bail!(
                is_adrp(raw),
                "{} fixup site does not hold an ADRP: {raw:#010x}",
                edge.kind
            );
            write_u32(work, offset, encode_adrp_page21(raw, page_delta));
        }
        EdgeKind::PageOffset12 => {
            crate::debug_assert_bail!(
                edge.addend == 0,
                "PageOffset12 fixup with non-zero addend {}",
                edge.addend
            );
            let target_offset = target & 0xfff;
            let raw = read_u32(work, offset);
            let shift = page_offset12_shift(raw);
            if !is_aligned(target_offset as i64, 1 << shift) {
                return Err(misaligned(target_offset as i64));
            }
            write_u32(work, offset, encode_imm12(raw, (target_offset >> shift) as u32));
        }
        EdgeKind::GotPageOffset12 => {
            crate::debug_assert_bail!(
                edge.addend == 0,
                "GOTPageOffset12 fixup with non-zero addend {}",
                edge.addend
            );
            let raw = read_u32(work, offset);
            crate::debug_assert_bail!(
                is_ldr64_imm(raw),
                "GOTPageOffset12 fixup site does not hold a 64-bit LDR immediate: {raw:#010x}"
            );
            write_u32(work, offset, encode_imm12(raw, (target & 0xfff) as u32));
        }
        EdgeKind::LdrLiteral19 => {
            crate::debug_assert_bail!(edge.addend == 0, "LDRLiteral19 with non-zero addend");
            let raw = read_u32(work, offset);
            crate::debug_assert_bail!(
                raw == LDR_X16_SELF_LITERAL,
                "LDRLiteral19 fixup site does not hold `ldr x16, .`: {raw:#010x}"
            );
            let value = (target as i64).wrapping_sub(fixup_address as i64);
            if !is_aligned(value, 4) {
                return Err(misaligned(value));
            }
            if !fits_signed(value, 21) {
                return Err(out_of_range(value));
            }
            write_u32(work, offset, encode_ldr_literal19(raw, value));
        }
        EdgeKind::Delta32 | EdgeKind::Delta64 | EdgeKind::NegDelta32 | EdgeKind::NegDelta64 => {
            let value = match edge.kind {
                EdgeKind::Delta32 | EdgeKind::Delta64 => (target as i64)
                    .wrapping_sub(fixup_address as i64)
                    .wrapping_add(edge.addend),
                _ => (fixup_address as i64)
                    .wrapping_sub(target as i64)
                    .wrapping_add(edge.addend),
            };
            if matches!(edge.kind, EdgeKind::Delta32 | EdgeKind::NegDelta32) {
                if !fits_signed(value, 32) {
                    return Err(out_of_range(value));
                }
                write_u32(work, offset, value as i32 as u32);
            } else {
                write_u64(work, offset, value as u64);
            }
        }
        EdgeKind::PairedAddend | EdgeKind::PointerToGot => {
            bail!("{} edge survived until fixup", edge.kind)
        }
    }

    Ok(())
}

fn read_u32(work: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(*work[offset..].first_chunk::<4>().unwrap())
}

fn write_u32(work: &mut [u8], offset: usize, value: u32) {
    work[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(work: &mut [u8], offset: usize, value: u64) {
    work[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use linker_utils::macho::Prot;
    use std::borrow::Cow;

    fn reloc(r_type: u8, pcrel: bool, r_extern: bool, length: u8) -> RelocationInfo {
        RelocationInfo {
            r_address: 0,
            r_symbolnum: 1,
            r_pcrel: pcrel,
            r_length: length,
            r_extern,
            r_type,
        }
    }

    #[test]
    fn test_classifier_accepts_valid_records() {
        use object::macho::*;
        let cases = [
            (reloc(ARM64_RELOC_UNSIGNED, false, true, 3), EdgeKind::Pointer64),
            (reloc(ARM64_RELOC_UNSIGNED, false, false, 3), EdgeKind::Pointer64Anon),
            (reloc(ARM64_RELOC_UNSIGNED, false, true, 2), EdgeKind::Pointer32),
            (reloc(ARM64_RELOC_UNSIGNED, false, false, 2), EdgeKind::Pointer32),
            (reloc(ARM64_RELOC_SUBTRACTOR, false, true, 2), EdgeKind::Delta32),
            (reloc(ARM64_RELOC_SUBTRACTOR, false, true, 3), EdgeKind::Delta64),
            (reloc(ARM64_RELOC_BRANCH26, true, true, 2), EdgeKind::Branch26),
            (reloc(ARM64_RELOC_PAGE21, true, true, 2), EdgeKind::Page21),
            (reloc(ARM64_RELOC_PAGEOFF12, false, true, 2), EdgeKind::PageOffset12),
            (reloc(ARM64_RELOC_GOT_LOAD_PAGE21, true, true, 2), EdgeKind::GotPage21),
            (
                reloc(ARM64_RELOC_GOT_LOAD_PAGEOFF12, false, true, 2),
                EdgeKind::GotPageOffset12,
            ),
            (reloc(ARM64_RELOC_POINTER_TO_GOT, true, true, 2), EdgeKind::PointerToGot),
            (reloc(ARM64_RELOC_ADDEND, false, false, 2), EdgeKind::PairedAddend),
        ];
        for (ri, expected) in cases {
            assert_eq!(classify_relocation(&ri).unwrap(), expected, "{}", expected);
        }
    }

    #[test]
    fn test_classifier_rejects_invalid_records() {
        use object::macho::*;
        let cases = [
            // Wrong pcrel
            reloc(ARM64_RELOC_BRANCH26, false, true, 2),
            // Wrong extern
            reloc(ARM64_RELOC_SUBTRACTOR, false, false, 2),
            // Wrong length
            reloc(ARM64_RELOC_PAGE21, true, true, 3),
            // TLV relocations are out of scope
            reloc(ARM64_RELOC_TLVP_LOAD_PAGE21, true, true, 2),
        ];
        for ri in cases {
            let err = classify_relocation(&ri).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<LinkError>(),
                Some(LinkError::UnsupportedRelocation { .. })
            ));
        }
    }

    /// Sets up one block holding `content` plus a resolved target symbol and
    /// applies a single edge against working memory.
    fn fixup_one(
        block_address: u64,
        content: &[u8],
        kind: EdgeKind,
        target_address: u64,
        addend: i64,
    ) -> Result<Vec<u8>> {
        let mut graph = LinkGraph::new();
        let section = graph.add_section("__text", Prot::RX);
        let block = graph.add_content_block(section, Cow::Owned(content.to_vec()), block_address, 4);
        let target = graph.add_external_symbol("_target".into());
        graph.set_resolved_address(target, target_address);
        let edge = Edge {
            kind,
            offset: 0,
            target,
            addend,
        };
        let mut work = content.to_vec();
        apply_fixup(&graph, block, &edge, &mut work)?;
        Ok(work)
    }

    fn fixup_word(
        block_address: u64,
        content: &[u8],
        kind: EdgeKind,
        target_address: u64,
        addend: i64,
    ) -> Result<u32> {
        fixup_one(block_address, content, kind, target_address, addend).map(|work| read_u32(&work, 0))
    }

    const BL: [u8; 4] = [0x00, 0x00, 0x00, 0x94];
    const ADRP_X0: [u8; 4] = [0x00, 0x00, 0x00, 0x90];
    const LDR_X0_X0: [u8; 4] = [0x00, 0x00, 0x40, 0xf9];
    const FIXUP: u64 = 0x1000_0000;

    fn branch26(delta: i64, addend: i64) -> Result<u32> {
        fixup_word(
            FIXUP,
            &BL,
            EdgeKind::Branch26,
            FIXUP.checked_add_signed(delta).unwrap(),
            addend,
        )
    }

    #[test]
    fn test_branch26_boundaries() {
        assert_eq!(branch26((1 << 27) - 4, 0).unwrap(), 0x95ff_ffff);
        assert_eq!(branch26(-(1 << 27) + 4, 0).unwrap(), 0x9600_0001);
        assert_eq!(branch26(8, 0).unwrap(), 0x9400_0002);

        let err = branch26(1 << 27, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
        let err = branch26(-(1 << 27) - 4, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
        let err = branch26(6, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::Misalignment { .. })
        ));
    }

    #[test]
    fn test_branch26_addend() {
        // An addend from an ADDEND pair shifts the branch target.
        assert_eq!(branch26(8, 256).unwrap(), 0x9400_0042);
    }

    #[test]
    fn test_page21_boundaries() {
        let delta = (1_i64 << 30) - 4096;
        let word = fixup_word(
            FIXUP,
            &ADRP_X0,
            EdgeKind::Page21,
            FIXUP.checked_add_signed(delta).unwrap(),
            0,
        )
        .unwrap();
        assert_eq!(word, 0xf01f_ffe0);

        let err = fixup_word(FIXUP, &ADRP_X0, EdgeKind::Page21, FIXUP + (1 << 30), 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_page21_uses_fixup_page() {
        // Fixup in the middle of a page: the delta is measured between pages,
        // so a target in the same page encodes as zero.
        let word = fixup_word(0x1000_0004, &ADRP_X0, EdgeKind::Page21, 0x1000_0f00, 0).unwrap();
        assert_eq!(word, 0x9000_0000);
        let word = fixup_word(0x1000_0ffc, &ADRP_X0, EdgeKind::Page21, 0x1000_1000, 0).unwrap();
        assert_eq!(word, 0xb000_0000);
    }

    #[test]
    fn test_pointer32_boundaries() {
        let work = fixup_one(FIXUP, &[0; 4], EdgeKind::Pointer32, 0xffff_ffff, 0).unwrap();
        assert_eq!(work, 0xffff_ffff_u32.to_le_bytes());

        let err = fixup_one(FIXUP, &[0; 4], EdgeKind::Pointer32, 0x1_0000_0000, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_pointer64_round_trip() {
        // Reading the addend out of stored bytes and re-encoding against the
        // same target address must reproduce the original bytes.
        let target = 0x2000_0000_u64;
        let stored = 0x2000_0123_u64;
        let addend = (stored - target) as i64;
        let work = fixup_one(
            FIXUP,
            &stored.to_le_bytes(),
            EdgeKind::Pointer64,
            target,
            addend,
        )
        .unwrap();
        assert_eq!(work, stored.to_le_bytes());
    }

    #[test]
    fn test_page_offset12_applies_shift() {
        // ldr x0, [x0, <imm>] scales its immediate by 8.
        let word = fixup_word(FIXUP, &LDR_X0_X0, EdgeKind::PageOffset12, 0x2000_0010, 0).unwrap();
        assert_eq!(word, 0xf940_0000 | (2 << 10));

        // An offset that isn't a multiple of the access size is rejected.
        let err = fixup_word(FIXUP, &LDR_X0_X0, EdgeKind::PageOffset12, 0x2000_0009, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::Misalignment { .. })
        ));

        // add x0, x0, <imm> takes the raw low 12 bits.
        let add_x0: [u8; 4] = [0x00, 0x00, 0x00, 0x91];
        let word = fixup_word(FIXUP, &add_x0, EdgeKind::PageOffset12, 0x2000_0009, 0).unwrap();
        assert_eq!(word, 0x9100_0000 | (9 << 10));
    }

    #[test]
    fn test_got_page_offset12_is_unscaled() {
        let word =
            fixup_word(FIXUP, &LDR_X0_X0, EdgeKind::GotPageOffset12, 0x2000_0008, 0).unwrap();
        assert_eq!(word, 0xf940_0000 | (8 << 10));
    }

    #[test]
    fn test_ldr_literal19() {
        let ldr = LDR_X16_SELF_LITERAL.to_le_bytes();
        let word = fixup_word(FIXUP, &ldr, EdgeKind::LdrLiteral19, FIXUP + 8, 0).unwrap();
        assert_eq!(word, 0x5800_0050);

        let err = fixup_word(FIXUP, &ldr, EdgeKind::LdrLiteral19, FIXUP + (1 << 20), 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_deltas() {
        let work = fixup_one(FIXUP, &[0; 4], EdgeKind::Delta32, FIXUP + 0x100, 8).unwrap();
        assert_eq!(work, 0x108_i32.to_le_bytes());

        let work = fixup_one(FIXUP, &[0; 8], EdgeKind::NegDelta64, FIXUP - 0x100, 0).unwrap();
        assert_eq!(work, 0x100_i64.to_le_bytes());

        let work = fixup_one(FIXUP, &[0; 4], EdgeKind::NegDelta32, FIXUP + 0x100, 0).unwrap();
        assert_eq!(work, (-0x100_i32).to_le_bytes());

        let err = fixup_one(FIXUP, &[0; 4], EdgeKind::Delta32, FIXUP + (1 << 31), 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::TargetOutOfRange { .. })
        ));
    }
}
