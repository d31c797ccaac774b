//! Minimal Mach-O relocatable-object reader. We only accept little-endian
//! 64-bit objects for arm64 and only look at the pieces the link graph needs:
//! the single MH_OBJECT segment's sections, their relocation arrays and the
//! symbol/string tables.

use crate::error::Result;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use object::macho;
use object::BigEndian;
use object::LittleEndian;
use object::Pod;
use std::ffi::CStr;

type E = LittleEndian;

pub(crate) struct ObjectFile<'data> {
    pub(crate) sections: Vec<SectionInfo<'data>>,
    pub(crate) symbols: &'data [macho::Nlist64<E>],
    strings: &'data [u8],
}

pub(crate) struct SectionInfo<'data> {
    pub(crate) name: &'data str,
    pub(crate) segment_name: &'data str,
    pub(crate) address: u64,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) flags: u32,
    pub(crate) is_zerofill: bool,
    /// Empty for zerofill sections.
    pub(crate) content: &'data [u8],
    pub(crate) relocations: &'data [macho::Relocation<E>],
}

impl<'data> SectionInfo<'data> {
    pub(crate) fn has_instructions(&self) -> bool {
        self.flags & (macho::S_ATTR_PURE_INSTRUCTIONS | macho::S_ATTR_SOME_INSTRUCTIONS) != 0
    }
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<ObjectFile<'data>> {
        let e = LittleEndian;
        let header = pod_at::<macho::MachHeader64<E>>(data, 0)
            .context("file too small for a Mach-O header")?;

        // The magic field is byte-order independent, so reading a
        // little-endian file's magic as big-endian yields MH_CIGAM_64.
        if header.magic.get(BigEndian) != macho::MH_CIGAM_64 {
            bail!("not a little-endian 64-bit Mach-O file");
        }
        if header.cputype.get(e) != macho::CPU_TYPE_ARM64 {
            bail!(
                "unsupported cputype {:#x}, expected arm64",
                header.cputype.get(e)
            );
        }
        if header.filetype.get(e) != macho::MH_OBJECT {
            bail!(
                "unsupported filetype {:#x}, expected a relocatable object",
                header.filetype.get(e)
            );
        }

        let mut sections = Vec::new();
        let mut symbols: &[macho::Nlist64<E>] = &[];
        let mut strings: &[u8] = &[];

        let mut offset = size_of::<macho::MachHeader64<E>>();
        for _ in 0..header.ncmds.get(e) {
            let lc = pod_at::<macho::LoadCommand<E>>(data, offset)
                .context("load command extends past end of file")?;
            match lc.cmd.get(e) {
                macho::LC_SEGMENT_64 => {
                    let segment = pod_at::<macho::SegmentCommand64<E>>(data, offset)
                        .context("truncated LC_SEGMENT_64")?;
                    let headers = pod_slice_at::<macho::Section64<E>>(
                        data,
                        offset + size_of::<macho::SegmentCommand64<E>>(),
                        segment.nsects.get(e) as usize,
                    )
                    .context("section headers extend past end of file")?;
                    for header in headers {
                        sections.push(SectionInfo::parse(data, header)?);
                    }
                }
                macho::LC_SYMTAB => {
                    let symtab = pod_at::<macho::SymtabCommand<E>>(data, offset)
                        .context("truncated LC_SYMTAB")?;
                    symbols = pod_slice_at::<macho::Nlist64<E>>(
                        data,
                        symtab.symoff.get(e) as usize,
                        symtab.nsyms.get(e) as usize,
                    )
                    .context("symbol table extends past end of file")?;
                    let stroff = symtab.stroff.get(e) as usize;
                    let strsize = symtab.strsize.get(e) as usize;
                    strings = data
                        .get(stroff..stroff + strsize)
                        .context("string table extends past end of file")?;
                }
                _ => {}
            }
            offset += lc.cmdsize.get(e) as usize;
        }

        Ok(ObjectFile {
            sections,
            symbols,
            strings,
        })
    }

    pub(crate) fn symbol_name(&self, nlist: &macho::Nlist64<E>) -> Result<&'data str> {
        let start = nlist.n_strx.get(LittleEndian) as usize;
        let bytes = self
            .strings
            .get(start..)
            .with_context(|| format!("symbol name offset {start:#x} outside string table"))?;
        Ok(CStr::from_bytes_until_nul(bytes)
            .context("unterminated symbol name")?
            .to_str()
            .context("symbol name is not valid UTF-8")?)
    }
}

impl<'data> SectionInfo<'data> {
    fn parse(data: &'data [u8], header: &'data macho::Section64<E>) -> Result<SectionInfo<'data>> {
        let e = LittleEndian;
        let name = name_from_bytes(&header.sectname)?;
        let size = header.size.get(e);
        let is_zerofill = header.flags.get(e) & macho::SECTION_TYPE == macho::S_ZEROFILL;
        let content = if is_zerofill {
            &[]
        } else {
            let start = header.offset.get(e) as usize;
            data.get(start..start + size as usize)
                .with_context(|| format!("content of section {name} extends past end of file"))?
        };
        Ok(SectionInfo {
            name,
            segment_name: name_from_bytes(&header.segname)?,
            address: header.addr.get(e),
            size,
            alignment: 1 << header.align.get(e),
            flags: header.flags.get(e),
            is_zerofill,
            content,
            relocations: pod_slice_at::<macho::Relocation<E>>(
                data,
                header.reloff.get(e) as usize,
                header.nreloc.get(e) as usize,
            )
            .with_context(|| format!("relocations of section {name} extend past end of file"))?,
        })
    }
}

fn name_from_bytes(bytes: &[u8; 16]) -> Result<&str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).context("section name is not valid UTF-8")
}

fn pod_at<T: Pod>(data: &[u8], offset: usize) -> Result<&T> {
    let bytes = data.get(offset..).ok_or_else(|| anyhow!("out of bounds"))?;
    object::from_bytes(bytes)
        .map(|(value, _)| value)
        .map_err(|()| anyhow!("out of bounds"))
}

fn pod_slice_at<T: Pod>(data: &[u8], offset: usize, count: usize) -> Result<&[T]> {
    let bytes = data.get(offset..).ok_or_else(|| anyhow!("out of bounds"))?;
    object::slice_from_bytes(bytes, count)
        .map(|(slice, _)| slice)
        .map_err(|()| anyhow!("out of bounds"))
}
