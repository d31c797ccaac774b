use bitflags::bitflags;
use std::borrow::Cow;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::macho::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

pub fn arm64_rel_type_to_string(r_type: u8) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        ARM64_RELOC_UNSIGNED,
        ARM64_RELOC_SUBTRACTOR,
        ARM64_RELOC_BRANCH26,
        ARM64_RELOC_PAGE21,
        ARM64_RELOC_PAGEOFF12,
        ARM64_RELOC_GOT_LOAD_PAGE21,
        ARM64_RELOC_GOT_LOAD_PAGEOFF12,
        ARM64_RELOC_POINTER_TO_GOT,
        ARM64_RELOC_TLVP_LOAD_PAGE21,
        ARM64_RELOC_TLVP_LOAD_PAGEOFF12,
        ARM64_RELOC_ADDEND
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
    }
}

bitflags! {
    /// Memory protection applied to a section's blocks in the finalized image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    pub const R: Prot = Prot::READ;
    pub const RW: Prot = Prot::READ.union(Prot::WRITE);
    pub const RX: Prot = Prot::READ.union(Prot::EXEC);
}

impl std::fmt::Display for Prot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.contains(Prot::READ) {
            f.write_str("R")?;
        }
        if self.contains(Prot::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(Prot::EXEC) {
            f.write_str("X")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm64_rel_type_to_string() {
        assert_eq!(
            &arm64_rel_type_to_string(object::macho::ARM64_RELOC_BRANCH26),
            stringify!(ARM64_RELOC_BRANCH26)
        );
        assert_eq!(
            &arm64_rel_type_to_string(object::macho::ARM64_RELOC_ADDEND),
            stringify!(ARM64_RELOC_ADDEND)
        );
        assert_eq!(&arm64_rel_type_to_string(0x40), "Unknown relocation type 0x40");
    }

    #[test]
    fn test_prot_display() {
        assert_eq!(Prot::RX.to_string(), "RX");
        assert_eq!(Prot::R.to_string(), "R");
    }
}
