pub use anyhow::Error;
use linker_utils::aarch64::EdgeKind;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The closed set of failures the linker core produces. Callers that need to
/// react to a specific failure can downcast the returned `anyhow::Error` to
/// this type.
#[derive(Debug)]
pub enum LinkError {
    /// The classifier rejected a relocation record's field combination.
    UnsupportedRelocation {
        r_address: u32,
        r_symbolnum: u32,
        r_type: u8,
        r_pcrel: bool,
        r_extern: bool,
        r_length: u8,
    },
    /// A SUBTRACTOR/UNSIGNED or ADDEND/partner sequence was malformed.
    MalformedPair(String),
    /// The instruction at a fixup site doesn't match the pattern the edge
    /// kind requires.
    MalformedInstruction {
        kind: EdgeKind,
        expected: &'static str,
        found: u32,
    },
    /// A relocation's byte span extends past its owning block's content.
    FixupOutOfBlock { fixup_address: u64, block_end: u64 },
    /// A computed relocation value doesn't fit the instruction's immediate
    /// field.
    TargetOutOfRange {
        kind: EdgeKind,
        value: i64,
        fixup_address: u64,
    },
    /// A computed relocation value violates the edge kind's alignment
    /// requirement.
    Misalignment {
        kind: EdgeKind,
        value: i64,
        fixup_address: u64,
    },
    /// A symbol lookup by index, name or address failed.
    SymbolNotFound(String),
}

/// Like debug_assert, but bails instead of panicking. Returning an error lets
/// us say which block / edge we were processing, whereas a panic only gives a
/// backtrace.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::UnsupportedRelocation {
                r_address,
                r_symbolnum,
                r_type,
                r_pcrel,
                r_extern,
                r_length,
            } => write!(
                f,
                "Unsupported arm64 relocation: address={r_address:#x}, \
                 symbolnum={r_symbolnum:#x}, kind={}, pc_rel={r_pcrel}, \
                 extern={r_extern}, length={r_length}",
                linker_utils::macho::arm64_rel_type_to_string(*r_type)
            ),
            LinkError::MalformedPair(message) => write!(f, "Malformed relocation pair: {message}"),
            LinkError::MalformedInstruction {
                kind,
                expected,
                found,
            } => write!(
                f,
                "{kind} fixup site does not hold {expected} (found {found:#010x})"
            ),
            LinkError::FixupOutOfBlock {
                fixup_address,
                block_end,
            } => write!(
                f,
                "Relocation content at {fixup_address:#x} extends past end of fixup block \
                 ({block_end:#x})"
            ),
            LinkError::TargetOutOfRange {
                kind,
                value,
                fixup_address,
            } => write!(
                f,
                "Relocation target out of range: {kind} at {fixup_address:#x}, value {value:#x}"
            ),
            LinkError::Misalignment {
                kind,
                value,
                fixup_address,
            } => write!(
                f,
                "Relocation target not aligned: {kind} at {fixup_address:#x}, value {value:#x}"
            ),
            LinkError::SymbolNotFound(message) => write!(f, "Symbol not found: {message}"),
        }
    }
}

impl core::error::Error for LinkError {}
