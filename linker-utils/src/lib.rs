pub mod aarch64;
pub mod bit_misc;
pub mod macho;
