#![no_std]

pub mod bit_array;
pub mod mem;
pub mod sizes;

// Re-exported so the `bitfield!` macro can name it as `$crate::paste`.
pub use paste;
