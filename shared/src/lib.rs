#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod bit_array;
#[cfg(target_os = "none")]
pub mod logger;
pub mod mem;
pub mod paging;
pub mod sizes;
