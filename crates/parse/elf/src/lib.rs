//! Minimal ELF32 parser for the Muon kernel.
//!
//! Parses ELF32 little-endian headers and `PT_LOAD` segments from raw byte
//! slices using safe field extraction (`from_le_bytes`). No unsafe code,
//! no allocations.
//!
//! # Usage
//!
//! ```
//! use muon_elf::ElfFile;
//!
//! fn load_elf(data: &[u8]) {
//!     if let Ok(elf) = ElfFile::parse(data) {
//!         let _entry = elf.entry_point();
//!         for seg in elf.load_segments() {
//!             // Map seg.data at seg.vaddr, zero-fill to seg.memsz.
//!         }
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod header;
pub mod segment;

pub use header::{Elf32Header, ElfError, PF_R, PF_W, PF_X};
pub use segment::{ElfFile, LoadSegment};
