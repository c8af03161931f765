//! Architecture-specific type definitions.
//!
//! Only the plain-data parts live here (register layouts, selector
//! constants); instruction sequences belong to the kernel crate. Keeping
//! the layouts in core lets the scheduler and the host test suite build
//! trap frames without touching privileged instructions.

pub mod x86;
