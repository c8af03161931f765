//! ELF32 segment (program header) iteration.
//!
//! Provides [`ElfFile`] as the main entry point for parsing an ELF32
//! binary, and [`LoadSegment`] for iterating over `PT_LOAD` segments.

use crate::header::{ELF32_PHDR_SIZE, Elf32Header, Elf32ProgramHeader, ElfError, PT_LOAD};

/// A parsed ELF32 file, holding a reference to the raw data and the parsed
/// header.
#[derive(Debug, Clone, Copy)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf32Header,
}

/// A loadable segment extracted from an ELF32 file.
#[derive(Debug)]
pub struct LoadSegment<'a> {
    /// Virtual address where this segment should be mapped.
    pub vaddr: u32,
    /// File content of this segment (may be shorter than `memsz`; the
    /// remainder is zero-filled by the loader).
    pub data: &'a [u8],
    /// Total size of the segment in memory.
    pub memsz: u32,
    /// Segment permission flags (`PF_R`, `PF_W`, `PF_X`).
    pub flags: u32,
}

impl<'a> ElfFile<'a> {
    /// Parse an ELF32 file from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] if the header is invalid or the data is too
    /// short.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf32Header::parse(data)?;
        Ok(Self { data, header })
    }

    /// Returns the virtual address of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.header.e_entry
    }

    /// Returns the parsed ELF32 file header.
    #[must_use]
    pub fn header(&self) -> &Elf32Header {
        &self.header
    }

    /// Returns an iterator over `PT_LOAD` segments.
    ///
    /// Each yielded [`LoadSegment`] borrows the file-backed portion from
    /// the original data. A segment whose file extent runs past the end of
    /// the input yields the bytes that are there.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> {
        let data = self.data;
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        let phnum = self.header.e_phnum as usize;

        (0..phnum).filter_map(move |i| {
            let offset = phoff + i * phentsize;
            if offset + ELF32_PHDR_SIZE > data.len() {
                return None;
            }

            let phdr = Elf32ProgramHeader::parse(data, offset);
            if phdr.seg_type != PT_LOAD {
                return None;
            }

            let file_offset = phdr.offset as usize;
            let file_size = phdr.filesz as usize;

            let seg_data = if file_size == 0 {
                &[] as &[u8]
            } else if file_offset + file_size <= data.len() {
                &data[file_offset..file_offset + file_size]
            } else {
                // Truncated segment: return what is actually present.
                &data[file_offset.min(data.len())..]
            };

            Some(LoadSegment {
                vaddr: phdr.vaddr,
                data: seg_data,
                memsz: phdr.memsz,
                flags: phdr.flags,
            })
        })
    }
}
