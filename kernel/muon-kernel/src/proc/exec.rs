//! ELF loading into a user address space.
//!
//! Parses the executable with `muon-elf`, maps each `PT_LOAD` segment
//! into the target directory with `alloc_region`, and copies the file
//! bytes through the physical window. Frames come out of the PFA zeroed,
//! so the BSS tail past `p_filesz` needs no extra work. Any failure
//! propagates up; the caller tears the half-built directory down.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_elf::{ElfFile, LoadSegment, PF_W};
use muon_mm::page::PageFlags;
use muon_mm::vmm::Vmm;
use muon_mm::{FrameAllocator, FrameDeallocator, PAGE_SIZE};
use planck_noalloc::vec::ArrayVec;

use super::ProcError;

/// Most loadable segments a single executable may carry.
const MAX_SEGMENTS: usize = 16;

/// Loads an ELF image into `dir` and returns its entry point.
///
/// Each `PT_LOAD` segment is page-aligned downward and backed by fresh
/// zeroed frames covering `[vaddr, vaddr + memsz)`; writable segments are
/// mapped writable, everything gets `USER`.
pub fn load_elf(
    vmm: &Vmm,
    pfa: &mut (impl FrameAllocator + FrameDeallocator),
    dir: PhysAddr,
    image: &[u8],
) -> Result<u32, ProcError> {
    let elf = ElfFile::parse(image)?;

    let mut segments: ArrayVec<LoadSegment<'_>, MAX_SEGMENTS> = ArrayVec::new();
    for segment in elf.load_segments() {
        segments
            .try_push(segment)
            .map_err(|_| ProcError::TooManySegments)?;
    }

    for segment in segments.iter() {
        map_segment(vmm, pfa, dir, segment)?;
    }
    Ok(elf.entry_point())
}

/// Maps one segment and copies its file-backed bytes.
fn map_segment(
    vmm: &Vmm,
    pfa: &mut (impl FrameAllocator + FrameDeallocator),
    dir: PhysAddr,
    segment: &LoadSegment<'_>,
) -> Result<(), ProcError> {
    let start = VirtAddr::new(segment.vaddr).page_align_down();
    let span = segment
        .vaddr
        .wrapping_add(segment.memsz)
        .wrapping_sub(start.as_u32());

    let mut flags = PageFlags::USER;
    if segment.flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    vmm.alloc_region(dir, start, span, flags, pfa)?;

    // Copy the file bytes page-wise through the physical window; the
    // directory is not active, so virtual stores are not an option.
    let mut copied = 0usize;
    while copied < segment.data.len() {
        let va = VirtAddr::new(segment.vaddr + copied as u32);
        let page_off = va.as_u32() as usize % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(segment.data.len() - copied);

        let phys = vmm.translate(dir, va).ok_or(ProcError::LoadFailed)?;
        // SAFETY: `phys` was just mapped by alloc_region and is reachable
        // through the window; the chunk stays within one frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                segment.data.as_ptr().add(copied),
                vmm.frame_ptr(phys),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_mm::pfa::{BitmapAllocator, RESERVED_LOW_FRAMES};
    use muon_mm::MemoryRegion;
    use std::alloc::Layout;

    /// Fake physical memory arena, as in the muon-mm VMM tests.
    struct TestArena {
        mem: *mut u8,
        layout: Layout,
        pfa: BitmapAllocator,
    }

    impl TestArena {
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            let mem = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!mem.is_null());
            let words = frames.div_ceil(32);
            let storage = Box::leak(vec![0u32; words].into_boxed_slice()).as_mut_ptr();
            let regions = [MemoryRegion {
                base: 0,
                size: (frames * PAGE_SIZE) as u32,
                usable: true,
            }];
            let pfa = unsafe {
                BitmapAllocator::new((frames * PAGE_SIZE) as u32, &regions, storage).unwrap()
            };
            Self { mem, layout, pfa }
        }

        fn vmm(&mut self) -> Vmm {
            unsafe { Vmm::new(self.mem as usize, &mut self.pfa).unwrap() }
        }

        fn read(&self, phys: PhysAddr) -> u8 {
            unsafe { *self.mem.add(phys.as_u32() as usize) }
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.mem, self.layout) };
        }
    }

    // -- minimal ELF32 builders ---------------------------------------------

    const EHDR_SIZE: usize = 52;
    const PHDR_SIZE: usize = 32;
    const PF_R: u32 = 4;
    const PF_X: u32 = 1;
    const PT_LOAD: u32 = 1;

    fn elf_header(entry: u32, phnum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; EHDR_SIZE];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 1; // ELFCLASS32
        buf[5] = 1; // little-endian
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        buf[24..28].copy_from_slice(&entry.to_le_bytes());
        buf[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&phnum.to_le_bytes());
        buf
    }

    #[allow(clippy::too_many_arguments)]
    fn push_phdr(
        buf: &mut Vec<u8>,
        p_type: u32,
        flags: u32,
        offset: u32,
        vaddr: u32,
        filesz: u32,
        memsz: u32,
    ) {
        let start = buf.len();
        buf.resize(start + PHDR_SIZE, 0);
        let b = &mut buf[start..];
        b[0..4].copy_from_slice(&p_type.to_le_bytes());
        b[4..8].copy_from_slice(&offset.to_le_bytes());
        b[8..12].copy_from_slice(&vaddr.to_le_bytes());
        b[16..20].copy_from_slice(&filesz.to_le_bytes());
        b[20..24].copy_from_slice(&memsz.to_le_bytes());
        b[24..28].copy_from_slice(&flags.to_le_bytes());
    }

    const ENTRY: u32 = 0x0804_8000;

    #[test]
    fn load_copies_segment_payload() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 199) as u8).collect();
        let data_off = (EHDR_SIZE + PHDR_SIZE) as u32;
        let mut image = elf_header(ENTRY, 1);
        push_phdr(
            &mut image,
            PT_LOAD,
            PF_R | PF_X,
            data_off,
            ENTRY,
            payload.len() as u32,
            payload.len() as u32,
        );
        image.extend_from_slice(&payload);

        let entry = load_elf(&vmm, &mut arena.pfa, dir, &image).unwrap();
        assert_eq!(entry, ENTRY);

        // Read the loaded bytes back through translate + window.
        for (i, expected) in payload.iter().enumerate() {
            let phys = vmm
                .translate(dir, VirtAddr::new(ENTRY + i as u32))
                .expect("segment byte must be mapped");
            assert_eq!(arena.read(phys), *expected, "byte {i}");
        }
    }

    #[test]
    fn pure_bss_segment_reads_as_zero_from_user_space() {
        // A LOAD segment with p_filesz = 0 and p_memsz = one page: every
        // byte of the mapped page must be zero.
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let mut image = elf_header(ENTRY, 1);
        push_phdr(&mut image, PT_LOAD, PF_R | 2, 0, ENTRY, 0, PAGE_SIZE as u32);

        load_elf(&vmm, &mut arena.pfa, dir, &image).unwrap();

        for i in (0..PAGE_SIZE as u32).step_by(64) {
            let phys = vmm.translate(dir, VirtAddr::new(ENTRY + i)).unwrap();
            assert_eq!(arena.read(phys), 0);
        }
    }

    #[test]
    fn bss_tail_after_file_bytes_is_zero() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let payload = [0xEEu8; 100];
        let data_off = (EHDR_SIZE + PHDR_SIZE) as u32;
        let mut image = elf_header(ENTRY, 1);
        push_phdr(
            &mut image,
            PT_LOAD,
            PF_R | 2,
            data_off,
            ENTRY,
            payload.len() as u32,
            2 * PAGE_SIZE as u32,
        );
        image.extend_from_slice(&payload);

        load_elf(&vmm, &mut arena.pfa, dir, &image).unwrap();

        let phys = vmm.translate(dir, VirtAddr::new(ENTRY + 99)).unwrap();
        assert_eq!(arena.read(phys), 0xEE);
        // Everything past p_filesz up to p_memsz reads as zero.
        for off in [100u32, 512, PAGE_SIZE as u32, 2 * PAGE_SIZE as u32 - 1] {
            let phys = vmm.translate(dir, VirtAddr::new(ENTRY + off)).unwrap();
            assert_eq!(arena.read(phys), 0);
        }
    }

    #[test]
    fn misaligned_segment_start_is_aligned_down() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let vaddr = ENTRY + 0x234;
        let payload = [0x77u8; 64];
        let data_off = (EHDR_SIZE + PHDR_SIZE) as u32;
        let mut image = elf_header(vaddr, 1);
        push_phdr(&mut image, PT_LOAD, PF_R | PF_X, data_off, vaddr, 64, 64);
        image.extend_from_slice(&payload);

        load_elf(&vmm, &mut arena.pfa, dir, &image).unwrap();

        // The containing page is mapped from its aligned base.
        assert!(vmm.translate(dir, VirtAddr::new(ENTRY)).is_some());
        let phys = vmm.translate(dir, VirtAddr::new(vaddr)).unwrap();
        assert_eq!(arena.read(phys), 0x77);
    }

    #[test]
    fn invalid_image_is_rejected_and_leaves_nothing_behind() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_before = arena.pfa.used_frames();

        let err = load_elf(&vmm, &mut arena.pfa, dir, b"not an elf");
        assert!(matches!(err, Err(ProcError::Elf(_))));
        assert_eq!(arena.pfa.used_frames(), used_before);
    }

    #[test]
    fn oom_during_load_propagates_and_teardown_reclaims() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 8);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();
        let used_with_dir = arena.pfa.used_frames();

        // A 64-page segment cannot fit in the remaining frames.
        let mut image = elf_header(ENTRY, 1);
        push_phdr(&mut image, PT_LOAD, PF_R | 2, 0, ENTRY, 0, (64 * PAGE_SIZE) as u32);

        let err = load_elf(&vmm, &mut arena.pfa, dir, &image);
        assert!(matches!(err, Err(ProcError::Vmm(_))));

        // alloc_region rolled its prefix back; destroying the directory
        // returns the rest.
        assert_eq!(arena.pfa.used_frames(), used_with_dir);
        vmm.destroy_address_space(dir, &mut arena.pfa);
        assert_eq!(arena.pfa.used_frames(), used_with_dir - 1);
    }

    #[test]
    fn two_segments_text_and_data() {
        let mut arena = TestArena::new(RESERVED_LOW_FRAMES + 64);
        let vmm = arena.vmm();
        let dir = vmm.create_address_space(&mut arena.pfa).unwrap();

        let text = [0x90u8; 32]; // nops
        let data = [0x11u8; 16];
        let text_off = (EHDR_SIZE + 2 * PHDR_SIZE) as u32;
        let data_off = text_off + text.len() as u32;
        let data_vaddr = ENTRY + 0x0010_0000;

        let mut image = elf_header(ENTRY, 2);
        push_phdr(&mut image, PT_LOAD, PF_R | PF_X, text_off, ENTRY, 32, 32);
        push_phdr(&mut image, PT_LOAD, PF_R | 2, data_off, data_vaddr, 16, 16);
        image.extend_from_slice(&text);
        image.extend_from_slice(&data);

        load_elf(&vmm, &mut arena.pfa, dir, &image).unwrap();

        let text_phys = vmm.translate(dir, VirtAddr::new(ENTRY)).unwrap();
        assert_eq!(arena.read(text_phys), 0x90);
        let data_phys = vmm.translate(dir, VirtAddr::new(data_vaddr)).unwrap();
        assert_eq!(arena.read(data_phys), 0x11);
    }
}
