//! Program image loading
//!
//! Copies an ELF image into the guest address space through the MMU, so
//! loading itself demand-allocates pages, and lays out the initial stack.

use std::borrow::Cow;
use std::io::Read;

use goblin::elf::program_header::{PF_X, PT_LOAD, PT_TLS};
use goblin::elf::section_header::{SHF_EXECINSTR, SHT_PROGBITS};
use goblin::elf::sym::STT_TLS;
use goblin::elf::Elf;

use crate::address_space::AddressSpace;
use crate::error::{BridgeError, Result};
use crate::memory::PAGE_SIZE;

/// Pages pre-faulted below the initial stack pointer
pub const STACK_PAGES: u64 = 100;

/// errno's offset in the TLS block when the image carries no `errno` symbol
const TLS_ERRNO_OFFSET: u64 = 0x20;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub entry: u64,
    pub segments: Vec<Segment>,
    /// Page-aligned end of the highest segment, where the heap starts
    pub image_end: u64,
    pub errno_address: Option<u64>,
}

/// Undo gzip or zstd compression, detected by magic number
pub fn decompress(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if data.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| BridgeError::InvalidImage(format!("gzip decompression error: {}", e)))?;
        Ok(Cow::Owned(out))
    } else if data.starts_with(&ZSTD_MAGIC) {
        let out = zstd::stream::decode_all(data)
            .map_err(|e| BridgeError::InvalidImage(format!("zstd decompression error: {}", e)))?;
        Ok(Cow::Owned(out))
    } else {
        Ok(Cow::Borrowed(data))
    }
}

fn file_range<'a>(bytes: &'a [u8], offset: u64, len: u64) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= bytes.len() as u64)
        .ok_or_else(|| BridgeError::InvalidImage(format!("segment at offset {:#x} runs past end of file", offset)))?;
    Ok(&bytes[offset as usize..end as usize])
}

fn load_segment(space: &mut AddressSpace, vaddr: u64, data: &[u8], mem_size: u64) -> Result<()> {
    space.write_virtual(vaddr, data)?;
    let bss = mem_size.saturating_sub(data.len() as u64);
    if bss > 0 {
        space.write_virtual(vaddr + data.len() as u64, &vec![0u8; bss as usize])?;
    }
    Ok(())
}

pub fn load_image(space: &mut AddressSpace, image: &[u8]) -> Result<LoadedImage> {
    let bytes = decompress(image)?;
    let elf = Elf::parse(&bytes)?;
    let ram_size = space.memory.size();

    let mut segments = Vec::new();
    let mut image_end = 0u64;
    let mut tls_base = None;

    if elf.program_headers.is_empty() {
        // plain object file: first executable PROGBITS section goes to 0
        let text = elf
            .section_headers
            .iter()
            .find(|sh| sh.sh_type == SHT_PROGBITS && sh.sh_flags & SHF_EXECINSTR as u64 != 0)
            .ok_or_else(|| BridgeError::InvalidImage("no executable section".into()))?;
        let data = file_range(&bytes, text.sh_offset, text.sh_size)?;
        load_segment(space, 0, data, text.sh_size)?;
        segments.push(Segment { vaddr: 0, file_size: text.sh_size, mem_size: text.sh_size, executable: true });
    }

    for ph in &elf.program_headers {
        match ph.p_type {
            PT_LOAD => {
                let end = ph.p_vaddr.saturating_add(ph.p_memsz);
                if end > ram_size {
                    return Err(BridgeError::InvalidImage(format!(
                        "segment {:#x}..{:#x} does not fit in {:#x} bytes of memory",
                        ph.p_vaddr, end, ram_size
                    )));
                }
                log::info!(
                    "loading segment: offset {:#x} filesize {:#x} memsize {:#x} vaddr {:#x}",
                    ph.p_offset,
                    ph.p_filesz,
                    ph.p_memsz,
                    ph.p_vaddr
                );
                let data = file_range(&bytes, ph.p_offset, ph.p_filesz)?;
                load_segment(space, ph.p_vaddr, data, ph.p_memsz)?;
                segments.push(Segment {
                    vaddr: ph.p_vaddr,
                    file_size: ph.p_filesz,
                    mem_size: ph.p_memsz,
                    executable: ph.p_flags & PF_X != 0,
                });
                image_end = image_end.max(end);
            }
            PT_TLS => tls_base = Some(ph.p_vaddr),
            other => log::debug!("skipping program header type {:#x}", other),
        }
    }

    let errno_address = find_errno(&elf, tls_base);
    if let Some(addr) = errno_address {
        log::info!("errno mirrored at {:#x}", addr);
    }

    Ok(LoadedImage {
        entry: elf.entry,
        segments,
        image_end: image_end.next_multiple_of(PAGE_SIZE),
        errno_address,
    })
}

fn find_errno(elf: &Elf, tls_base: Option<u64>) -> Option<u64> {
    let symbol = elf
        .syms
        .iter()
        .find(|sym| elf.strtab.get_at(sym.st_name) == Some("errno"));
    match (symbol, tls_base) {
        (Some(sym), Some(base)) if sym.st_type() == STT_TLS => Some(base + sym.st_value),
        (Some(sym), _) if sym.st_type() != STT_TLS => Some(sym.st_value),
        (_, Some(base)) => Some(base + TLS_ERRNO_OFFSET),
        _ => None,
    }
}

/// Lay out `argc`, `argv[]`, a NULL argv terminator, an empty `envp` and the
/// argument strings at `sp`. Pages below `sp` are pre-faulted for the stack.
pub fn setup_stack(space: &mut AddressSpace, sp: u64, args: &[String]) -> Result<()> {
    if space.mmu.is_enabled() {
        for n in 1..STACK_PAGES {
            if let Some(addr) = sp.checked_sub(PAGE_SIZE * n) {
                space.translate(addr)?;
            }
        }
        // the runtime reads through a null pointer before auxv exists
        space.translate(0)?;
    }

    let argc = args.len() as u64;
    // argc, argv[argc], NULL, envp NULL
    let mut dst = sp + 8 * (argc + 3);
    space.write_virtual_u64(sp, argc)?;
    for (i, arg) in args.iter().enumerate() {
        space.write_virtual_u64(sp + 8 * (i as u64 + 1), dst)?;
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        space.write_virtual(dst, &bytes)?;
        dst += bytes.len() as u64;
    }
    space.write_virtual_u64(sp + 8 * (argc + 1), 0)?;
    space.write_virtual_u64(sp + 8 * (argc + 2), 0)?;
    Ok(())
}

/// Read back a NUL-terminated guest string
pub fn read_c_string(space: &mut AddressSpace, mut vaddr: u64, max: usize) -> Result<String> {
    let mut out = Vec::new();
    while out.len() < max {
        let byte = space.read_virtual(vaddr, 1)?[0];
        if byte == 0 {
            break;
        }
        out.push(byte);
        vaddr += 1;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::io::Write;

    /// Smallest ELF64 executable with a single PT_LOAD
    fn tiny_elf(entry: u64, vaddr: u64, code: &[u8], bss: u64) -> Vec<u8> {
        let mut elf = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        elf.extend_from_slice(&[0; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&0xf3u16.to_le_bytes()); // RISC-V
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&entry.to_le_bytes());
        elf.extend_from_slice(&64u64.to_le_bytes()); // phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // shoff
        elf.extend_from_slice(&0u32.to_le_bytes());
        elf.extend_from_slice(&64u16.to_le_bytes());
        elf.extend_from_slice(&56u16.to_le_bytes());
        elf.extend_from_slice(&1u16.to_le_bytes());
        elf.extend_from_slice(&64u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(elf.len(), 64);

        elf.extend_from_slice(&PT_LOAD.to_le_bytes());
        elf.extend_from_slice(&(0x4u32 | PF_X).to_le_bytes());
        elf.extend_from_slice(&120u64.to_le_bytes()); // offset
        elf.extend_from_slice(&vaddr.to_le_bytes());
        elf.extend_from_slice(&vaddr.to_le_bytes());
        elf.extend_from_slice(&(code.len() as u64).to_le_bytes());
        elf.extend_from_slice(&(code.len() as u64 + bss).to_le_bytes());
        elf.extend_from_slice(&0x1000u64.to_le_bytes());
        assert_eq!(elf.len(), 120);
        elf.extend_from_slice(code);
        elf
    }

    fn space() -> AddressSpace {
        let config = BridgeConfig {
            ram_size: 1024 * PAGE_SIZE,
            virtual_address_bits: 32,
            page_seed: Some(8),
            ..BridgeConfig::default()
        };
        AddressSpace::new(&config).unwrap()
    }

    #[test]
    fn test_load_segment_and_bss() {
        let mut space = space();
        space.write_virtual(0x10_0000 + 8, &[0xee; 8]).unwrap();
        let image = tiny_elf(0x10_0000, 0x10_0000, &[1, 2, 3, 4, 5, 6, 7, 8], 0x1800);
        let loaded = load_image(&mut space, &image).unwrap();
        assert_eq!(loaded.entry, 0x10_0000);
        assert_eq!(loaded.segments.len(), 1);
        assert!(loaded.segments[0].executable);
        assert_eq!(loaded.image_end, 0x10_2000);
        assert_eq!(loaded.errno_address, None);
        assert_eq!(space.read_virtual(0x10_0000, 8).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // bss is zeroed even over previously written bytes
        assert_eq!(space.read_virtual(0x10_0008, 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_compressed_images() {
        let image = tiny_elf(0x1000, 0x1000, &[0x13, 0, 0, 0], 0);
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&image).unwrap();
        let gz = gz.finish().unwrap();
        let zst = zstd::stream::encode_all(&image[..], 3).unwrap();

        for packed in [gz, zst] {
            assert_eq!(decompress(&packed).unwrap().as_ref(), &image[..]);
            let mut space = space();
            let loaded = load_image(&mut space, &packed).unwrap();
            assert_eq!(loaded.entry, 0x1000);
            assert_eq!(space.read_virtual(0x1000, 4).unwrap(), vec![0x13, 0, 0, 0]);
        }
    }

    #[test]
    fn test_rejects_oversized_and_garbage() {
        let mut space = space();
        let image = tiny_elf(0, 1024 * PAGE_SIZE - 4, &[0; 8], 0);
        assert!(matches!(load_image(&mut space, &image), Err(BridgeError::InvalidImage(_))));
        assert!(matches!(load_image(&mut space, b"definitely not elf"), Err(BridgeError::Elf(_))));
    }

    #[test]
    fn test_stack_layout() {
        let mut space = space();
        let sp = 0x30_0000;
        let args = vec!["prog".to_string(), "-v".to_string()];
        setup_stack(&mut space, sp, &args).unwrap();

        let words: Vec<u64> = space
            .read_virtual(sp, 40)
            .unwrap()
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words[0], 2);
        assert_eq!(words[3], 0);
        assert_eq!(words[4], 0);
        assert_eq!(read_c_string(&mut space, words[1], 64).unwrap(), "prog");
        assert_eq!(read_c_string(&mut space, words[2], 64).unwrap(), "-v");
        assert_eq!(words[1], sp + 40);
    }
}
