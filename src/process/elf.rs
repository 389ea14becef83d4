//! ELF64 header/program-header parsing and validation (§6). Deliberately
//! minimal — just enough of the format to load a statically-linked,
//! non-PIE executable: no section headers, no relocations, no dynamic
//! linking.

use crate::config::USER_BOUNDARY;
use crate::errors::LoadError;

const EI_MAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

/// Bound on program headers a single executable may declare (§6).
pub const MAX_PHNUM: u16 = 1024;

/// Size in bytes of an Elf64_Phdr entry — §6 requires the header's declared
/// entry size to match this exactly.
pub const PHDR_SIZE: u16 = 56;

pub struct Ehdr {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(off..off + 8)?.try_into().ok()?))
}

/// Validates the fixed ELF64 header fields (§6: magic, class, endianness,
/// machine, type, program-header count) and extracts what the loader
/// needs.
pub fn parse_ehdr(buf: &[u8]) -> Result<Ehdr, LoadError> {
    if buf.len() < 64 || buf[0..4] != EI_MAG {
        return Err(LoadError::InvalidMagic);
    }
    if buf[4] != ELFCLASS64 {
        return Err(LoadError::UnsupportedClass);
    }
    if buf[5] != ELFDATA2LSB {
        return Err(LoadError::UnsupportedClass);
    }
    let e_type = read_u16(buf, 16).ok_or(LoadError::BadProgramHeader)?;
    if e_type != ET_EXEC {
        return Err(LoadError::UnsupportedType);
    }
    let e_machine = read_u16(buf, 18).ok_or(LoadError::BadProgramHeader)?;
    if e_machine != EM_X86_64 {
        return Err(LoadError::UnsupportedMachine);
    }
    let entry = read_u64(buf, 24).ok_or(LoadError::BadProgramHeader)?;
    let phoff = read_u64(buf, 32).ok_or(LoadError::BadProgramHeader)?;
    let phentsize = read_u16(buf, 54).ok_or(LoadError::BadProgramHeader)?;
    if phentsize != PHDR_SIZE {
        return Err(LoadError::BadProgramHeader);
    }
    let phnum = read_u16(buf, 56).ok_or(LoadError::BadProgramHeader)?;
    if phnum > MAX_PHNUM {
        return Err(LoadError::TooManyProgramHeaders);
    }
    Ok(Ehdr { entry, phoff, phentsize, phnum })
}

pub fn parse_phdr(buf: &[u8], off: usize) -> Result<Phdr, LoadError> {
    Ok(Phdr {
        p_type: read_u32(buf, off).ok_or(LoadError::BadProgramHeader)?,
        p_flags: read_u32(buf, off + 4).ok_or(LoadError::BadProgramHeader)?,
        p_offset: read_u64(buf, off + 8).ok_or(LoadError::BadProgramHeader)?,
        p_vaddr: read_u64(buf, off + 16).ok_or(LoadError::BadProgramHeader)?,
        p_filesz: read_u64(buf, off + 32).ok_or(LoadError::BadProgramHeader)?,
        p_memsz: read_u64(buf, off + 40).ok_or(LoadError::BadProgramHeader)?,
    })
}

/// Segment types exec refuses outright (§6): no dynamic linking in scope.
pub fn is_banned_type(p_type: u32) -> bool {
    matches!(p_type, PT_DYNAMIC | PT_INTERP | PT_SHLIB)
}

pub fn is_load(p_type: u32) -> bool {
    p_type == PT_LOAD
}

/// Validates one already-filtered PT_LOAD segment against §6's rules:
/// `p_offset` and `p_vaddr` agree modulo the page size, `memsz >= filesz >
/// 0`, and the whole mapped range lies within user space without wrapping
/// or touching page zero.
pub fn validate_load_segment(p: &Phdr, page_size: u64) -> Result<(), LoadError> {
    if p.p_filesz == 0 || p.p_memsz < p.p_filesz {
        return Err(LoadError::BadProgramHeader);
    }
    if (p.p_offset % page_size) != (p.p_vaddr % page_size) {
        return Err(LoadError::BadProgramHeader);
    }
    if p.p_vaddr < page_size {
        return Err(LoadError::SegmentOutOfBounds);
    }
    let end = p.p_vaddr.checked_add(p.p_memsz).ok_or(LoadError::SegmentOutOfBounds)?;
    if end <= p.p_vaddr || end > USER_BOUNDARY {
        return Err(LoadError::SegmentOutOfBounds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(e_type: u16, e_machine: u8) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 64];
        buf[0..4].copy_from_slice(&EI_MAG);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&(e_machine as u16).to_le_bytes());
        buf[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[32..40].copy_from_slice(&64u64.to_le_bytes());
        buf[54..56].copy_from_slice(&56u16.to_le_bytes());
        buf[56..58].copy_from_slice(&1u16.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = alloc::vec![0u8; 64];
        assert_eq!(parse_ehdr(&buf).unwrap_err(), LoadError::InvalidMagic);
    }

    #[test]
    fn accepts_valid_exec_header() {
        let buf = minimal_header(ET_EXEC, 0x3E);
        let ehdr = parse_ehdr(&buf).unwrap();
        assert_eq!(ehdr.entry, 0x1000);
        assert_eq!(ehdr.phnum, 1);
    }

    #[test]
    fn rejects_wrong_machine() {
        let buf = minimal_header(ET_EXEC, 0x28);
        assert_eq!(parse_ehdr(&buf).unwrap_err(), LoadError::UnsupportedMachine);
    }

    #[test]
    fn rejects_bad_phentsize() {
        let mut buf = minimal_header(ET_EXEC, 0x3E);
        buf[54..56].copy_from_slice(&48u16.to_le_bytes());
        assert_eq!(parse_ehdr(&buf).unwrap_err(), LoadError::BadProgramHeader);
    }

    #[test]
    fn load_segment_rejects_page_offset_mismatch() {
        let p = Phdr { p_type: PT_LOAD, p_flags: 0, p_offset: 1, p_vaddr: 0x40_0000, p_filesz: 10, p_memsz: 10 };
        assert_eq!(validate_load_segment(&p, 4096).unwrap_err(), LoadError::BadProgramHeader);
    }

    #[test]
    fn load_segment_rejects_page_zero() {
        let p = Phdr { p_type: PT_LOAD, p_flags: 0, p_offset: 0, p_vaddr: 0, p_filesz: 10, p_memsz: 10 };
        assert_eq!(validate_load_segment(&p, 4096).unwrap_err(), LoadError::SegmentOutOfBounds);
    }

    #[test]
    fn banned_types_rejected() {
        assert!(is_banned_type(PT_DYNAMIC));
        assert!(is_banned_type(PT_INTERP));
        assert!(!is_banned_type(PT_LOAD));
    }
}
