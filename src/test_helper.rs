//! Helpers for synthesizing tiny object files used throughout the test
//! suite, so that tests do not depend on binary fixtures checked into
//! the repository.

use std::fs::create_dir_all;
use std::fs::write;
use std::path::Path;

use tempfile::NamedTempFile;


const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOTE: u32 = 7;

/// The virtual address at which the fixture's single `PT_LOAD` segment
/// (spanning the whole file, from file offset zero) is based.
pub(crate) const LOAD_VADDR: u64 = 0x1000;


fn align_to(data: &mut Vec<u8>, align: usize) {
    while data.len() % align != 0 {
        data.push(0);
    }
}

fn put_u32(data: &mut [u8], off: usize, value: u32) {
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(data: &mut [u8], off: usize, value: u64) {
    data[off..off + 8].copy_from_slice(&value.to_le_bytes());
}


struct Section {
    name: &'static str,
    sh_type: u32,
    data: Vec<u8>,
    link: u32,
    entsize: u64,
    addralign: u64,
}


/// A builder for minimal ELF64 object files.
pub(crate) struct ElfFixture {
    symbols: Vec<(u64, String)>,
    build_id: Option<Vec<u8>>,
    gopclntab: Option<Vec<u8>>,
}

impl ElfFixture {
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
            build_id: None,
            gopclntab: None,
        }
    }

    /// Add a function symbol at the given virtual address.
    pub fn symbol(mut self, addr: u64, name: &str) -> Self {
        let () = self.symbols.push((addr, name.to_string()));
        self
    }

    /// Embed a GNU build ID note.
    pub fn build_id(mut self, id: &[u8]) -> Self {
        self.build_id = Some(id.to_vec());
        self
    }

    /// Embed a `.gopclntab` section with the provided contents.
    pub fn gopclntab(mut self, data: Vec<u8>) -> Self {
        self.gopclntab = Some(data);
        self
    }

    fn build(&self) -> Vec<u8> {
        let mut sections = vec![Section {
            name: ".text",
            sh_type: SHT_PROGBITS,
            data: vec![0xcc; 64],
            link: 0,
            entsize: 0,
            addralign: 16,
        }];

        if !self.symbols.is_empty() {
            let mut strtab = vec![0u8];
            let mut symtab = vec![0u8; SYM_SIZE]; // null symbol
            for (addr, name) in &self.symbols {
                let name_off = strtab.len() as u32;
                let () = strtab.extend_from_slice(name.as_bytes());
                let () = strtab.push(0);

                let mut sym = [0u8; SYM_SIZE];
                put_u32(&mut sym, 0, name_off);
                sym[4] = 0x12; // STB_GLOBAL, STT_FUNC
                sym[6..8].copy_from_slice(&1u16.to_le_bytes()); // .text
                put_u64(&mut sym, 8, *addr);
                let () = symtab.extend_from_slice(&sym);
            }
            // `sh_link` indices depend on section order; .symtab is
            // next (index 2), .strtab right after it (index 3).
            let () = sections.push(Section {
                name: ".symtab",
                sh_type: SHT_SYMTAB,
                data: symtab,
                link: sections.len() as u32 + 2,
                entsize: SYM_SIZE as u64,
                addralign: 8,
            });
            let () = sections.push(Section {
                name: ".strtab",
                sh_type: SHT_STRTAB,
                data: strtab,
                link: 0,
                entsize: 0,
                addralign: 1,
            });
        }

        if let Some(id) = &self.build_id {
            let mut note = Vec::new();
            let () = note.extend_from_slice(&4u32.to_le_bytes()); // n_namesz
            let () = note.extend_from_slice(&(id.len() as u32).to_le_bytes()); // n_descsz
            let () = note.extend_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
            let () = note.extend_from_slice(b"GNU\0");
            let () = note.extend_from_slice(id);
            let () = sections.push(Section {
                name: ".note.gnu.build-id",
                sh_type: SHT_NOTE,
                data: note,
                link: 0,
                entsize: 0,
                addralign: 4,
            });
        }

        if let Some(pclntab) = &self.gopclntab {
            let () = sections.push(Section {
                name: ".gopclntab",
                sh_type: SHT_PROGBITS,
                data: pclntab.clone(),
                link: 0,
                entsize: 0,
                addralign: 8,
            });
        }

        // Section name string table, always last.
        let mut shstrtab = vec![0u8];
        let mut name_offs = vec![0u32]; // null section
        for section in &sections {
            let () = name_offs.push(shstrtab.len() as u32);
            let () = shstrtab.extend_from_slice(section.name.as_bytes());
            let () = shstrtab.push(0);
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        let () = shstrtab.extend_from_slice(b".shstrtab\0");
        let () = name_offs.push(shstrtab_name_off);
        let () = sections.push(Section {
            name: ".shstrtab",
            sh_type: SHT_STRTAB,
            data: shstrtab,
            link: 0,
            entsize: 0,
            addralign: 1,
        });

        // Lay out: ehdr, one phdr, section data, section header table.
        let mut data = vec![0u8; EHDR_SIZE + PHDR_SIZE];
        let mut offsets = Vec::new();
        for section in &sections {
            let () = align_to(&mut data, section.addralign.max(1) as usize);
            let () = offsets.push(data.len() as u64);
            let () = data.extend_from_slice(&section.data);
        }
        let () = align_to(&mut data, 8);
        let shoff = data.len() as u64;
        let shnum = sections.len() + 1; // plus the null section

        // Null section header.
        let () = data.extend_from_slice(&[0u8; SHDR_SIZE]);
        for (idx, section) in sections.iter().enumerate() {
            let mut shdr = [0u8; SHDR_SIZE];
            put_u32(&mut shdr, 0, name_offs[idx + 1]);
            put_u32(&mut shdr, 4, section.sh_type);
            put_u64(&mut shdr, 16, LOAD_VADDR + offsets[idx]); // sh_addr
            put_u64(&mut shdr, 24, offsets[idx]); // sh_offset
            put_u64(&mut shdr, 32, section.data.len() as u64); // sh_size
            put_u32(&mut shdr, 40, section.link);
            put_u64(&mut shdr, 48, section.addralign);
            put_u64(&mut shdr, 56, section.entsize);
            let () = data.extend_from_slice(&shdr);
        }

        let filesz = data.len() as u64;

        // ELF header.
        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = 2; // ELFCLASS64
        data[5] = 1; // ELFDATA2LSB
        data[6] = 1; // EV_CURRENT
        data[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        data[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        put_u32(&mut data, 20, 1); // e_version
        put_u64(&mut data, 32, EHDR_SIZE as u64); // e_phoff
        put_u64(&mut data, 40, shoff); // e_shoff
        data[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        data[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        data[58..60].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes()); // e_shentsize
        data[60..62].copy_from_slice(&(shnum as u16).to_le_bytes()); // e_shnum
        data[62..64].copy_from_slice(&((shnum - 1) as u16).to_le_bytes()); // e_shstrndx

        // One PT_LOAD segment spanning the entire file.
        let phdr_off = EHDR_SIZE;
        put_u32(&mut data[phdr_off..], 0, 1); // PT_LOAD
        put_u32(&mut data[phdr_off..], 4, 0x5); // R + X
        put_u64(&mut data[phdr_off..], 8, 0); // p_offset
        put_u64(&mut data[phdr_off..], 16, LOAD_VADDR); // p_vaddr
        put_u64(&mut data[phdr_off..], 24, LOAD_VADDR); // p_paddr
        put_u64(&mut data[phdr_off..], 32, filesz); // p_filesz
        put_u64(&mut data[phdr_off..], 40, filesz); // p_memsz
        put_u64(&mut data[phdr_off..], 48, 0x1000); // p_align

        data
    }

    /// Write the object file to a fresh temporary file.
    pub fn write(&self) -> NamedTempFile {
        Self::write_raw(&self.build())
    }

    /// Write the object file to the given path, creating parent
    /// directories as necessary.
    pub fn write_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let () = create_dir_all(parent).unwrap();
        }
        let () = write(path, self.build()).unwrap();
    }

    /// Write raw bytes to a fresh temporary file.
    pub fn write_raw(data: &[u8]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let () = write(file.path(), data).unwrap();
        file
    }
}


/// The Go runtime line table layouts we can synthesize.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum PclntabLayout {
    /// The layout used by Go 1.16 and 1.17.
    V116,
    /// The layout used by Go 1.20 and later.
    V120,
}

/// Synthesize a `.gopclntab` image containing the provided functions
/// (entry address, name), bounded by `end_pc`.
pub(crate) fn pclntab_bytes(
    layout: PclntabLayout,
    funcs: &[(u64, &str)],
    end_pc: u64,
) -> Vec<u8> {
    let nfunc = funcs.len() as u64;
    let text_start = funcs.first().map(|(addr, _name)| *addr).unwrap_or(0);

    // Function name blob, offsets recorded per function.
    let mut nametab = Vec::new();
    let mut name_offs = Vec::new();
    for (_addr, name) in funcs {
        let () = name_offs.push(nametab.len() as u32);
        let () = nametab.extend_from_slice(name.as_bytes());
        let () = nametab.push(0);
    }

    let header_words = match layout {
        PclntabLayout::V116 => 7,
        PclntabLayout::V120 => 8,
    };
    let mut data = vec![0u8; 8 + header_words * 8];
    let magic: u32 = match layout {
        PclntabLayout::V116 => 0xffff_fffa,
        PclntabLayout::V120 => 0xffff_fff1,
    };
    put_u32(&mut data, 0, magic);
    data[6] = 1; // instruction size quantum
    data[7] = 8; // pointer size

    let () = align_to(&mut data, 8);
    let funcname_off = data.len() as u64;
    let () = data.extend_from_slice(&nametab);
    let () = align_to(&mut data, 8);
    let pcln_off = data.len() as u64;

    // Function table: pairs of (entry, funcoff) plus a trailing end
    // marker, followed by the per-function data records the funcoffs
    // point at.
    match layout {
        PclntabLayout::V116 => {
            let functab_size = (funcs.len() * 2 + 1) * 8;
            let mut func_off = functab_size as u64;
            let mut functab = Vec::new();
            let mut funcdata = Vec::new();
            for ((addr, _name), name_off) in funcs.iter().zip(&name_offs) {
                let () = functab.extend_from_slice(&addr.to_le_bytes());
                let () = functab.extend_from_slice(&func_off.to_le_bytes());
                // Record: entry (uintptr), nameoff (i32), padding.
                let () = funcdata.extend_from_slice(&addr.to_le_bytes());
                let () = funcdata.extend_from_slice(&name_off.to_le_bytes());
                let () = funcdata.extend_from_slice(&[0u8; 4]);
                func_off += 16;
            }
            let () = functab.extend_from_slice(&end_pc.to_le_bytes());
            let () = data.extend_from_slice(&functab);
            let () = data.extend_from_slice(&funcdata);
        }
        PclntabLayout::V120 => {
            let functab_size = (funcs.len() * 2 + 1) * 4;
            let mut func_off = functab_size as u64;
            let mut functab = Vec::new();
            let mut funcdata = Vec::new();
            for ((addr, _name), name_off) in funcs.iter().zip(&name_offs) {
                let entry_off = (addr - text_start) as u32;
                let () = functab.extend_from_slice(&entry_off.to_le_bytes());
                let () = functab.extend_from_slice(&(func_off as u32).to_le_bytes());
                // Record: entryoff (u32), nameoff (i32).
                let () = funcdata.extend_from_slice(&entry_off.to_le_bytes());
                let () = funcdata.extend_from_slice(&name_off.to_le_bytes());
                func_off += 8;
            }
            let () = functab.extend_from_slice(&((end_pc - text_start) as u32).to_le_bytes());
            let () = data.extend_from_slice(&functab);
            let () = data.extend_from_slice(&funcdata);
        }
    }

    // Patch the header fields now that all offsets are known.
    match layout {
        PclntabLayout::V116 => {
            put_u64(&mut data, 8, nfunc);
            put_u64(&mut data, 24, funcname_off);
            put_u64(&mut data, 56, pcln_off);
        }
        PclntabLayout::V120 => {
            put_u64(&mut data, 8, nfunc);
            put_u64(&mut data, 24, text_start);
            put_u64(&mut data, 32, funcname_off);
            put_u64(&mut data, 64, pcln_off);
        }
    }

    data
}
