use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::mem;
use std::mem::size_of;
use std::path::Path;

use once_cell::sync::OnceCell;

use crate::mmap::Mmap;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Ehdr;
use super::types::Elf64_Phdr;
use super::types::Elf64_Shdr;
use super::types::Elf64_Sym;
use super::types::PN_XNUM;
use super::types::SHN_UNDEF;
use super::types::SHN_XINDEX;


#[derive(Clone, Copy, Debug)]
struct EhdrExt<'mmap> {
    /// The ELF header.
    ehdr: &'mmap Elf64_Ehdr,
    /// Override of `ehdr.e_shnum`, handling of which is special-cased
    /// by the ELF standard.
    shnum: usize,
    /// Override of `ehdr.e_phnum`, handling of which is special-cased
    /// by the ELF standard.
    phnum: usize,
}


struct Cache<'mmap> {
    /// A slice of the raw ELF data that we are about to parse.
    elf_data: &'mmap [u8],
    /// The cached ELF header.
    ehdr: OnceCell<EhdrExt<'mmap>>,
    /// The cached ELF section headers.
    shdrs: OnceCell<&'mmap [Elf64_Shdr]>,
    /// The cached section name string table.
    shstrtab: OnceCell<&'mmap [u8]>,
    /// The cached ELF program headers.
    phdrs: OnceCell<&'mmap [Elf64_Phdr]>,
}

impl<'mmap> Cache<'mmap> {
    fn new(elf_data: &'mmap [u8]) -> Self {
        Self {
            elf_data,
            ehdr: OnceCell::new(),
            shdrs: OnceCell::new(),
            shstrtab: OnceCell::new(),
            phdrs: OnceCell::new(),
        }
    }

    /// Read the very first section header.
    ///
    /// ELF contains a couple of clauses that special case data ranges
    /// of certain member variables to reference data from this header,
    /// which otherwise is zeroed out.
    #[inline]
    fn read_first_shdr(&self, ehdr: &Elf64_Ehdr) -> Result<&'mmap Elf64_Shdr> {
        self.elf_data
            .get(ehdr.e_shoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
            .read_pod_ref::<Elf64_Shdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Shdr")
    }

    fn parse_ehdr(&self) -> Result<EhdrExt<'mmap>> {
        let mut elf_data = self.elf_data;
        let ehdr = elf_data
            .read_pod_ref::<Elf64_Ehdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
        if !(ehdr.e_ident[0] == 0x7f
            && ehdr.e_ident[1] == b'E'
            && ehdr.e_ident[2] == b'L'
            && ehdr.e_ident[3] == b'F')
        {
            return Err(Error::with_invalid_data(format!(
                "encountered unexpected e_ident: {:x?}",
                &ehdr.e_ident[0..4]
            )))
        }

        // "If the number of entries in the section header table is
        // larger than or equal to SHN_LORESERVE, e_shnum holds the
        // value zero and the real number of entries is held in the
        // sh_size member of the initial section header."
        let shnum = if ehdr.e_shnum == 0 && ehdr.e_shoff != 0 {
            let shdr = self.read_first_shdr(ehdr)?;
            usize::try_from(shdr.sh_size)
                .ok()
                .ok_or_invalid_data(|| "ELF file contains unsupported number of sections")?
        } else {
            ehdr.e_shnum.into()
        };

        // "If the number of entries in the program header table is
        // larger than or equal to PN_XNUM (0xffff), this member holds
        // PN_XNUM and the real number of entries is held in the sh_info
        // member of the initial section header."
        let phnum = if ehdr.e_phnum == PN_XNUM {
            let shdr = self.read_first_shdr(ehdr)?;
            usize::try_from(shdr.sh_info)
                .ok()
                .ok_or_invalid_data(|| "ELF file contains unsupported number of program headers")?
        } else {
            ehdr.e_phnum.into()
        };

        Ok(EhdrExt { ehdr, shnum, phnum })
    }

    fn ensure_ehdr(&self) -> Result<&EhdrExt<'mmap>> {
        self.ehdr.get_or_try_init(|| self.parse_ehdr())
    }

    fn ensure_shdrs(&self) -> Result<&'mmap [Elf64_Shdr]> {
        self.shdrs
            .get_or_try_init(|| {
                let ehdr = self.ensure_ehdr()?;
                self.elf_data
                    .get(ehdr.ehdr.e_shoff as usize..)
                    .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
                    .read_pod_slice_ref::<Elf64_Shdr>(ehdr.shnum)
                    .ok_or_invalid_data(|| "failed to read section headers")
            })
            .copied()
    }

    fn ensure_phdrs(&self) -> Result<&'mmap [Elf64_Phdr]> {
        self.phdrs
            .get_or_try_init(|| {
                let ehdr = self.ensure_ehdr()?;
                self.elf_data
                    .get(ehdr.ehdr.e_phoff as usize..)
                    .ok_or_invalid_data(|| "Elf64_Ehdr::e_phoff is invalid")?
                    .read_pod_slice_ref::<Elf64_Phdr>(ehdr.phnum)
                    .ok_or_invalid_data(|| "failed to read program headers")
            })
            .copied()
    }

    fn ensure_shstrtab(&self) -> Result<&'mmap [u8]> {
        self.shstrtab
            .get_or_try_init(|| {
                let ehdr = self.ensure_ehdr()?;
                // "If the index of the section name string table
                // section is larger than or equal to SHN_LORESERVE,
                // this member holds SHN_XINDEX and the real index is
                // held in the sh_link member of the initial section
                // header."
                let shstrndx = if ehdr.ehdr.e_shstrndx == SHN_XINDEX {
                    self.read_first_shdr(ehdr.ehdr)?.sh_link as usize
                } else {
                    usize::from(ehdr.ehdr.e_shstrndx)
                };
                self.section_data(shstrndx)
            })
            .copied()
    }

    /// Retrieve the raw section data for the ELF section at index
    /// `idx`.
    fn section_data(&self, idx: usize) -> Result<&'mmap [u8]> {
        let shdrs = self.ensure_shdrs()?;
        let shdr = shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))?;

        self.elf_data
            .get(shdr.sh_offset as usize..)
            .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
            .read_slice(shdr.sh_size as usize)
            .ok_or_invalid_data(|| "failed to read section data: invalid size")
    }

    /// Get the name of the section at a given index.
    fn section_name(&self, idx: usize) -> Result<&'mmap str> {
        let shdrs = self.ensure_shdrs()?;
        let shstrtab = self.ensure_shstrtab()?;

        let shdr = shdrs
            .get(idx)
            .ok_or_invalid_input(|| "ELF section index out of bounds")?;
        shstrtab
            .get(shdr.sh_name as usize..)
            .ok_or_invalid_input(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_input(|| "no valid string found in string table")?
            .to_str()
            .map_err(|_err| Error::with_invalid_data("invalid section name"))
    }

    /// Find the section of a given name, returning its index.
    fn find_section(&self, name: &str) -> Result<Option<usize>> {
        let ehdr = self.ensure_ehdr()?;
        for idx in 1..ehdr.shnum {
            if self.section_name(idx)? == name {
                return Ok(Some(idx))
            }
        }
        Ok(None)
    }
}

impl Debug for Cache<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Cache")
    }
}


/// A parser for ELF64 object files.
///
/// Parsing is lazy: each part of the file is decoded on first use and
/// the result cached. The object is safe for concurrent use.
#[derive(Debug)]
pub(crate) struct ElfParser {
    /// A cache for relevant parts of the ELF file.
    // SAFETY: We must not hand out references with a 'static lifetime
    //         to this member. Rather, they should never outlive `self`.
    //         Furthermore, this member has to be listed before `_mmap`
    //         to make sure we never end up with a dangling reference.
    cache: Cache<'static>,
    /// The memory mapped file.
    _mmap: Mmap,
}

impl ElfParser {
    /// Create an `ElfParser` from mmap'ed data.
    pub fn from_mmap(mmap: Mmap) -> Self {
        // We transmute the mmap's lifetime to static here as that is a
        // necessity for self-referentiality.
        // SAFETY: We never hand out any 'static references to cache
        //         data.
        let elf_data = unsafe { mem::transmute::<&[u8], &'static [u8]>(&mmap) };

        Self {
            cache: Cache::new(elf_data),
            _mmap: mmap,
        }
    }

    /// Create an `ElfParser` from an open file.
    pub fn open_file(file: &File) -> Result<Self> {
        Mmap::map(file)
            .map(Self::from_mmap)
            .context("failed to memory map file")
    }

    /// Create an `ElfParser` for a path.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::open_file(&file)
    }

    /// The object file type, one of the `ET_*` constants.
    pub fn e_type(&self) -> Result<u16> {
        let ehdr = self.cache.ensure_ehdr()?;
        Ok(ehdr.ehdr.e_type)
    }

    /// Find the section of a given name, returning its index.
    pub fn find_section(&self, name: &str) -> Result<Option<usize>> {
        self.cache.find_section(name)
    }

    /// Retrieve the data of the ELF section at index `idx`.
    pub fn section_data(&self, idx: usize) -> Result<&[u8]> {
        self.cache.section_data(idx)
    }

    /// Retrieve the data of the section with the given name, if
    /// present.
    pub fn section_data_by_name(&self, name: &str) -> Result<Option<&[u8]>> {
        match self.find_section(name)? {
            Some(idx) => self.section_data(idx).map(Some),
            None => Ok(None),
        }
    }

    pub fn section_headers(&self) -> Result<&[Elf64_Shdr]> {
        self.cache.ensure_shdrs()
    }

    pub fn program_headers(&self) -> Result<&[Elf64_Phdr]> {
        self.cache.ensure_phdrs()
    }

    fn symbols_in(&self, sym_section: &str, str_section: &str) -> Result<Vec<(Addr, &str)>> {
        let idx = match self.find_section(sym_section)? {
            Some(idx) => idx,
            // A missing symbol table section is not an error; there
            // just are no symbols to report.
            None => return Ok(Vec::new()),
        };
        let mut data = self.section_data(idx)?;
        if data.len() % size_of::<Elf64_Sym>() != 0 {
            return Err(Error::with_invalid_data(format!(
                "size of {sym_section} section is invalid"
            )))
        }
        let count = data.len() / size_of::<Elf64_Sym>();
        let syms = data
            .read_pod_slice_ref::<Elf64_Sym>(count)
            .ok_or_invalid_data(|| format!("failed to read {sym_section} contents"))?;

        let strs = match self.find_section(str_section)? {
            Some(idx) => self.section_data(idx)?,
            None => &[],
        };

        let mut result = Vec::new();
        for sym in syms {
            if !sym.is_function() || sym.st_shndx == SHN_UNDEF {
                continue
            }
            let name = strs
                .get(sym.st_name as usize..)
                .ok_or_invalid_data(|| "string table index out of bounds")?
                .read_cstr()
                .ok_or_invalid_data(|| "no valid string found in string table")?
                .to_str()
                .map_err(|_err| Error::with_invalid_data("invalid symbol name"))?;
            if name.is_empty() {
                continue
            }
            let () = result.push((sym.st_value, name));
        }
        Ok(result)
    }

    /// Gather the function symbols of the file, in scan order: dynamic
    /// symbols first, regular symbol table last.
    ///
    /// The returned list is unsorted and may contain entries with equal
    /// addresses; it is the caller's job to establish ordering and a
    /// collision policy.
    pub fn function_symbols(&self) -> Result<Vec<(Addr, &str)>> {
        let mut syms = self.symbols_in(".dynsym", ".dynstr")?;
        let mut symtab = self.symbols_in(".symtab", ".strtab")?;
        let () = syms.append(&mut symtab);
        Ok(syms)
    }
}
