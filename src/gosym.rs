//! Symbol source for self-describing Go binaries.
//!
//! Go binaries carry their own program counter line table (the
//! "pclntab"), covering every function of the program itself even when
//! the binary is otherwise stripped. For the main executable of a Go
//! process this table is both more complete and more reliable than the
//! generic ELF symbol sections, so it is preferred when present.
//!
//! The table starts with a small header whose magic number encodes the
//! layout revision, followed by (among other data irrelevant here) a
//! function table of `(entry, funcoff)` records sorted by entry
//! address, with one trailing entry marking the end of the text
//! segment. Each `funcoff` points at a per-function record whose
//! second field is an offset into the function name blob.

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::elf::ElfParser;
use crate::symtab::Loads;
use crate::symtab::ResolvedSym;
use crate::util::find_match_or_lower_bound_by_key;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::IntoError as _;
use crate::Result;


/// The section names under which the line table may be stored. Position
/// independent executables place it in the relocated read-only data
/// section.
const PCLNTAB_SECTIONS: [&str; 2] = [".gopclntab", ".data.rel.ro.gopclntab"];

const MAGIC_V12: u32 = 0xffff_fffb;
const MAGIC_V116: u32 = 0xffff_fffa;
const MAGIC_V118: u32 = 0xffff_fff0;
const MAGIC_V120: u32 = 0xffff_fff1;


struct FuncEntry {
    entry: Addr,
    name: Box<str>,
}

impl Debug for FuncEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:#x}: {}", self.entry, self.name)
    }
}


fn read_word(data: &[u8], idx: usize) -> Result<u64> {
    data.get(8 + idx * 8..)
        .and_then(|mut data| data.read_u64())
        .ok_or_invalid_data(|| "pclntab header is truncated")
}

fn read_u32_at(data: &[u8], off: u64) -> Result<u32> {
    data.get(off as usize..)
        .and_then(|mut data| data.read_u32())
        .ok_or_invalid_data(|| "pclntab data is truncated")
}

fn read_u64_at(data: &[u8], off: u64) -> Result<u64> {
    data.get(off as usize..)
        .and_then(|mut data| data.read_u64())
        .ok_or_invalid_data(|| "pclntab data is truncated")
}

fn read_name(data: &[u8], nametab: u64, off: u32) -> Result<Box<str>> {
    let name = data
        .get((nametab + u64::from(off)) as usize..)
        .and_then(|mut data| data.read_cstr())
        .ok_or_invalid_data(|| "pclntab function name is truncated")?
        .to_str()
        .map_err(|_err| Error::with_invalid_data("pclntab function name is not valid UTF-8"))?;
    Ok(Box::from(name))
}


fn parse_pclntab(data: &[u8]) -> Result<(Vec<FuncEntry>, Addr)> {
    let magic = data
        .get(0..)
        .and_then(|mut data| data.read_u32())
        .ok_or_invalid_data(|| "pclntab header is truncated")?;
    let ptr_size = *data
        .get(7)
        .ok_or_invalid_data(|| "pclntab header is truncated")?;
    if ptr_size != 8 {
        return Err(Error::with_unsupported(format!(
            "pclntab pointer size {ptr_size} is not supported"
        )))
    }

    // Header word layout per revision; only the fields needed for
    // address-to-name mapping are read.
    let (nfunc, nametab, functab) = match magic {
        MAGIC_V12 => {
            let nfunc = read_word(data, 0)?;
            // Function offsets and name offsets are relative to the
            // table start; the function table follows the count.
            (nfunc, 0, 16)
        }
        MAGIC_V116 => {
            let nfunc = read_word(data, 0)?;
            let nametab = read_word(data, 2)?;
            let functab = read_word(data, 6)?;
            (nfunc, nametab, functab)
        }
        MAGIC_V118 | MAGIC_V120 => {
            let nfunc = read_word(data, 0)?;
            let nametab = read_word(data, 3)?;
            let functab = read_word(data, 7)?;
            (nfunc, nametab, functab)
        }
        _ => {
            return Err(Error::with_invalid_data(format!(
                "unrecognized pclntab magic: {magic:#x}"
            )))
        }
    };

    let nfunc = usize::try_from(nfunc)
        .ok()
        .filter(|nfunc| nfunc.checked_mul(16).map(|size| size <= data.len()) == Some(true))
        .ok_or_invalid_data(|| "pclntab function count is implausible")?;

    let mut funcs = Vec::with_capacity(nfunc);
    let end_pc;

    match magic {
        MAGIC_V118 | MAGIC_V120 => {
            // Entries are 32 bit offsets relative to the start of the
            // text segment, recorded in the header.
            let text_start = read_word(data, 2)?;
            for idx in 0..nfunc as u64 {
                let entry_off = read_u32_at(data, functab + idx * 8)?;
                let func_off = read_u32_at(data, functab + idx * 8 + 4)?;
                let record = functab + u64::from(func_off);
                let name_off = read_u32_at(data, record + 4)?;
                let () = funcs.push(FuncEntry {
                    entry: text_start + u64::from(entry_off),
                    name: read_name(data, nametab, name_off)?,
                });
            }
            end_pc = text_start + u64::from(read_u32_at(data, functab + nfunc as u64 * 8)?);
        }
        _ => {
            // Entries are pointer sized absolute addresses. Function
            // records are relative to the function table (the table
            // start for the oldest revision, where `functab` is 16 and
            // offsets already include it).
            let record_base = match magic {
                MAGIC_V12 => 0,
                _ => functab,
            };
            for idx in 0..nfunc as u64 {
                let entry = read_u64_at(data, functab + idx * 16)?;
                let func_off = read_u64_at(data, functab + idx * 16 + 8)?;
                let record = record_base + func_off;
                let name_off = read_u32_at(data, record + 8)?;
                let () = funcs.push(FuncEntry {
                    entry,
                    name: read_name(data, nametab, name_off)?,
                });
            }
            end_pc = read_u64_at(data, functab + nfunc as u64 * 16)?;
        }
    }

    let () = funcs.sort_by_key(|func| func.entry);
    Ok((funcs, end_pc))
}


/// The symbol table embedded in a Go binary.
///
/// Like [`SymTab`][crate::symtab::SymTab], the table is immutable once
/// built and safe for unsynchronized concurrent reads. Unlike the
/// generic table, its end is known exactly: addresses at or past the
/// recorded end of the text segment do not resolve.
pub(crate) struct GoSymTab {
    /// Function entries, sorted by entry address.
    funcs: Box<[FuncEntry]>,
    /// The end of the program's text segment.
    end_pc: Addr,
    /// The binary's loadable segments, for file offset translation.
    loads: Loads,
}

impl GoSymTab {
    /// Load the embedded line table of the given binary, if it has one.
    ///
    /// A binary without the table yields `Ok(None)`; a table that is
    /// present but cannot be parsed is an error.
    pub(crate) fn load(parser: &ElfParser) -> Result<Option<Self>> {
        let mut data = None;
        for section in PCLNTAB_SECTIONS {
            if let Some(bytes) = parser.section_data_by_name(section)? {
                data = Some(bytes);
                break
            }
        }
        let data = match data {
            Some(data) => data,
            None => return Ok(None),
        };

        let (funcs, end_pc) = parse_pclntab(data)?;
        let loads = Loads::from_parser(parser)?;
        Ok(Some(Self {
            funcs: funcs.into_boxed_slice(),
            end_pc,
            loads,
        }))
    }

    /// The number of functions in the table.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.funcs.len()
    }

    /// Resolve an ELF virtual address to a function.
    pub(crate) fn resolve(&self, addr: Addr) -> Option<ResolvedSym<'_>> {
        if addr >= self.end_pc {
            return None
        }
        let idx = find_match_or_lower_bound_by_key(&self.funcs, addr, |func| func.entry)?;
        let func = &self.funcs[idx];
        Some(ResolvedSym {
            name: &func.name,
            addr: func.entry,
            offset: addr - func.entry,
        })
    }

    /// Resolve a file offset within the backing binary to a function.
    pub(crate) fn resolve_file_offset(&self, offset: u64) -> Option<ResolvedSym<'_>> {
        let addr = self.loads.vaddr_for_offset(offset)?;
        self.resolve(addr)
    }
}

impl Debug for GoSymTab {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "GoSymTab ({} functions)", self.funcs.len())
    }
}
