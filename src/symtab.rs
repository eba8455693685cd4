use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::elf::types::PT_LOAD;
use crate::elf::ElfParser;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::Result;


/// A symbol resolved from a table, borrowing the table's data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ResolvedSym<'tab> {
    /// The name of the symbol.
    pub name: &'tab str,
    /// The start address of the symbol.
    pub addr: Addr,
    /// Offset of the looked up address into the symbol.
    pub offset: u64,
}


/// One entry of a symbol table: a start address and a name. The end of
/// the covered range is implied by the next entry's start.
struct SymEntry {
    addr: Addr,
    name: Box<str>,
}

impl Debug for SymEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:#x}: {}", self.addr, self.name)
    }
}


/// A `PT_LOAD` triple captured at build time, so that file offsets can
/// be translated to ELF virtual addresses after the file is closed.
#[derive(Clone, Copy, Debug)]
struct LoadSegment {
    offset: u64,
    vaddr: Addr,
    file_size: u64,
}


/// The loadable segments of a binary, captured at table build time.
#[derive(Debug, Default)]
pub(crate) struct Loads(Box<[LoadSegment]>);

impl Loads {
    /// Capture the `PT_LOAD` segments of the provided binary.
    pub(crate) fn from_parser(parser: &ElfParser) -> Result<Self> {
        let loads = parser
            .program_headers()?
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| LoadSegment {
                offset: phdr.p_offset,
                vaddr: phdr.p_vaddr,
                file_size: phdr.p_filesz,
            })
            .collect::<Vec<_>>();
        Ok(Self(loads.into_boxed_slice()))
    }

    /// Translate a file offset to an ELF virtual address.
    pub(crate) fn vaddr_for_offset(&self, offset: u64) -> Option<Addr> {
        let load = self
            .0
            .iter()
            .find(|load| (load.offset..load.offset + load.file_size).contains(&offset))?;
        Some(offset - load.offset + load.vaddr)
    }
}


/// An immutable symbol table of one binary.
///
/// Entries are sorted by start address and non-overlapping; the table
/// is built once and read-only thereafter, making unsynchronized
/// concurrent reads safe. Symbol sizes reported by the binary are
/// deliberately ignored: an address belongs to the closest preceding
/// entry, which tolerates tables with inaccurate or missing size
/// information.
pub(crate) struct SymTab {
    /// Symbol entries, sorted by address.
    entries: Box<[SymEntry]>,
    /// The binary's loadable segments, for file offset translation.
    loads: Loads,
    /// The build ID of the binary the table was built from, if any.
    build_id: Option<Box<[u8]>>,
}

impl SymTab {
    /// Build a symbol table from a parsed binary.
    ///
    /// `debug` optionally provides a separate debug info file whose
    /// symbols take precedence over those of `parser`: with equal start
    /// addresses the entry scanned *last* wins, and the debug file is
    /// scanned last.
    pub(crate) fn build(
        parser: &ElfParser,
        debug: Option<&ElfParser>,
        build_id: Option<Vec<u8>>,
    ) -> Result<Self> {
        let mut syms = parser.function_symbols()?;
        if let Some(debug) = debug {
            let () = syms.extend(debug.function_symbols()?);
        }

        let loads = Loads::from_parser(parser)?;

        Ok(Self::from_symbols(syms, loads, build_id))
    }

    fn from_symbols(
        mut syms: Vec<(Addr, &str)>,
        loads: Loads,
        build_id: Option<Vec<u8>>,
    ) -> Self {
        // Sort stably so that for entries sharing a start address the
        // scan order is preserved, then collapse such duplicates
        // keeping the last occurrence.
        let () = syms.sort_by_key(|(addr, _name)| *addr);

        let mut entries = Vec::<SymEntry>::with_capacity(syms.len());
        for (addr, name) in syms {
            if let Some(last) = entries.last_mut() {
                if last.addr == addr {
                    last.name = Box::from(name);
                    continue
                }
            }
            let () = entries.push(SymEntry {
                addr,
                name: Box::from(name),
            });
        }

        Self {
            entries: entries.into_boxed_slice(),
            loads,
            build_id: build_id.map(Vec::into_boxed_slice),
        }
    }

    /// The build ID of the binary this table was built from, if it had
    /// one.
    #[inline]
    pub(crate) fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    /// The number of symbols in the table.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolve an ELF virtual address to a symbol.
    pub(crate) fn resolve(&self, addr: Addr) -> Option<ResolvedSym<'_>> {
        let idx = find_match_or_lower_bound_by_key(&self.entries, addr, |entry| entry.addr)?;
        let entry = &self.entries[idx];
        Some(ResolvedSym {
            name: &entry.name,
            addr: entry.addr,
            offset: addr - entry.addr,
        })
    }

    /// Resolve a file offset within the backing binary to a symbol.
    pub(crate) fn resolve_file_offset(&self, offset: u64) -> Option<ResolvedSym<'_>> {
        let addr = self.loads.vaddr_for_offset(offset)?;
        self.resolve(addr)
    }
}

impl Debug for SymTab {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "SymTab ({} symbols)", self.entries.len())
    }
}
