use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::read_link;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use once_cell::sync::OnceCell;
use tracing::debug;
use tracing::warn;

use crate::cache::SymCache;
use crate::demangle::maybe_demangle;
use crate::elf::ElfParser;
use crate::gosym::GoSymTab;
use crate::maps;
use crate::symtab::ResolvedSym;
use crate::symtab::SymTab;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::Pid;
use crate::Result;


/// A symbol resolved in the context of a profiled process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sym {
    /// The name of the symbol, if one could be determined. `None` means
    /// that the owning module is known but the address could not be
    /// attributed to a function within it.
    pub name: Option<String>,
    /// The path of the module (binary or shared object) the address
    /// falls into.
    pub module: PathBuf,
    /// The address at which the symbol starts, in the process' address
    /// space. `0` if no symbol was found.
    pub addr: Addr,
    /// The byte offset of the resolved address from the start of the
    /// symbol.
    pub offset: u64,
}


/// The symbol source backing one mapping. Exactly two variants exist:
/// the embedded Go runtime table, used for the main executable when
/// present, and the generic ELF table served by the shared cache.
enum MapTable {
    Elf(Arc<SymTab>),
    Go(Arc<GoSymTab>),
}

impl MapTable {
    fn resolve_file_offset(&self, offset: u64) -> Option<ResolvedSym<'_>> {
        match self {
            Self::Elf(tab) => tab.resolve_file_offset(offset),
            Self::Go(tab) => tab.resolve_file_offset(offset),
        }
    }
}

impl Debug for MapTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Elf(tab) => Debug::fmt(tab, f),
            Self::Go(tab) => Debug::fmt(tab, f),
        }
    }
}


/// One executable, file backed mapping of the tracked process.
#[derive(Debug)]
struct Mapping {
    /// The virtual address range covered by the mapping.
    range: Range<Addr>,
    /// Offset into the backing file at which the mapping starts.
    offset: u64,
    /// The backing file.
    path: PathBuf,
    /// Whether this mapping belongs to the process' main executable.
    exe: bool,
    /// The lazily selected symbol source. `Some(None)` records a failed
    /// build: the mapping keeps resolving to "module known, symbol
    /// unknown" without retrying until the next refresh replaces it.
    table: OnceCell<Option<MapTable>>,
}


fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}


/// The symbolication view of one profiled process.
///
/// The view tracks the process' current memory mappings and resolves
/// process virtual addresses to symbols by locating the owning mapping
/// and delegating to that mapping's symbol source. Mappings are
/// refreshed explicitly, on whatever schedule the owner deems
/// appropriate, because the process' address space mutates over time.
///
/// `refresh` and `resolve` may be called concurrently from different
/// threads: resolution always operates on a consistent snapshot of the
/// mapping list, and refreshing swaps in the new list atomically.
#[derive(Debug)]
pub struct ProcessSymbols {
    pid: Pid,
    /// The table cache shared with the views of all other tracked
    /// processes.
    cache: Arc<SymCache>,
    /// The current mappings, sorted by start address. Replaced
    /// wholesale on refresh.
    maps: RwLock<Arc<[Mapping]>>,
}

impl ProcessSymbols {
    /// Create a view of the process identified by `pid`, sharing the
    /// provided table cache.
    ///
    /// The view starts out empty; call [`refresh`][Self::refresh] to
    /// load the process' mappings.
    pub fn new(pid: Pid, cache: Arc<SymCache>) -> Self {
        Self {
            pid,
            cache,
            maps: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Re-read the process' memory mappings, atomically replacing the
    /// previous set.
    ///
    /// Fails only if the mapping list cannot be read at all (typically
    /// because the process vanished). A process exiting mid-read is
    /// tolerated: the data read up to that point is kept and the next
    /// scheduled refresh self-heals.
    pub fn refresh(&self) -> Result<()> {
        let exe = read_link(format!("/proc/{}/exe", self.pid)).ok();

        let mut mappings = Vec::new();
        for entry in maps::parse(self.pid)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "truncated maps read for process {}: {err}; keeping partial data",
                        self.pid
                    );
                    break
                }
            };
            if !maps::is_symbolizable(&entry) {
                continue
            }
            let exe = exe.as_deref() == Some(entry.path.as_path());
            let () = mappings.push(Mapping {
                range: entry.range,
                offset: entry.offset,
                path: entry.path,
                exe,
                table: OnceCell::new(),
            });
        }
        // Resolution binary searches the list by start address; it has
        // to be sorted.
        let () = mappings.sort_by_key(|mapping| mapping.range.start);

        *write_lock(&self.maps) = Arc::from(mappings);
        Ok(())
    }

    /// The number of symbolizable mappings currently known.
    pub fn mapping_count(&self) -> usize {
        read_lock(&self.maps).len()
    }

    fn snapshot(&self) -> Arc<[Mapping]> {
        Arc::clone(&read_lock(&self.maps))
    }

    /// Select and build the symbol source for a mapping. Only called
    /// once per mapping, on the first resolution touching it.
    fn build_table(&self, mapping: &Mapping) -> Option<MapTable> {
        if mapping.exe {
            // The main executable may describe itself; that beats the
            // generic symbol sections, which may be stripped.
            match ElfParser::open(&mapping.path).and_then(|parser| GoSymTab::load(&parser)) {
                Ok(Some(tab)) => return Some(MapTable::Go(Arc::new(tab))),
                Ok(None) => (),
                Err(err) => {
                    debug!(
                        "failed to load runtime symbol table of {}: {err}",
                        mapping.path.display()
                    );
                }
            }
        }

        match self.cache.get_or_build(&mapping.path) {
            Ok(tab) => Some(MapTable::Elf(tab)),
            Err(err) => {
                warn!(
                    "failed to build symbol table for {}: {err}",
                    mapping.path.display()
                );
                None
            }
        }
    }

    /// Resolve a virtual address of the tracked process to a symbol.
    ///
    /// Returns `None` if the address does not fall into any known
    /// mapping. An address inside a known mapping always produces a
    /// [`Sym`], with the name left empty if the mapping's binary could
    /// not contribute one; no per-sample failure ever surfaces as an
    /// error.
    pub fn resolve(&self, addr: Addr) -> Option<Sym> {
        let maps = self.snapshot();
        let idx = find_match_or_lower_bound_by_key(&maps, addr, |mapping| mapping.range.start)?;
        let mapping = &maps[idx];
        if addr >= mapping.range.end {
            return None
        }

        let file_offset = addr - mapping.range.start + mapping.offset;
        let table = mapping.table.get_or_init(|| self.build_table(mapping));
        let resolved = table
            .as_ref()
            .and_then(|table| table.resolve_file_offset(file_offset));

        let sym = match resolved {
            Some(resolved) => Sym {
                name: Some(maybe_demangle(resolved.name).into_owned()),
                module: mapping.path.clone(),
                addr: addr - resolved.offset,
                offset: resolved.offset,
            },
            None => Sym {
                name: None,
                module: mapping.path.clone(),
                addr: 0,
                offset: 0,
            },
        };
        Some(sym)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;


    fn self_view() -> (Arc<SymCache>, ProcessSymbols) {
        let cache = Arc::new(SymCache::builder().capacity(64).build().unwrap());
        let view = ProcessSymbols::new(Pid::Slf, Arc::clone(&cache));
        (cache, view)
    }

    #[inline(never)]
    fn probe_function() -> u64 {
        4242
    }

    /// Check that we can resolve a function of the test binary itself.
    #[test]
    fn resolve_own_function() {
        let (_cache, view) = self_view();
        let () = view.refresh().unwrap();
        assert_ne!(view.mapping_count(), 0);

        let addr = probe_function as Addr;
        let sym = view.resolve(addr).unwrap();
        let name = sym.name.unwrap();
        assert!(name.contains("probe_function"), "{name}");
        assert_eq!(sym.addr, addr);
        assert_eq!(sym.offset, 0);
    }

    /// Resolving the same address twice yields identical results.
    #[test]
    fn deterministic_resolution() {
        let (_cache, view) = self_view();
        let () = view.refresh().unwrap();

        let addr = probe_function as Addr;
        assert_eq!(view.resolve(addr), view.resolve(addr));
    }

    /// An unmapped address resolves to nothing, without any error.
    #[test]
    fn unmapped_address() {
        let (_cache, view) = self_view();
        let () = view.refresh().unwrap();

        // The zero page is never mapped.
        assert_eq!(view.resolve(0x42), None);
    }

    /// A view that has never been refreshed resolves nothing.
    #[test]
    fn empty_view() {
        let (_cache, view) = self_view();
        assert_eq!(view.mapping_count(), 0);
        assert_eq!(view.resolve(probe_function as Addr), None);
    }

    /// Refreshing twice without an address space change keeps the
    /// mapping list and resolution results stable.
    #[test]
    fn refresh_idempotence() {
        let (_cache, view) = self_view();
        let () = view.refresh().unwrap();
        let count = view.mapping_count();
        let addr = probe_function as Addr;
        let before = view.resolve(addr);

        let () = view.refresh().unwrap();
        assert_eq!(view.mapping_count(), count);
        assert_eq!(view.resolve(addr), before);
    }

    /// A view of a process that does not exist fails to refresh with a
    /// proper error.
    #[test]
    fn vanished_process() {
        let cache = Arc::new(SymCache::builder().capacity(64).build().unwrap());
        // PID numbers beyond the kernel's pid_max cannot exist.
        let view = ProcessSymbols::new(Pid::from(0x7fff_fffe), cache);
        let err = view.refresh().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }
}
