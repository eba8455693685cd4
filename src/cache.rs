use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use lru::LruCache;
use once_cell::sync::OnceCell;
use tracing::debug;
use tracing::warn;

use crate::buildid::debug_file_path;
use crate::buildid::read_build_id;
use crate::elf::ElfParser;
use crate::symtab::SymTab;
use crate::util::fstat;
use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// The default capacity of each of the cache's two maps.
const DFL_CAPACITY: usize = 512;
/// Where distribution provided debug info files live.
const DFL_DEBUG_DIR: &str = "/usr/lib/debug";


/// The storage identity of a binary: stable across renames of the same
/// inode, distinct across distinct files even when reachable via the
/// same path. Cheap to obtain, as it requires no read of file contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct FileId {
    dev: libc::dev_t,
    inode: libc::ino_t,
    size: libc::off_t,
    mtime_sec: libc::time_t,
    mtime_nsec: i64,
}

impl FileId {
    fn new(stat: &libc::stat) -> Self {
        Self {
            dev: stat.st_dev,
            inode: stat.st_ino,
            size: stat.st_size,
            mtime_sec: stat.st_mtime,
            mtime_nsec: stat.st_mtime_nsec,
        }
    }
}


/// A single-flight slot for one file identity: the winner of the
/// initialization race builds the table while everybody else blocks on
/// the cell, observing the one resulting table.
type TableCell = Arc<OnceCell<Arc<SymTab>>>;


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


/// A builder for configurable construction of [`SymCache`] objects.
#[derive(Clone, Debug)]
pub struct Builder {
    capacity: usize,
    debug_files: bool,
    debug_dir: PathBuf,
}

impl Builder {
    /// Set the maximum number of entries kept in each of the cache's
    /// maps. Insertions past the capacity evict the least recently used
    /// entry.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enable or disable consultation of separately stored debug info
    /// files, located via a binary's build ID.
    pub fn debug_files(mut self, enabled: bool) -> Self {
        self.debug_files = enabled;
        self
    }

    /// Set the directory below which debug info files are looked up.
    pub fn debug_dir<P>(mut self, dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.debug_dir = dir.into();
        self
    }

    /// Create the [`SymCache`] object.
    pub fn build(self) -> Result<SymCache> {
        let Self {
            capacity,
            debug_files,
            debug_dir,
        } = self;
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::with_invalid_input("cache capacity must not be zero"))?;

        Ok(SymCache {
            stat2tab: Mutex::new(LruCache::new(capacity)),
            buildid2tab: Mutex::new(LruCache::new(capacity)),
            debug_files,
            debug_dir,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            capacity: DFL_CAPACITY,
            debug_files: false,
            debug_dir: PathBuf::from(DFL_DEBUG_DIR),
        }
    }
}


/// A process wide cache of symbol tables, keyed by binary identity.
///
/// The cache deduplicates table construction across processes mapping
/// the same binaries and over time. It maintains two independently
/// bounded maps: one keyed by storage identity ([`FileId`]) and one by
/// the binary's embedded build ID, the latter catching renamed or
/// relocated copies of identical content. Tables are immutable, so an
/// evicted table remains valid for whoever still holds a reference to
/// it.
///
/// All methods take `&self`; the cache is meant to be shared across the
/// process views of many profiled processes simultaneously.
pub struct SymCache {
    /// Tables keyed by file identity.
    stat2tab: Mutex<LruCache<FileId, TableCell>>,
    /// Tables keyed by build ID.
    buildid2tab: Mutex<LruCache<Box<[u8]>, Arc<SymTab>>>,
    debug_files: bool,
    debug_dir: PathBuf,
}

impl SymCache {
    /// Retrieve a [`Builder`] object for configurable construction.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Retrieve the symbol table for the binary at the given path,
    /// building and caching it if necessary.
    ///
    /// Exactly one build occurs per file identity, no matter how many
    /// threads request it concurrently; losers of the race block and
    /// observe the winner's table.
    pub(crate) fn get_or_build(&self, path: &Path) -> Result<Arc<SymTab>> {
        let file = File::open(path)
            .with_context(|| format!("failed to open binary {}", path.display()))?;
        // Stat through the already opened file so that the identity
        // cannot diverge from the contents we would parse.
        let stat = fstat(file.as_raw_fd())?;
        let id = FileId::new(&stat);

        let cell = {
            let mut stat2tab = lock(&self.stat2tab);
            match stat2tab.get(&id) {
                Some(cell) => Arc::clone(cell),
                None => {
                    let cell = TableCell::default();
                    let _evicted = stat2tab.push(id, Arc::clone(&cell));
                    cell
                }
            }
        };

        let tab = cell.get_or_try_init(|| self.build_table(&file, path))?;
        Ok(Arc::clone(tab))
    }

    /// Build the table for an opened binary, consulting the build ID
    /// map and, if so configured, a separately stored debug info file.
    fn build_table(&self, file: &File, path: &Path) -> Result<Arc<SymTab>> {
        let parser = ElfParser::open_file(file)
            .with_context(|| format!("failed to parse binary {}", path.display()))?;
        let build_id = read_build_id(&parser).unwrap_or_else(|err| {
            warn!("failed to read build ID of {}: {err}", path.display());
            None
        });

        // Identical content reachable through a different inode may
        // already have been parsed.
        if let Some(id) = build_id.as_deref() {
            let mut buildid2tab = lock(&self.buildid2tab);
            if let Some(tab) = buildid2tab.get(id) {
                return Ok(Arc::clone(tab))
            }
        }

        let debug_parser = if self.debug_files {
            self.open_debug_file(build_id.as_deref(), path)
        } else {
            None
        };

        let tab = SymTab::build(&parser, debug_parser.as_ref(), build_id)?;
        debug!(
            "built symbol table for {} ({} symbols)",
            path.display(),
            tab.len()
        );
        let mut tab = Arc::new(tab);

        if let Some(id) = tab.build_id().map(Box::<[u8]>::from) {
            let mut buildid2tab = lock(&self.buildid2tab);
            match buildid2tab.get(&id) {
                // A concurrent build of another copy won the race; all
                // callers converge on the earlier table.
                Some(existing) => tab = Arc::clone(existing),
                None => {
                    let _evicted = buildid2tab.push(id, Arc::clone(&tab));
                }
            }
        }
        Ok(tab)
    }

    fn open_debug_file(&self, build_id: Option<&[u8]>, path: &Path) -> Option<ElfParser> {
        let debug_path = debug_file_path(&self.debug_dir, build_id?)?;
        match ElfParser::open(&debug_path) {
            Ok(parser) => {
                debug!(
                    "using debug file {} for {}",
                    debug_path.display(),
                    path.display()
                );
                Some(parser)
            }
            Err(err) => {
                debug!(
                    "no usable debug file for {} at {}: {err}",
                    path.display(),
                    debug_path.display()
                );
                None
            }
        }
    }

    /// Current occupancy of the file identity map.
    pub fn stat_entries(&self) -> usize {
        lock(&self.stat2tab).len()
    }

    /// Current occupancy of the build ID map.
    pub fn build_id_entries(&self) -> usize {
        lock(&self.buildid2tab).len()
    }
}

impl Debug for SymCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "SymCache (stat entries: {}, build ID entries: {})",
            self.stat_entries(),
            self.build_id_entries()
        )
    }
}
