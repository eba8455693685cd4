use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap as Mapping;
use memmap2::MmapOptions;

use crate::ErrorExt as _;
use crate::Result;


/// A read-only view of a memory mapped file.
///
/// The object can be cheaply cloned; clones share the underlying
/// mapping.
#[derive(Clone, Debug)]
pub(crate) struct Mmap {
    /// The actual memory mapping. `None` if the file was empty, which
    /// the kernel refuses to map.
    mapping: Option<Arc<Mapping>>,
}

impl Mmap {
    /// Memory map the file at the provided `path`.
    pub(crate) fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open file {}", path.display()))?;
        Self::map(&file)
    }

    /// Map the provided file into memory, in its entirety.
    pub(crate) fn map(file: &File) -> Result<Self> {
        let len = file.metadata().context("failed to stat file")?.len();

        // The kernel does not allow mmap'ing a region of size 0. We
        // want to handle this case transparently, though.
        let mapping = if len == 0 {
            None
        } else {
            let opts = MmapOptions::new();
            // SAFETY: The file is mapped read-only; mutation of the
            //         underlying file by others results in stale data,
            //         not undefined behavior on our reads of the copy.
            let mapping = unsafe { opts.map(file) }.context("failed to mmap file")?;
            Some(Arc::new(mapping))
        };
        Ok(Self { mapping })
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.mapping {
            Some(mapping) => mapping.deref(),
            None => &[],
        }
    }
}
