use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::elf::types::Elf64_Nhdr;
use crate::elf::types::NT_GNU_BUILD_ID;
use crate::elf::types::SHT_NOTE;
use crate::elf::ElfParser;
use crate::util::Pod;
use crate::util::ReadRaw as _;
use crate::Result;


/// A build ID note as it appears in the ELF file: the note header is
/// followed by the owner name and the variable sized build ID itself.
#[repr(C)]
struct BuildIdNote {
    /// ELF note header.
    header: Elf64_Nhdr,
    /// NUL terminated string representing the name.
    name: [u8; 4],
}

// SAFETY: `BuildIdNote` is valid for any bit pattern.
unsafe impl Pod for BuildIdNote {}


fn parse_build_id_note(mut bytes: &[u8]) -> Option<Vec<u8>> {
    let note = bytes.read_pod_ref::<BuildIdNote>()?;
    if note.header.n_type != NT_GNU_BUILD_ID || &note.name != b"GNU\0" {
        return None
    }
    let id = bytes.read_slice(note.header.n_descsz as usize)?;
    Some(id.to_vec())
}

/// Attempt to read a binary's GNU build ID.
///
/// The well-known `.note.gnu.build-id` section is consulted first;
/// failing that, all note sections are scanned. A binary without the
/// note simply has no build ID; that is not an error.
pub(crate) fn read_build_id(parser: &ElfParser) -> Result<Option<Vec<u8>>> {
    if let Some(bytes) = parser.section_data_by_name(".note.gnu.build-id")? {
        if let Some(id) = parse_build_id_note(bytes) {
            return Ok(Some(id))
        }
        warn!("malformed .note.gnu.build-id section; scanning other notes");
    }

    let shdrs = parser.section_headers()?;
    for (idx, shdr) in shdrs.iter().enumerate() {
        if shdr.sh_type != SHT_NOTE {
            continue
        }
        // SANITY: The index stems from the enumeration above, so the
        //         section is always found.
        let bytes = parser.section_data(idx).unwrap();
        if let Some(id) = parse_build_id_note(bytes) {
            return Ok(Some(id))
        }
    }
    Ok(None)
}

/// Derive the well-known path of a separately stored debug info file
/// for the given build ID, below `debug_dir`.
///
/// The layout follows the established `.build-id/ab/cdef...debug`
/// convention, where `ab` is the hex encoding of the ID's first byte.
pub(crate) fn debug_file_path(debug_dir: &Path, build_id: &[u8]) -> Option<PathBuf> {
    let (first, rest) = build_id.split_first()?;
    if rest.is_empty() {
        return None
    }

    let mut name = rest.iter().fold(String::new(), |mut name, byte| {
        let () = name.push_str(&format!("{byte:02x}"));
        name
    });
    let () = name.push_str(".debug");

    Some(
        debug_dir
            .join(".build-id")
            .join(format!("{first:02x}"))
            .join(name),
    )
}
