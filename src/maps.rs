use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::Component;
use std::path::PathBuf;

use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Pid;
use crate::Result;


/// Permission bits of a mapping, as parsed from the `rwxp` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Perm(u8);

impl Perm {
    const R: u8 = 0b1000;
    const X: u8 = 0b0010;

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.0 & Self::R != 0
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.0 & Self::X != 0
    }
}


/// One row of a process' address space, as reported by the kernel.
#[derive(Clone, Debug)]
pub(crate) struct MapsEntry {
    /// The virtual address range covered by this entry.
    pub range: Range<Addr>,
    pub perm: Perm,
    /// Offset into the backing file at which the mapping starts.
    pub offset: u64,
    /// Device (major, minor) of the backing file.
    pub dev: (u32, u32),
    /// Inode of the backing file; `0` for anonymous mappings.
    pub inode: u64,
    /// The backing path; empty for anonymous mappings and pseudo-paths
    /// such as `[heap]`.
    pub path: PathBuf,
}


/// Parse a line of a proc maps file.
///
/// Lines have the following format:
/// ```text
/// address           perms offset  dev   inode      pathname
/// 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
/// 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
/// a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
/// ```
fn parse_maps_line<'line>(line: &'line str, pid: Pid) -> Result<MapsEntry> {
    let full_line = line;

    let split_once = |line: &'line str, component: &str| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .map(|(token, rest)| (token, rest.trim_start()))
            .ok_or_else(|| {
                Error::with_invalid_data(format!(
                    "failed to find {component} in proc maps line: {full_line}"
                ))
            })
    };

    let (range_str, line) = split_once(line, "address range")?;
    let (start_str, end_str) = range_str.split_once('-').ok_or_else(|| {
        Error::with_invalid_data(format!(
            "malformed address range in proc maps line: {full_line}"
        ))
    })?;
    let start = Addr::from_str_radix(start_str, 16)
        .map_err(|_err| Error::with_invalid_data("malformed start address"))
        .with_context(|| format!("failed to parse proc maps line: {full_line}"))?;
    let end = Addr::from_str_radix(end_str, 16)
        .map_err(|_err| Error::with_invalid_data("malformed end address"))
        .with_context(|| format!("failed to parse proc maps line: {full_line}"))?;

    let (perm_str, line) = split_once(line, "permissions component")?;
    let perm = Perm(perm_str
        .chars()
        .fold(0, |perm, c| (perm << 1) | u8::from(c != '-')));

    let (offset_str, line) = split_once(line, "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16)
        .map_err(|_err| Error::with_invalid_data("malformed offset component"))
        .with_context(|| format!("failed to parse proc maps line: {full_line}"))?;

    let (dev_str, line) = split_once(line, "device component")?;
    let dev = dev_str
        .split_once(':')
        .and_then(|(major, minor)| {
            let major = u32::from_str_radix(major, 16).ok()?;
            let minor = u32::from_str_radix(minor, 16).ok()?;
            Some((major, minor))
        })
        .ok_or_invalid_data(|| format!("malformed device component in proc maps line: {full_line}"))?;

    // A path may not be present, in which case splitting fails and the
    // whole remainder is the inode.
    let (inode_str, path_str) = match split_once(line, "inode component") {
        Ok((inode, path)) => (inode, path.trim()),
        Err(_err) => (line.trim(), ""),
    };
    let inode = inode_str
        .parse::<u64>()
        .map_err(|_err| Error::with_invalid_data("malformed inode component"))
        .with_context(|| format!("failed to parse proc maps line: {full_line}"))?;

    // The backing file of a deleted mapping is still reachable through
    // the corresponding `map_files` entry.
    let path = if path_str.ends_with(" (deleted)") {
        PathBuf::from(format!("/proc/{pid}/map_files/{range_str}"))
    } else {
        PathBuf::from(path_str)
    };

    let entry = MapsEntry {
        range: start..end,
        perm,
        offset,
        dev,
        inode,
        path,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
    pid: Pid,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(err.into())),
                Ok(0) => break None,
                Ok(_) => {
                    let line = self.line.trim();
                    // There shouldn't be any empty lines, but skip them
                    // just in case.
                    if !line.is_empty() {
                        break Some(parse_maps_line(line, self.pid))
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
fn parse_file<R>(reader: R, pid: Pid) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
        pid,
    }
}

/// Parse the maps file for the process with the given PID.
pub(crate) fn parse(pid: Pid) -> Result<impl Iterator<Item = Result<MapsEntry>>> {
    let path = format!("/proc/{pid}/maps");
    let file =
        File::open(&path).with_context(|| format!("failed to open {path}"))?;
    Ok(parse_file(file, pid))
}

/// Check whether a `MapsEntry` can contribute symbols: it has to be
/// file backed as well as readable and executable.
pub(crate) fn is_symbolizable(entry: &MapsEntry) -> bool {
    entry.perm.is_readable()
        && entry.perm.is_executable()
        && entry.path.components().next() == Some(Component::RootDir)
}
