//! A from-scratch USTAR/PAX/GNU-longname tar reader and entry writer.
//!
//! This intentionally does not reuse the `tar` crate (kept as a dev-dependency for test
//! fixtures only): the puller needs the exact PAX-override and whiteout semantics spelled
//! out by the spec, which are narrower than a general-purpose tar implementation.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::error::Error;

const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Hardlink,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Other(char),
}

impl EntryType {
    fn from_flag(flag: char) -> Self {
        match flag {
            '0' | '\0' | '7' => EntryType::Regular,
            '1' => EntryType::Hardlink,
            '2' => EntryType::Symlink,
            '3' => EntryType::CharDevice,
            '4' => EntryType::BlockDevice,
            '5' => EntryType::Directory,
            other => EntryType::Other(other),
        }
    }
}

/// One archive entry, after PAX/GNU overrides have been applied.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: f64,
    pub atime: Option<f64>,
    pub ctime: Option<f64>,
    pub entry_type: EntryType,
    pub linkpath: String,
    pub major: u32,
    pub minor: u32,
    pub data: Vec<u8>,
}

impl TarEntry {
    /// Write this entry's contents into `target`, joining `self.path` onto it.
    ///
    /// Fails if the destination already exists and is not a directory (directories are
    /// idempotent: re-creating one on top of itself is fine).
    pub fn write(&self, target: &Path) -> Result<(), Error> {
        let dest = target.join(self.path.trim_start_matches('/'));
        if dest.symlink_metadata().is_ok() && !dest.is_dir() {
            return Err(Error::ProtocolUnsupported(format!(
                "{} already exists",
                self.path
            )));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.entry_type {
            EntryType::Regular => {
                let mut f = OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .mode(self.mode)
                    .open(&dest)?;
                f.write_all(&self.data)?;
                drop(f);
                filetime::set_file_times(
                    &dest,
                    filetime::FileTime::from_unix_time(self.atime.unwrap_or(self.mtime) as i64, 0),
                    filetime::FileTime::from_unix_time(self.mtime as i64, 0),
                )?;
                std::os::unix::fs::chown(&dest, Some(self.uid), Some(self.gid))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(self.mode))?;
            }
            EntryType::Hardlink => {
                let link_target = target.join(self.linkpath.trim_start_matches('/'));
                fs::hard_link(&link_target, &dest)?;
            }
            EntryType::Symlink => {
                symlink(&self.linkpath, &dest)?;
            }
            EntryType::CharDevice => {
                mknod(
                    &dest,
                    SFlag::S_IFCHR,
                    Mode::from_bits_truncate(self.mode),
                    makedev(self.major as u64, self.minor as u64),
                )?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(self.mode))?;
            }
            EntryType::BlockDevice => {
                mknod(
                    &dest,
                    SFlag::S_IFBLK,
                    Mode::from_bits_truncate(self.mode),
                    makedev(self.major as u64, self.minor as u64),
                )?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(self.mode))?;
            }
            EntryType::Directory => {
                if !dest.is_dir() {
                    fs::create_dir(&dest)?;
                }
                fs::set_permissions(&dest, fs::Permissions::from_mode(self.mode))?;
            }
            EntryType::Other(c) => {
                return Err(Error::ProtocolUnsupported(format!(
                    "unknown tar entry type '{c}'"
                )))
            }
        }
        Ok(())
    }

    /// Basename of `path`, the part whiteout detection looks at.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Default)]
struct PaxState {
    values: HashMap<String, String>,
}

impl PaxState {
    fn apply(&mut self, global: &HashMap<String, String>, entry: &mut TarEntry) -> Result<(), Error> {
        let mut merged = global.clone();
        merged.extend(self.values.drain());
        if merged.contains_key("size") {
            return Err(Error::ProtocolUnsupported(
                "pax header overrides unsupported 'size' field".into(),
            ));
        }
        for (key, value) in merged {
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "path" => entry.path = value,
                "linkpath" => entry.linkpath = value,
                "mtime" => entry.mtime = value.parse().unwrap_or(entry.mtime),
                "atime" => entry.atime = value.parse().ok(),
                "ctime" => entry.ctime = value.parse().ok(),
                "uid" => entry.uid = value.parse().unwrap_or(entry.uid),
                "gid" => entry.gid = value.parse().unwrap_or(entry.gid),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parses a PAX extended-header payload (`"<len> key=value\n"` records) into a map.
fn parse_pax(mut data: &[u8]) -> Result<HashMap<String, String>, Error> {
    let mut ret = HashMap::new();
    while !data.is_empty() {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::ConfigParse("malformed pax header".into()))?;
        let len: usize = std::str::from_utf8(&data[..space])?
            .parse()
            .map_err(|_| Error::ConfigParse("malformed pax header length".into()))?;
        if len == 0 || len > data.len() {
            return Err(Error::ConfigParse("malformed pax header length".into()));
        }
        let record = &data[..len];
        data = &data[len..];
        let rest = &record[space + 1..record.len() - 1]; // drop trailing '\n'
        let eq = rest
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::ConfigParse("malformed pax record".into()))?;
        let key = String::from_utf8_lossy(&rest[..eq]).into_owned();
        let value = String::from_utf8_lossy(&rest[eq + 1..]).into_owned();
        ret.insert(key, value);
    }
    Ok(ret)
}

fn decode_str(bytes: &[u8]) -> Result<String, Error> {
    let s = std::str::from_utf8(bytes).map_err(|_| Error::ProtocolUnsupported("non-utf8 tar field".into()))?;
    Ok(s.split('\0').next().unwrap_or("").to_string())
}

fn parse_octal(bytes: &[u8]) -> Result<u64, Error> {
    let s = decode_str(bytes)?;
    let trimmed = s.trim().trim_matches('\0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 8).map_err(|_| Error::ProtocolUnsupported(format!("bad octal field {trimmed:?}")))
}

/// Lazily reads archive entries out of a byte stream, a block at a time.
pub struct TarReader<R> {
    inner: R,
    pax_global: HashMap<String, String>,
    pax_local: PaxState,
}

impl<R: Read> TarReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pax_global: HashMap::new(),
            pax_local: PaxState::default(),
        }
    }

    fn read_block(&mut self) -> Result<Option<[u8; BLOCK_SIZE]>, Error> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut read = 0;
        while read < BLOCK_SIZE {
            let n = self.inner.read(&mut block[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(Error::ProtocolUnsupported("truncated tar block".into()));
            }
            read += n;
        }
        Ok(Some(block))
    }

    fn read_padded(&mut self, size: u64) -> Result<Vec<u8>, Error> {
        let padded = (size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
        let mut buf = vec![0u8; padded];
        self.inner.read_exact(&mut buf)?;
        buf.truncate(size as usize);
        Ok(buf)
    }

    fn next_entry(&mut self) -> Result<Option<TarEntry>, Error> {
        loop {
            let block = match self.read_block()? {
                Some(b) => b,
                None => return Ok(None),
            };
            if block.iter().all(|&b| b == 0) {
                continue;
            }

            let magic = &block[257..263];
            let version = &block[263..265];
            let is_ustar = (magic == b"ustar\0" && version == b"00")
                || (magic == b"ustar " && version == b" \0");
            if !is_ustar {
                return Err(Error::ProtocolUnsupported(format!(
                    "unsupported tar magic {:?}",
                    String::from_utf8_lossy(magic)
                )));
            }

            let name = decode_str(&block[0..100])?;
            let mode = parse_octal(&block[100..108])? as u32;
            let uid = parse_octal(&block[108..116])? as u32;
            let gid = parse_octal(&block[116..124])? as u32;
            let size = parse_octal(&block[124..136])?;
            let mtime = parse_octal(&block[136..148])? as f64;
            let typeflag = block[156] as char;
            let linkname = decode_str(&block[157..257])?;
            let major = parse_octal(&block[329..337])? as u32;
            let minor = parse_octal(&block[337..345])? as u32;
            let prefix = decode_str(&block[345..500])?;

            let full_path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            let data = self.read_padded(size)?;

            match typeflag {
                'x' => {
                    self.pax_local.values = parse_pax(&data)?;
                    continue;
                }
                'g' => {
                    self.pax_global = parse_pax(&data)?;
                    continue;
                }
                'L' => {
                    self.pax_local
                        .values
                        .insert("path".into(), decode_str(&data)?);
                    continue;
                }
                'K' => {
                    self.pax_local
                        .values
                        .insert("linkpath".into(), decode_str(&data)?);
                    continue;
                }
                _ => {
                    let mut entry = TarEntry {
                        path: full_path,
                        mode,
                        uid,
                        gid,
                        size,
                        mtime,
                        atime: None,
                        ctime: None,
                        entry_type: EntryType::from_flag(typeflag),
                        linkpath: linkname,
                        major,
                        minor,
                        data,
                    };
                    self.pax_local.apply(&self.pax_global, &mut entry)?;
                    return Ok(Some(entry));
                }
            }
        }
    }
}

impl<R: Read> Iterator for TarReader<R> {
    type Item = Result<TarEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
