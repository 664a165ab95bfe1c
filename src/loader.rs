//! Loading user programs in NOFF object format.
//!
//! A NOFF image is a fixed 40-byte header followed by the segment payloads:
//! the magic word, then one record per segment (`code`, `initData`,
//! `uninitData`), each `{size, virtualAddr, inFileAddr}`. Integers are
//! little-endian on disk; when the stored magic only matches after a byte
//! swap, the whole header is word-swapped to reconcile a foreign-endian
//! image with the host.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

/// Magic word identifying a NOFF image.
pub const NOFF_MAGIC: u32 = 0xbad_fad;
/// On-disk header size: the magic plus three 3-word segment records.
pub const NOFF_HEADER_SIZE: usize = 40;

/// Errors surfaced while opening or decoding an executable. Both are fatal
/// to the load; nothing here is retried.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("bad magic number in executable header")]
    BadMagic,
    #[error("unable to open executable {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error reading executable")]
    Io(#[from] io::Error),
}

/// One segment descriptor from the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub size: u32,
    pub virtual_addr: u32,
    pub in_file_addr: u32,
}

/// Decoded NOFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffHeader {
    pub magic: u32,
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Decode a header from its on-disk bytes, applying the endian fixup.
    ///
    /// The words are first taken in host order. A mismatched magic whose
    /// byte-swapped form matches means the image was produced on a machine
    /// of the opposite endianness, so every word is swapped. Neither
    /// matching is a fatal load error.
    pub fn parse(bytes: &[u8; NOFF_HEADER_SIZE]) -> Result<Self, LoadError> {
        let mut words = [0u32; NOFF_HEADER_SIZE / 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_ne_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        if words[0] != NOFF_MAGIC {
            if words[0].swap_bytes() != NOFF_MAGIC {
                return Err(LoadError::BadMagic);
            }
            for word in words.iter_mut() {
                *word = word.swap_bytes();
            }
        }
        let seg = |base: usize| Segment {
            size: words[base],
            virtual_addr: words[base + 1],
            in_file_addr: words[base + 2],
        };
        Ok(Self {
            magic: words[0],
            code: seg(1),
            init_data: seg(4),
            uninit_data: seg(7),
        })
    }

    /// Bytes of user memory the image needs, before the stack is added.
    pub fn user_memory_size(&self) -> usize {
        self.code.size as usize + self.init_data.size as usize + self.uninit_data.size as usize
    }
}

/// An opened executable: random-access reads plus the path it came from,
/// kept so a forked child can re-open the same image.
#[derive(Debug)]
pub struct Executable {
    path: PathBuf,
    file: File,
}

impl Executable {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| LoadError::Open {
            path: path.clone(),
            source,
        })?;
        debug!("opened executable {:?}", path);
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `dst.len()` bytes at `offset`, returning the count read.
    /// Reads past end of file come back short; a page that extends past the
    /// image is simply left zeroed by the caller.
    pub fn read_at(&mut self, dst: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < dst.len() {
            let n = self.file.read(&mut dst[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Read and decode the header at offset 0.
    pub fn read_header(&mut self) -> Result<NoffHeader, LoadError> {
        let mut bytes = [0u8; NOFF_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut bytes)?;
        NoffHeader::parse(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(words: [u32; 10], swap: bool) -> [u8; NOFF_HEADER_SIZE] {
        let mut bytes = [0u8; NOFF_HEADER_SIZE];
        for (i, w) in words.iter().enumerate() {
            let w = if swap { w.swap_bytes() } else { *w };
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
        }
        bytes
    }

    const WORDS: [u32; 10] = [NOFF_MAGIC, 100, 0, 64, 50, 128, 164, 30, 192, 0];

    #[test]
    fn parses_native_header() {
        let h = NoffHeader::parse(&header_bytes(WORDS, false)).unwrap();
        assert_eq!(h.magic, NOFF_MAGIC);
        assert_eq!(
            h.code,
            Segment {
                size: 100,
                virtual_addr: 0,
                in_file_addr: 64
            }
        );
        assert_eq!(
            h.init_data,
            Segment {
                size: 50,
                virtual_addr: 128,
                in_file_addr: 164
            }
        );
        assert_eq!(h.uninit_data.size, 30);
        assert_eq!(h.user_memory_size(), 180);
    }

    #[test]
    fn fixes_up_foreign_endian_header() {
        let h = NoffHeader::parse(&header_bytes(WORDS, true)).unwrap();
        assert_eq!(h.magic, NOFF_MAGIC);
        assert_eq!(h.code.size, 100);
        assert_eq!(h.init_data.in_file_addr, 164);
        assert_eq!(h.uninit_data.virtual_addr, 192);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut words = WORDS;
        words[0] = 0xdeadbeef;
        assert!(matches!(
            NoffHeader::parse(&header_bytes(words, false)),
            Err(LoadError::BadMagic)
        ));
    }

    #[test]
    fn open_missing_file_reports_path() {
        let err = Executable::open("/nonexistent/definitely-missing").unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }));
    }
}
