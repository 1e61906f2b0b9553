//! The swap file itself: a fixed-size, page-addressable store with a
//! bitmap allocator (spec §4.J "A swap file is a fixed-size page-
//! addressable store").

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;

/// Past this many consecutive occupied pages scanned without finding a
/// free run, the allocator gives up on linear scan and jumps forward by a
/// pseudo-random offset (spec: "a near-page counter that, on reaching a
/// threshold, triggers a random jump").
const NEAR_PAGE_JUMP_THRESHOLD: usize = 64;

/// A contiguous run of pages holding one swapped-out value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlot {
    pub first_page: usize,
    pub page_count: usize,
    /// The payload's exact byte length, so [`SwapFile::read`] can trim the
    /// page-aligned buffer back to the original value.
    pub byte_len: usize,
}

pub struct SwapFile {
    file: File,
    page_size: usize,
    total_pages: usize,
    /// One bit per page: `true` means occupied.
    bitmap: Vec<bool>,
    /// Rolling cursor for the next allocation scan (spec: "a rolling
    /// 'next probable empty page' cursor").
    cursor: usize,
    near_page_counter: usize,
}

impl SwapFile {
    /// Opens (creating if absent) the backing file and pre-allocates it to
    /// `total_pages * page_size` bytes.
    pub fn open(path: &Path, page_size: usize, total_pages: usize) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len((page_size * total_pages) as u64)?;
        Ok(Self { file, page_size, total_pages, bitmap: vec![false; total_pages], cursor: 0, near_page_counter: 0 })
    }

    #[must_use]
    pub fn pages_needed(&self, byte_len: usize) -> usize {
        byte_len.div_ceil(self.page_size).max(1)
    }

    /// Finds `count` contiguous free pages starting from `self.cursor`,
    /// wrapping once; jumps the scan start pseudo-randomly after too many
    /// near-misses (spec: "if contention is high, jumps forward by a
    /// pseudo-random offset").
    fn find_contiguous_free(&mut self, count: usize) -> Option<usize> {
        if count > self.total_pages {
            return None;
        }
        let start = self.cursor;
        for offset in 0..self.total_pages {
            let begin = (start + offset) % self.total_pages;
            if begin + count > self.total_pages {
                // Would wrap mid-run; only accept a window that doesn't
                // cross the end of the file.
                self.near_page_counter += 1;
                self.maybe_jump();
                continue;
            }
            if self.bitmap[begin..begin + count].iter().all(|&used| !used) {
                self.near_page_counter = 0;
                return Some(begin);
            }
            self.near_page_counter += 1;
            self.maybe_jump();
        }
        None
    }

    fn maybe_jump(&mut self) {
        if self.near_page_counter >= NEAR_PAGE_JUMP_THRESHOLD {
            self.near_page_counter = 0;
            let jump = pseudo_random_offset(self.total_pages.max(1));
            self.cursor = (self.cursor + jump) % self.total_pages.max(1);
        }
    }

    /// Allocates pages for and writes `payload`, returning its slot.
    pub fn write(&mut self, payload: &Bytes) -> io::Result<PageSlot> {
        let count = self.pages_needed(payload.len());
        let first_page = self.find_contiguous_free(count).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "swap file exhausted")
        })?;
        for page in first_page..first_page + count {
            self.bitmap[page] = true;
        }
        self.cursor = (first_page + count) % self.total_pages.max(1);
        self.file.seek(SeekFrom::Start((first_page * self.page_size) as u64))?;
        self.file.write_all(payload)?;
        self.file.flush()?;
        Ok(PageSlot { first_page, page_count: count, byte_len: payload.len() })
    }

    /// Reads back the payload written at `slot`, trimmed to its original
    /// `byte_len` (page reads are page-aligned, so the tail of the final
    /// page may hold stale or zeroed bytes past the real payload).
    pub fn read(&mut self, slot: PageSlot) -> io::Result<Bytes> {
        let mut buf = vec![0u8; slot.page_count * self.page_size];
        self.file.seek(SeekFrom::Start((slot.first_page * self.page_size) as u64))?;
        self.file.read_exact(&mut buf)?;
        buf.truncate(slot.byte_len);
        Ok(Bytes::from(buf))
    }

    pub fn free(&mut self, slot: PageSlot) {
        for page in slot.first_page..slot.first_page + slot.page_count {
            if page < self.bitmap.len() {
                self.bitmap[page] = false;
            }
        }
    }
}

/// A cheap non-cryptographic pseudo-random offset in `0..bound`, seeded
/// from the address of a fresh stack value — used only to pick where the
/// allocator jumps next on contention, never for anything
/// security-sensitive.
fn pseudo_random_offset(bound: usize) -> usize {
    let seed = &bound as *const usize as usize;
    (seed.wrapping_mul(2_654_435_761)) % bound.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_padded_to_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = SwapFile::open(&dir.path().join("swap.dat"), 16, 8).unwrap();
        let payload = Bytes::from_static(b"hello world");
        let slot = sf.write(&payload).unwrap();
        assert_eq!(slot.page_count, 1);
        let read_back = sf.read(slot).unwrap();
        assert_eq!(&read_back[..payload.len()], &payload[..]);
    }

    #[test]
    fn free_allows_reallocation_of_same_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = SwapFile::open(&dir.path().join("swap.dat"), 16, 2).unwrap();
        let a = sf.write(&Bytes::from_static(b"0123456789abcdef")).unwrap();
        sf.free(a);
        let b = sf.write(&Bytes::from_static(b"xxxxxxxxxxxxxxxx")).unwrap();
        assert_eq!(a.page_count, b.page_count);
    }

    #[test]
    fn exhausted_swap_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut sf = SwapFile::open(&dir.path().join("swap.dat"), 16, 1).unwrap();
        sf.write(&Bytes::from_static(b"0123456789abcdef")).unwrap();
        let big = Bytes::from(vec![0u8; 32]);
        assert!(sf.write(&big).is_err());
    }

    #[test]
    fn pages_needed_rounds_up() {
        let dir = tempfile::tempdir().unwrap();
        let sf = SwapFile::open(&dir.path().join("swap.dat"), 16, 4).unwrap();
        assert_eq!(sf.pages_needed(1), 1);
        assert_eq!(sf.pages_needed(16), 1);
        assert_eq!(sf.pages_needed(17), 2);
    }
}
