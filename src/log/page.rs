//! In-memory log pages and the shared page pool.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{hdr, CHECKSUM_SEED, PAGE_HEADER_WORDS, PAGE_WORDS};
use crate::pool::Pool;

crate::define_handle!(PageH);

/// Raw page content, exactly as it sits on disk.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone)]
pub struct RawPage(pub [u32; PAGE_WORDS]);

impl Default for RawPage {
    fn default() -> Self {
        RawPage([0; PAGE_WORDS])
    }
}

/// A pooled page plus the bookkeeping that never reaches disk.
pub struct LogPage {
    pub raw: Box<RawPage>,
    /// Page index within its file; meaningful only while the page is
    /// attached to a log part or an in-flight file operation.
    pub filepage: u32,
    pub dirty: bool,
}

impl Default for LogPage {
    fn default() -> Self {
        Self {
            raw: Box::new(RawPage::default()),
            filepage: 0,
            dirty: false,
        }
    }
}

impl LogPage {
    pub fn word(&self, index: usize) -> u32 {
        self.raw.0[index]
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        self.raw.0[index] = value;
    }

    pub fn words(&self, from: usize, len: usize) -> &[u32] {
        &self.raw.0[from..from + len]
    }

    pub fn log_lap(&self) -> u32 {
        self.word(hdr::LOG_LAP)
    }

    pub fn curr_page_index(&self) -> u32 {
        self.word(hdr::CURR_PAGE_INDEX)
    }

    pub fn zero(&mut self) {
        self.raw.0.fill(0);
        self.dirty = false;
    }

    /// Checksum over every word after the checksum slot, seeded with 37.
    /// The format depends on this exact computation; pages written with
    /// any other scheme are unreadable on restart.
    pub fn compute_checksum(&self) -> u32 {
        self.raw.0[hdr::CHECKSUM + 1..]
            .iter()
            .fold(CHECKSUM_SEED, |acc, w| acc ^ w)
    }

    pub fn store_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.set_word(hdr::CHECKSUM, checksum);
    }

    pub fn checksum_ok(&self) -> bool {
        self.word(hdr::CHECKSUM) == self.compute_checksum()
    }

    pub fn verify(&self) -> crate::error::Result<()> {
        if self.checksum_ok() {
            Ok(())
        } else {
            Err(crate::error::Error::PageChecksum {
                page: self.filepage,
            })
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.raw.0.as_bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.raw.0.as_bytes_mut()
    }
}

pub type PagePool = Pool<PageH, LogPage>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum_round_trip() {
        let mut page = LogPage::default();
        page.set_word(PAGE_HEADER_WORDS, 0xdead);
        page.set_word(PAGE_WORDS - 1, 0xbeef);
        page.store_checksum();
        assert!(page.checksum_ok());

        let copy = RawPage(page.raw.0);
        let restored = LogPage {
            raw: Box::new(copy),
            filepage: 0,
            dirty: false,
        };
        assert!(restored.checksum_ok());
        assert_eq!(restored.word(PAGE_HEADER_WORDS), 0xdead);
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut page = LogPage::default();
        page.set_word(100, 42);
        page.store_checksum();
        page.set_word(100, 43);
        assert!(!page.checksum_ok());
    }

    #[test]
    fn empty_page_checksum_is_seed() {
        let page = LogPage::default();
        assert_eq!(page.compute_checksum(), CHECKSUM_SEED);
    }
}
