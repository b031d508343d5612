//! File-system seam.
//!
//! The node never blocks on a file: every operation is requested through
//! [`Io`] and answered with a completion signal on the inbox. Both provided
//! implementations complete synchronously before queueing the reply, which
//! keeps a single-threaded node deterministic while preserving the rule
//! that the requesting record waits for its CONF with the continuation in
//! its state.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::PathBuf;

use hashbrown::HashMap;

use crate::signal::{
    FsCloseConf, FsOpenConf, FsOpenRef, FsReadConf, FsReadRef, FsSyncConf, FsWriteConf, FsWriteRef,
    Inbox, Signal,
};

/// Positional writes for the fixed-size log files; short writes retry
/// from where the kernel stopped.
fn write_full(file: &File, buf: &[u8], at: u64) -> io::Result<()> {
    let mut done = 0;
    loop {
        if done == buf.len() {
            return Ok(());
        }
        done += nix::sys::uio::pwrite(file, &buf[done..], (at + done as u64) as _)?;
    }
}

/// Positional reads. Log files are preallocated to their full size, so a
/// zero-length read means the file on disk is shorter than the format
/// says it must be.
fn read_full(file: &File, buf: &mut [u8], at: u64) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match nix::sys::uio::pread(file, &mut buf[done..], (at + done as u64) as _)? {
            0 => {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "log file truncated"));
            }
            n => done += n,
        }
    }
    Ok(())
}

pub trait Io {
    /// Opens (optionally creating to `size` bytes) the file at `path`
    /// relative to the io root. Answers FsOpenConf { user, os_file } or
    /// FsOpenRef.
    fn open(&mut self, path: &str, size: u64, create: bool, user: u32, inbox: &mut Inbox);

    /// Answers FsCloseConf { user }.
    fn close(&mut self, os_file: u32, user: u32, inbox: &mut Inbox);

    /// Writes the buffers contiguously at `offset`, optionally syncing.
    /// Answers FsWriteConf { lfo } or FsWriteRef.
    fn write(&mut self, os_file: u32, offset: u64, bufs: &[&[u8]], sync: bool, lfo: u32, inbox: &mut Inbox);

    /// Fills `buf` from `offset`. Answers FsReadConf { lfo } or FsReadRef.
    fn read(&mut self, os_file: u32, offset: u64, buf: &mut [u8], lfo: u32, inbox: &mut Inbox);

    /// Answers FsSyncConf { user }.
    fn sync(&mut self, os_file: u32, user: u32, inbox: &mut Inbox);
}

/// Real files under a base directory.
pub struct StdIo {
    base: PathBuf,
    files: HashMap<u32, File>,
    next_id: u32,
}

impl StdIo {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            files: HashMap::new(),
            next_id: 1,
        }
    }

    /// Opens an io root, creating the directory tree first.
    pub fn create(base: impl Into<PathBuf>) -> crate::error::Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        Ok(Self::new(base))
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

impl Io for StdIo {
    fn open(&mut self, path: &str, size: u64, create: bool, user: u32, inbox: &mut Inbox) {
        let full = self.full_path(path);
        let result = (|| -> io::Result<File> {
            if create {
                if let Some(dir) = full.parent() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&full)?;
            if create && file.metadata()?.len() < size {
                file.set_len(size)?;
            }
            Ok(file)
        })();
        match result {
            Ok(file) => {
                let os_file = self.next_id;
                self.next_id += 1;
                self.files.insert(os_file, file);
                inbox.push(Signal::FsOpenConf(FsOpenConf { user, os_file }));
            }
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "log file open failed");
                inbox.push(Signal::FsOpenRef(FsOpenRef {
                    user,
                    error: e.raw_os_error().unwrap_or(-1),
                }));
            }
        }
    }

    fn close(&mut self, os_file: u32, user: u32, inbox: &mut Inbox) {
        self.files.remove(&os_file);
        inbox.push(Signal::FsCloseConf(FsCloseConf { user }));
    }

    fn write(&mut self, os_file: u32, offset: u64, bufs: &[&[u8]], sync: bool, lfo: u32, inbox: &mut Inbox) {
        let file = match self.files.get(&os_file) {
            Some(f) => f,
            None => {
                inbox.push(Signal::FsWriteRef(FsWriteRef { lfo, error: -1 }));
                return;
            }
        };
        let mut at = offset;
        for buf in bufs {
            if let Err(e) = write_full(file, buf, at) {
                inbox.push(Signal::FsWriteRef(FsWriteRef {
                    lfo,
                    error: e.raw_os_error().unwrap_or(-1),
                }));
                return;
            }
            at += buf.len() as u64;
        }
        if sync {
            if let Err(e) = file.sync_data() {
                inbox.push(Signal::FsWriteRef(FsWriteRef {
                    lfo,
                    error: e.raw_os_error().unwrap_or(-1),
                }));
                return;
            }
        }
        inbox.push(Signal::FsWriteConf(FsWriteConf { lfo }));
    }

    fn read(&mut self, os_file: u32, offset: u64, buf: &mut [u8], lfo: u32, inbox: &mut Inbox) {
        let file = match self.files.get(&os_file) {
            Some(f) => f,
            None => {
                inbox.push(Signal::FsReadRef(FsReadRef { lfo, error: -1 }));
                return;
            }
        };
        match read_full(file, buf, offset) {
            Ok(()) => inbox.push(Signal::FsReadConf(FsReadConf { lfo })),
            Err(e) => inbox.push(Signal::FsReadRef(FsReadRef {
                lfo,
                error: e.raw_os_error().unwrap_or(-1),
            })),
        }
    }

    fn sync(&mut self, os_file: u32, user: u32, inbox: &mut Inbox) {
        if let Some(file) = self.files.get(&os_file) {
            // A sync failure here would leave the durability promise
            // broken; treat it like a failed write at the caller.
            if let Err(e) = file.sync_data() {
                tracing::error!(os_file, error = %e, "fsync failed");
            }
        }
        inbox.push(Signal::FsSyncConf(FsSyncConf { user }));
    }
}

/// In-memory files with fault injection, for tests.
#[derive(Default)]
pub struct SimIo {
    by_name: HashMap<String, u32>,
    contents: HashMap<u32, Vec<u8>>,
    next_id: u32,
    pub fail_next_open: bool,
    pub fail_next_read: bool,
    pub fail_next_write: bool,
    pub writes: u64,
    pub syncs: u64,
}

impl SimIo {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn file_bytes(&self, path: &str) -> Option<&Vec<u8>> {
        self.by_name.get(path).and_then(|id| self.contents.get(id))
    }

    pub fn file_bytes_mut(&mut self, path: &str) -> Option<&mut Vec<u8>> {
        let id = *self.by_name.get(path)?;
        self.contents.get_mut(&id)
    }
}

impl Io for SimIo {
    fn open(&mut self, path: &str, size: u64, create: bool, user: u32, inbox: &mut Inbox) {
        if std::mem::take(&mut self.fail_next_open) {
            inbox.push(Signal::FsOpenRef(FsOpenRef { user, error: -1 }));
            return;
        }
        let os_file = match self.by_name.get(path) {
            Some(&id) => id,
            None if create => {
                let id = self.next_id;
                self.next_id += 1;
                self.by_name.insert(path.to_owned(), id);
                self.contents.insert(id, vec![0; size as usize]);
                id
            }
            None => {
                inbox.push(Signal::FsOpenRef(FsOpenRef { user, error: -1 }));
                return;
            }
        };
        inbox.push(Signal::FsOpenConf(FsOpenConf { user, os_file }));
    }

    fn close(&mut self, _os_file: u32, user: u32, inbox: &mut Inbox) {
        inbox.push(Signal::FsCloseConf(FsCloseConf { user }));
    }

    fn write(&mut self, os_file: u32, offset: u64, bufs: &[&[u8]], sync: bool, lfo: u32, inbox: &mut Inbox) {
        if std::mem::take(&mut self.fail_next_write) {
            inbox.push(Signal::FsWriteRef(FsWriteRef { lfo, error: -1 }));
            return;
        }
        let Some(content) = self.contents.get_mut(&os_file) else {
            inbox.push(Signal::FsWriteRef(FsWriteRef { lfo, error: -1 }));
            return;
        };
        let mut at = offset as usize;
        for buf in bufs {
            if content.len() < at + buf.len() {
                content.resize(at + buf.len(), 0);
            }
            content[at..at + buf.len()].copy_from_slice(buf);
            at += buf.len();
        }
        self.writes += 1;
        if sync {
            self.syncs += 1;
        }
        inbox.push(Signal::FsWriteConf(FsWriteConf { lfo }));
    }

    fn read(&mut self, os_file: u32, offset: u64, buf: &mut [u8], lfo: u32, inbox: &mut Inbox) {
        if std::mem::take(&mut self.fail_next_read) {
            inbox.push(Signal::FsReadRef(FsReadRef { lfo, error: -1 }));
            return;
        }
        let Some(content) = self.contents.get(&os_file) else {
            inbox.push(Signal::FsReadRef(FsReadRef { lfo, error: -1 }));
            return;
        };
        let at = offset as usize;
        if content.len() < at + buf.len() {
            inbox.push(Signal::FsReadRef(FsReadRef { lfo, error: -1 }));
            return;
        }
        buf.copy_from_slice(&content[at..at + buf.len()]);
        inbox.push(Signal::FsReadConf(FsReadConf { lfo }));
    }

    fn sync(&mut self, _os_file: u32, user: u32, inbox: &mut Inbox) {
        self.syncs += 1;
        inbox.push(Signal::FsSyncConf(FsSyncConf { user }));
    }
}

/// Directory layout of the redo log on disk.
pub fn log_file_path(part: u32, file_no: u32) -> String {
    format!("part{part}/s{file_no}.redo")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signal::Signal;

    fn drain(inbox: &mut Inbox) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Some(s) = inbox.pop() {
            out.push(s);
        }
        out
    }

    #[test]
    fn sim_io_round_trip() {
        let mut io = SimIo::new();
        let mut inbox = Inbox::default();
        io.open("part0/s0.redo", 64, true, 7, &mut inbox);
        let os_file = match drain(&mut inbox).pop().unwrap() {
            Signal::FsOpenConf(c) => {
                assert_eq!(c.user, 7);
                c.os_file
            }
            other => panic!("unexpected {other:?}"),
        };
        io.write(os_file, 8, &[&[1u8, 2, 3], &[4u8]], false, 1, &mut inbox);
        assert!(matches!(drain(&mut inbox).pop(), Some(Signal::FsWriteConf(_))));
        let mut buf = [0u8; 4];
        io.read(os_file, 8, &mut buf, 2, &mut inbox);
        assert!(matches!(drain(&mut inbox).pop(), Some(Signal::FsReadConf(_))));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn std_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = StdIo::new(dir.path());
        let mut inbox = Inbox::default();
        io.open(&log_file_path(0, 0), 4096, true, 0, &mut inbox);
        let os_file = match drain(&mut inbox).pop().unwrap() {
            Signal::FsOpenConf(c) => c.os_file,
            other => panic!("unexpected {other:?}"),
        };
        io.write(os_file, 100, &[b"redo"], true, 1, &mut inbox);
        assert!(matches!(drain(&mut inbox).pop(), Some(Signal::FsWriteConf(_))));
        let mut buf = [0u8; 4];
        io.read(os_file, 100, &mut buf, 2, &mut inbox);
        assert!(matches!(drain(&mut inbox).pop(), Some(Signal::FsReadConf(_))));
        assert_eq!(&buf, b"redo");
    }

    #[test]
    fn sim_io_fault_injection() {
        let mut io = SimIo::new();
        let mut inbox = Inbox::default();
        io.open("x", 16, true, 0, &mut inbox);
        let os_file = match drain(&mut inbox).pop().unwrap() {
            Signal::FsOpenConf(c) => c.os_file,
            other => panic!("unexpected {other:?}"),
        };
        io.fail_next_write = true;
        io.write(os_file, 0, &[b"a"], false, 9, &mut inbox);
        match drain(&mut inbox).pop().unwrap() {
            Signal::FsWriteRef(r) => assert_eq!(r.lfo, 9),
            other => panic!("unexpected {other:?}"),
        }
    }
}
