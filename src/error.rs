pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch on log page {page}")]
    PageChecksum { page: u32 },
}

/// Numeric codes carried in REF signals back to the coordinator or client.
///
/// Temporary codes tell the coordinator to retry once load drops; semantic
/// codes abort the transaction with the code propagated to the client.
pub mod codes {
    /// Op-record pool exhausted; nothing was installed.
    pub const NO_FREE_OPERATION: u32 = 203;
    /// Commit-ack marker pool exhausted.
    pub const NO_FREE_MARKER: u32 = 204;
    /// Key/attribute overflow buffer pool exhausted.
    pub const NO_FREE_BUFFER: u32 = 207;
    /// Fragment-record pool exhausted (reported on fragment create).
    pub const NO_FREE_FRAGMENT: u32 = 208;
    /// Scan-record pool exhausted or scan-number mask full.
    pub const NO_FREE_SCAN: u32 = 209;
    /// Booked hash-index op budget would be exceeded by this scan.
    pub const SCAN_BOOK_OVERFLOW: u32 = 210;

    /// Free redo pages dropped below the operation floor.
    pub const REDO_LOG_OVERLOADED: u32 = 410;
    /// The redo head would run into the tail.
    pub const REDO_TAIL_PROBLEM: u32 = 411;
    /// A log file change is still in flight on the chosen part.
    pub const REDO_FILE_CHANGE_PROBLEM: u32 = 412;

    pub const TABLE_NOT_DEFINED: u32 = 283;
    pub const DROP_TABLE_IN_PROGRESS: u32 = 284;
    pub const SCHEMA_VERSION_MISMATCH: u32 = 285;
    pub const FRAGMENT_NOT_DEFINED: u32 = 286;
    pub const KEY_LENGTH_ERROR: u32 = 290;

    /// Storage-engine verdicts surfaced unchanged to the coordinator.
    pub const TUPLE_ALREADY_EXIST: u32 = 630;
    pub const NO_TUPLE_FOUND: u32 = 626;
    pub const SEARCH_CONDITION_FALSE: u32 = 899;

    /// The node is shutting down or a restart is still in progress.
    pub const NODE_NOT_STARTED: u32 = 722;

    pub fn is_temporary(code: u32) -> bool {
        matches!(
            code,
            NO_FREE_OPERATION
                | NO_FREE_MARKER
                | NO_FREE_BUFFER
                | NO_FREE_SCAN
                | SCAN_BOOK_OVERFLOW
                | REDO_LOG_OVERLOADED
                | REDO_TAIL_PROBLEM
                | REDO_FILE_CHANGE_PROBLEM
        )
    }
}

/// Position carried by a fatal redo-log diagnostic.
///
/// Replay and the writer crash the node on structural violations; this is
/// the context they attach so the bad word can be found on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDiagnostic {
    pub part: u32,
    pub file_no: u32,
    pub mbyte: u32,
    pub page: u32,
    pub word: u32,
}
