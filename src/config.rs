/// Node configuration. Plain values, fixed at start; pools are sized once
/// and never grow.
#[derive(Debug, Clone)]
pub struct Config {
    /// Files in each log part's ring. Three is the minimum that keeps a
    /// spare file between head and tail.
    pub redo_log_files_per_part: u32,
    /// Size of the shared redo page pool, in pages.
    pub redo_log_pages: u32,
    /// Fragment-record pool size.
    pub fragment_records: u32,
    /// Table-record pool size.
    pub table_records: u32,
    /// Op-record pool size; also the number of contexts seized in the
    /// hash-index and row-store engines at start.
    pub op_records: u32,
    /// Scan-record pool size. One extra slot is always reserved for the
    /// restart copy scan.
    pub scan_records: u32,
    /// Max parallel ops a single scan may book in the hash index.
    pub max_parallel_ops_per_scan: u32,
    /// Commit-ack marker pool size.
    pub marker_records: u32,
    /// Overflow buffer pools for keys and attributes (4-word segments).
    pub key_buffers: u32,
    pub attr_buffers: u32,
    /// Skip log-page validation on restart and complete writes without
    /// touching the io layer.
    pub diskless: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redo_log_files_per_part: 4,
            redo_log_pages: 256,
            fragment_records: 64,
            table_records: 32,
            op_records: 256,
            scan_records: 16,
            max_parallel_ops_per_scan: 16,
            marker_records: 128,
            key_buffers: 256,
            attr_buffers: 512,
            diskless: false,
        }
    }
}
