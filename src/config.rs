//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::checksum::ChecksumMode;
use crate::error::{Error, Result};
use crate::path::PathType;
use crate::util::pool::PageBudget;

/// Parameters of a descriptor pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in log and error messages.
    pub label: String,
    /// Number of independent lists (one per locality domain).
    pub num_lists: usize,
    /// Pages pre-allocated for each list.
    pub pages_per_list: usize,
    /// Bytes added per growth step; a multiple of `page_size`.
    pub chunk_size: usize,
    pub page_size: usize,
    /// Bytes charged per element.
    pub element_size: usize,
    /// Pages allocated over all lists at creation, at least.
    pub min_pages: usize,
    /// Page limit over all lists; `None` is unbounded.
    pub max_pages: Option<usize>,
    /// Consecutive failed requests tolerated before the pool reports itself
    /// exhausted for good.
    pub max_retries: usize,
    /// Spin and retry inside `get_element` instead of failing at once.
    pub retry_on_exhaustion: bool,
    /// Locality domain of each list; empty maps domain `d` to list
    /// `d % num_lists`.
    pub affinity: Vec<usize>,
    /// Only hand out elements from the requested list.
    pub enforce_affinity: bool,
    /// Terminate the process instead of returning an exhaustion error.
    pub abort_on_exhaustion: bool,
    /// Grow the requested list when its free count is at or below this.
    pub grow_threshold: usize,
    /// Optional page budget shared with other pools.
    pub parent: Option<Arc<PageBudget>>,
}

impl PoolConfig {
    /// A single-list, unbounded pool of `element_size`-byte elements.
    pub fn new(label: impl Into<String>, element_size: usize) -> Self {
        let page_size = 4096;
        let chunk_size = element_size.next_multiple_of(page_size);
        Self {
            label: label.into(),
            num_lists: 1,
            pages_per_list: chunk_size / page_size,
            chunk_size,
            page_size,
            element_size,
            min_pages: 0,
            max_pages: None,
            max_retries: 16,
            retry_on_exhaustion: false,
            affinity: Vec::new(),
            enforce_affinity: false,
            abort_on_exhaustion: false,
            grow_threshold: 0,
            parent: None,
        }
    }

    /// A pool holding at most `capacity` elements, one per page, none
    /// pre-allocated.
    pub fn bounded(label: impl Into<String>, capacity: usize) -> Self {
        Self {
            pages_per_list: 0,
            chunk_size: 1,
            page_size: 1,
            element_size: 1,
            max_pages: Some(capacity),
            ..Self::new(label, 1)
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(Error::Setup(format!("pool {}: {}", self.label, what)));
        if self.num_lists == 0 {
            return bad("no lists");
        }
        if self.page_size == 0 || self.element_size == 0 {
            return bad("zero page or element size");
        }
        if self.chunk_size == 0 || self.chunk_size % self.page_size != 0 {
            return bad("chunk size is not a multiple of the page size");
        }
        if self.chunk_size < self.element_size {
            return bad("chunk smaller than one element");
        }
        if !self.affinity.is_empty() && self.affinity.len() != self.num_lists {
            return bad("affinity table does not match the number of lists");
        }
        if matches!(self.max_pages, Some(max) if max < self.min_pages) {
            return bad("max_pages below min_pages");
        }
        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reliable delivery: every data fragment is sequenced and acknowledged.
    pub ack: bool,
    pub checksum: ChecksumMode,
    /// Whether more than one thread may drive the library.
    pub use_threads: bool,
    /// Base retransmission timeout.
    pub retrans_time: Duration,
    /// Cap on the exponent of the retransmission backoff.
    pub max_retrans_pow2: u32,
    /// Path preference used when several paths reach a destination.
    pub path_priority: Vec<PathType>,
    pub send_frag_pool: PoolConfig,
    pub recv_frag_pool: PoolConfig,
    /// Terminate on fatal errors instead of returning [`Error::Fatal`].
    pub abort_on_fatal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack: false,
            checksum: ChecksumMode::None,
            use_threads: true,
            retrans_time: Duration::from_millis(100),
            max_retrans_pow2: 6,
            path_priority: vec![
                PathType::SharedMem,
                PathType::Quadrics,
                PathType::Gm,
                PathType::Udp,
            ],
            send_frag_pool: PoolConfig::new("send frags", 256),
            recv_frag_pool: PoolConfig::new("recv frags", 256),
            abort_on_fatal: false,
        }
    }
}

impl Config {
    /// Reliable configuration with CRC checksums.
    pub fn reliable() -> Self {
        Self {
            ack: true,
            checksum: ChecksumMode::Crc,
            ..Self::default()
        }
    }
}
