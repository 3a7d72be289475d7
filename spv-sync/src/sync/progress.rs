use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state shared by both sync engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Initializing,
    /// No usable peer is connected.
    WaitingForConnections,
    /// Waiting on progress from the other engine.
    WaitForEvents,
    /// Agreeing on filter checkpoints with peers.
    Negotiating,
    Syncing,
    Synced,
    Stopped,
    Error,
}

/// Rate-limited progress summaries: headers processed, rate and latest height.
#[derive(Debug)]
pub struct ProgressLogger {
    /// Singular label for the logged entity, e.g. "block header".
    entity: &'static str,
    interval: Duration,
    received: u32,
    last_log: Instant,
    last_height: u32,
    last_time: u32,
}

impl ProgressLogger {
    pub fn new(entity: &'static str, interval: Duration) -> Self {
        Self {
            entity,
            interval,
            received: 0,
            last_log: Instant::now(),
            last_height: 0,
            last_time: 0,
        }
    }

    /// Record one processed entry and log a summary once the interval has passed.
    pub fn log_height(&mut self, timestamp: u32, height: u32) {
        self.received += 1;
        self.last_height = height;
        self.last_time = timestamp;

        let elapsed = self.last_log.elapsed();
        if elapsed < self.interval {
            return;
        }

        let plural = if self.received == 1 {
            ""
        } else {
            "s"
        };
        let rate = self.received as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let at = chrono::DateTime::from_timestamp(timestamp as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| timestamp.to_string());

        tracing::info!(
            "Processed {} {}{} in {:.1}s ({:.1}/s), height {}, {}",
            self.received,
            self.entity,
            plural,
            elapsed.as_secs_f64(),
            rate,
            height,
            at
        );

        self.received = 0;
        self.last_log = Instant::now();
    }

    pub fn last_height(&self) -> u32 {
        self.last_height
    }
}

/// Progress for block-header synchronization.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeadersProgress {
    state: SyncState,
    /// The tip height of the block-header storage.
    current_height: u32,
    /// Best height advertised by the sync peer.
    target_height: u32,
    /// Number of block headers stored in the current session.
    processed: u32,
    /// Number of reorgs accepted in the current session.
    reorgs: u32,
    last_activity: Instant,
}

impl Default for BlockHeadersProgress {
    fn default() -> Self {
        Self {
            state: SyncState::default(),
            current_height: 0,
            target_height: 0,
            processed: 0,
            reorgs: 0,
            last_activity: Instant::now(),
        }
    }
}

impl BlockHeadersProgress {
    /// Get completion percentage (0.0 to 1.0).
    pub fn percentage(&self) -> f64 {
        if self.target_height == 0 {
            return 1.0;
        }
        (self.current_height as f64 / self.target_height as f64).min(1.0)
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn current_height(&self) -> u32 {
        self.current_height
    }

    pub fn target_height(&self) -> u32 {
        self.target_height
    }

    pub fn processed(&self) -> u32 {
        self.processed
    }

    pub fn reorgs(&self) -> u32 {
        self.reorgs
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Update the sync state and bump the last activity time.
    pub fn set_state(&mut self, state: SyncState) {
        self.state = state;
        self.bump_last_activity();
    }

    pub fn update_current_height(&mut self, height: u32) {
        self.current_height = height;
        self.bump_last_activity();
    }

    /// Only moves forward.
    pub fn update_target_height(&mut self, height: u32) {
        if height > self.target_height {
            self.target_height = height;
            self.bump_last_activity();
        }
    }

    pub fn add_processed(&mut self, count: u32) {
        self.processed += count;
        self.bump_last_activity();
    }

    pub fn add_reorg(&mut self) {
        self.reorgs += 1;
        self.bump_last_activity();
    }

    pub fn bump_last_activity(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl fmt::Display for BlockHeadersProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.percentage() * 100.0;
        write!(
            f,
            "{:?} {}/{} ({:.1}%) processed: {}, reorgs: {}, last_activity: {}s",
            self.state,
            self.current_height,
            self.target_height,
            pct,
            self.processed,
            self.reorgs,
            self.last_activity.elapsed().as_secs()
        )
    }
}

/// Progress for filter-header synchronization.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterHeadersProgress {
    state: SyncState,
    /// The tip height of the filter-header storage.
    current_height: u32,
    /// The tip height of the block-header storage, the download limit for filter headers.
    block_header_tip_height: u32,
    /// Number of filter headers stored in the current session.
    processed: u32,
    /// Peers banned for serving filters that contradict block contents.
    banned_peers: u32,
    last_activity: Instant,
}

impl Default for FilterHeadersProgress {
    fn default() -> Self {
        Self {
            state: SyncState::default(),
            current_height: 0,
            block_header_tip_height: 0,
            processed: 0,
            banned_peers: 0,
            last_activity: Instant::now(),
        }
    }
}

impl FilterHeadersProgress {
    /// Get completion percentage (0.0 to 1.0).
    pub fn percentage(&self) -> f64 {
        if self.block_header_tip_height == 0 {
            return 1.0;
        }
        (self.current_height as f64 / self.block_header_tip_height as f64).min(1.0)
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn current_height(&self) -> u32 {
        self.current_height
    }

    pub fn block_header_tip_height(&self) -> u32 {
        self.block_header_tip_height
    }

    pub fn processed(&self) -> u32 {
        self.processed
    }

    pub fn banned_peers(&self) -> u32 {
        self.banned_peers
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Update the sync state and bump the last activity time.
    pub fn set_state(&mut self, state: SyncState) {
        self.state = state;
        self.bump_last_activity();
    }

    pub fn update_current_height(&mut self, height: u32) {
        self.current_height = height;
        self.bump_last_activity();
    }

    pub fn update_block_header_tip_height(&mut self, height: u32) {
        self.block_header_tip_height = height;
        self.bump_last_activity();
    }

    pub fn add_processed(&mut self, count: u32) {
        self.processed += count;
        self.bump_last_activity();
    }

    pub fn add_banned(&mut self, count: u32) {
        self.banned_peers += count;
        self.bump_last_activity();
    }

    pub fn bump_last_activity(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl fmt::Display for FilterHeadersProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.percentage() * 100.0;
        write!(
            f,
            "{:?} {}/{} ({:.1}%) processed: {}, banned: {}, last_activity: {}s",
            self.state,
            self.current_height,
            self.block_header_tip_height,
            pct,
            self.processed,
            self.banned_peers,
            self.last_activity.elapsed().as_secs()
        )
    }
}
