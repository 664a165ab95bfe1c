//! Kernel statistics sink: virtual time and paging counters.

/// Counters accumulated over a run. `total_ticks` is the virtual clock the
/// replacement stamps are drawn from; it advances once per simulated memory
/// access.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub total_ticks: usize,
    pub total_page_faults: usize,
    pub shared_page_faults: usize,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the virtual clock.
    pub fn advance(&mut self, ticks: usize) {
        self.total_ticks += ticks;
    }
}
