use std::time::Duration;

/// Default CPU-time quantization ladder, in seconds.
///
/// Raw CPU-time requirements are rounded up to the smallest entry that
/// covers them, bounding the number of distinct task queues that the
/// CPU-time dimension alone can create.
pub const DEFAULT_CPU_TIME_LADDER: &[i64] = &[
    360, 1800, 3600, 21600, 43200, 86400, 172800, 259200, 345600, 518400, 691200, 864000, 1_080_000,
];

/// Share assigned to a group when the registry has no explicit value.
pub const DEFAULT_GROUP_SHARE: f64 = 1000.0;

/// Hard floor for any task queue priority. A queue at exactly this value
/// is still selectable by the weighted-random scheme, just very rarely.
pub const TQ_MIN_SHARE: f64 = 0.001;

/// How the per-queue raw weight is aggregated from the job weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightAggregation {
    /// Average job weight of the queue (default).
    Avg,
    /// Total job weight of the queue.
    Sum,
}

#[derive(Debug, Clone)]
pub struct TqConfig {
    /// Maximum number of jobs a single task queue may hold. Enqueues past
    /// this point create a structurally identical sibling queue.
    pub max_jobs_per_queue: usize,
    /// Ascending CPU-time bucket boundaries.
    pub cpu_time_ladder: Vec<i64>,
    /// Outer retry budget of the match state machine.
    pub max_match_retries: u32,
    /// Retry budget for the find-and-claim loop during enqueue.
    pub find_queue_retries: u32,
    /// Raw job priorities are clamped into this (min, max) range before
    /// being turned into a selection weight.
    pub priority_bounds: (f64, f64),
    /// Share assigned to groups without an explicit registry entry.
    pub default_group_share: f64,
    /// Whether the external shares corrector is consulted.
    pub shares_correction_enabled: bool,
    pub weight_aggregation: WeightAggregation,
    /// How long an apparently-empty queue sits in the deletion scheduler
    /// before its empty check runs.
    pub empty_check_delay: Duration,
    /// Maximum number of queues the deletion scheduler tracks at once.
    pub empty_check_capacity: usize,
    /// Candidate queues examined per match attempt.
    pub queues_per_match: usize,
    /// Jobs fetched per queue and priority level during a match attempt.
    pub jobs_per_match: usize,
}

impl Default for TqConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_queue: 5000,
            cpu_time_ladder: DEFAULT_CPU_TIME_LADDER.to_vec(),
            max_match_retries: 3,
            find_queue_retries: 10,
            priority_bounds: (0.001, 10.0),
            default_group_share: DEFAULT_GROUP_SHARE,
            shares_correction_enabled: false,
            weight_aggregation: WeightAggregation::Avg,
            empty_check_delay: Duration::from_secs(5),
            empty_check_capacity: 1024,
            queues_per_match: 10,
            jobs_per_match: 10,
        }
    }
}

impl TqConfig {
    /// Replace the CPU-time ladder. A malformed ladder (empty, non-positive
    /// entries or not strictly ascending) is rejected and the default is
    /// kept instead.
    pub fn with_cpu_time_ladder(mut self, ladder: Vec<i64>) -> Self {
        if ladder_is_valid(&ladder) {
            self.cpu_time_ladder = ladder;
        } else {
            tracing::warn!(?ladder, "Ignoring malformed CPU-time ladder, keeping default");
            self.cpu_time_ladder = DEFAULT_CPU_TIME_LADDER.to_vec();
        }
        self
    }

    pub fn with_max_jobs_per_queue(mut self, max: usize) -> Self {
        self.max_jobs_per_queue = max;
        self
    }

    pub fn with_match_retries(mut self, retries: u32) -> Self {
        self.max_match_retries = retries;
        self
    }

    pub fn with_find_queue_retries(mut self, retries: u32) -> Self {
        self.find_queue_retries = retries;
        self
    }

    pub fn with_shares_correction(mut self, enabled: bool) -> Self {
        self.shares_correction_enabled = enabled;
        self
    }

    pub fn with_weight_aggregation(mut self, aggregation: WeightAggregation) -> Self {
        self.weight_aggregation = aggregation;
        self
    }

    pub fn with_empty_check_delay(mut self, delay: Duration) -> Self {
        self.empty_check_delay = delay;
        self
    }

    /// Map a raw CPU-time requirement onto its quantization bucket: the
    /// smallest ladder entry that is >= the input, saturating at the top.
    pub fn quantize_cpu_time(&self, seconds: i64) -> i64 {
        self.cpu_time_ladder
            .iter()
            .find(|&&bucket| bucket >= seconds)
            .copied()
            .unwrap_or_else(|| {
                // Ladder is never empty, validated at construction.
                *self.cpu_time_ladder.last().unwrap_or(&seconds)
            })
    }
}

fn ladder_is_valid(ladder: &[i64]) -> bool {
    !ladder.is_empty()
        && ladder.iter().all(|&b| b > 0)
        && ladder.windows(2).all(|w| w[0] < w[1])
}
