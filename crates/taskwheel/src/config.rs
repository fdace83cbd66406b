use std::time::Duration;

/// How the due-poll loop claims work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStrategy {
    /// Fetch a candidate list with a plain read, then attempt a
    /// version-guarded pick per candidate. Works on any backend.
    FetchAndLockSeparately,

    /// Claim a whole batch in one round-trip using
    /// `SELECT … FOR UPDATE SKIP LOCKED`. Requires backend support; when a
    /// full batch comes back, the poll loop is woken early once in-flight
    /// work drains below the lower limit.
    FetchAndLockTogether,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of executions allowed to run in parallel.
    pub threads: usize,

    /// The period with which the scheduler polls for due executions.
    pub polling_interval: Duration,

    /// The period with which running executions have their liveness stamp
    /// refreshed in the database.
    ///
    /// A picked execution whose stamp is older than four times this period
    /// is considered dead and handed to its task's dead-execution handler.
    /// The actual update periods are jittered downwards by up to 1/4 of the
    /// period to avoid thundering herds on the database server.
    pub heartbeat_interval: Duration,

    /// The identity recorded in `picked_by` for claimed executions.
    ///
    /// Defaults to the hostname. Two schedulers sharing a name cannot be
    /// told apart in diagnostics, so give each process its own.
    pub scheduler_name: Option<String>,

    /// The table executions are persisted in.
    pub table_name: String,

    /// Wake the due-poll loop when a client schedules an execution whose
    /// time is not in the future, instead of waiting for the next tick.
    pub immediate_execution: bool,

    /// How the due-poll loop claims work.
    pub poll_strategy: PollStrategy,

    /// In-flight threshold below which a fetch-and-lock-together poll is
    /// re-triggered early when the last batch was full. Defaults to
    /// `threads / 2`.
    pub poll_lower_limit: Option<usize>,

    /// Upper bound on executions fetched per poll. Defaults to `threads`.
    pub poll_upper_limit: Option<usize>,

    /// How long shutdown waits for in-flight executions before force-
    /// stopping them. Force-stopped executions are recovered by a peer (or
    /// this process on restart) once their heartbeat expires.
    pub shutdown_max_wait: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = Some(name.into());
        self
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = table.into();
        self
    }

    pub fn immediate_execution(mut self, enabled: bool) -> Self {
        self.immediate_execution = enabled;
        self
    }

    pub fn poll_strategy(mut self, strategy: PollStrategy) -> Self {
        self.poll_strategy = strategy;
        self
    }

    pub fn poll_lower_limit(mut self, limit: usize) -> Self {
        self.poll_lower_limit = Some(limit);
        self
    }

    pub fn poll_upper_limit(mut self, limit: usize) -> Self {
        self.poll_upper_limit = Some(limit);
        self
    }

    pub fn shutdown_max_wait(mut self, wait: Duration) -> Self {
        self.shutdown_max_wait = wait;
        self
    }

    /// The age at which a picked execution with no fresh heartbeat becomes
    /// eligible for dead-execution recovery.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * 4
    }

    pub(crate) fn upper_limit(&self) -> usize {
        self.poll_upper_limit.unwrap_or(self.threads).max(1)
    }

    pub(crate) fn lower_limit(&self) -> usize {
        self.poll_lower_limit.unwrap_or(self.threads / 2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 10,
            polling_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5 * 60),
            scheduler_name: None,
            table_name: "scheduled_tasks".to_owned(),
            immediate_execution: false,
            poll_strategy: PollStrategy::FetchAndLockSeparately,
            poll_lower_limit: None,
            poll_upper_limit: None,
            shutdown_max_wait: Duration::from_secs(30 * 60),
        }
    }
}

/// Hostname fallback for the scheduler identity.
pub(crate) fn default_scheduler_name() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_owned())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}
