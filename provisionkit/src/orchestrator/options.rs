//! Run configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::fetch::{RetryPolicy, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::relocate::DEFAULT_SENTINEL;

/// Default number of descriptors processed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Knobs for one install, resume or relocate run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker threads; clamped to at least 1.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Descriptors left untouched by this run.
    pub skip: BTreeSet<String>,
    pub sentinel: String,
    pub timeout: Duration,
    pub user_agent: String,
    /// Re-fingerprint DONE records at start and repair any that drifted.
    pub verify_installed: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            skip: BTreeSet::new(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verify_installed: true,
        }
    }
}

impl RunOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_skip<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_verify_installed(mut self, verify: bool) -> Self {
        self.verify_installed = verify;
        self
    }

    pub(crate) fn workers(&self) -> usize {
        self.concurrency.max(1)
    }
}
