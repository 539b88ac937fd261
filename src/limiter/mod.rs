//! Persistent sliding-window rate limiter.
//!
//! Tracks per-action-kind timestamps inside rolling windows. Every mutation
//! is flushed to the durable store keyed by action kind, so killing and
//! relaunching the process cannot reset quotas; on load, entries already
//! outside their window are discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, chrono_duration};
use crate::storage::{KeyValueStore, StorageResult};

/// Category of rate-limited operation. Each kind owns an independent window
/// with an independent ceiling; in particular [`ActionKind::DailyMessageCap`]
/// is a separate per-day budget on top of the per-minute
/// [`ActionKind::Message`] burst limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Message,
    Like,
    Report,
    Search,
    DailyMessageCap,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Message,
        ActionKind::Like,
        ActionKind::Report,
        ActionKind::Search,
        ActionKind::DailyMessageCap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Message => "message",
            ActionKind::Like => "like",
            ActionKind::Report => "report",
            ActionKind::Search => "search",
            ActionKind::DailyMessageCap => "daily-message-cap",
        }
    }

    fn storage_key(&self) -> String {
        format!("rate-window:{}", self.as_str())
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message burst ceiling per minute.
pub const MESSAGES_PER_MINUTE: usize = 10;
/// Like quota per day.
pub const LIKES_PER_DAY: usize = 100;
/// Report quota per hour.
pub const REPORTS_PER_HOUR: usize = 5;
/// Search ceiling per minute.
pub const SEARCHES_PER_MINUTE: usize = 30;
/// Global message cap per day, independent of the per-minute burst limit.
pub const DAILY_MESSAGE_CAP: usize = 500;

/// Ceiling and window length for one action kind.
#[derive(Clone, Copy, Debug)]
pub struct WindowLimit {
    pub ceiling: usize,
    pub window: Duration,
}

impl WindowLimit {
    pub const fn new(ceiling: usize, window: Duration) -> Self {
        Self { ceiling, window }
    }
}

/// Per-kind limits. The defaults carry the production quotas; tests swap in
/// tighter ones.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    limits: HashMap<ActionKind, WindowLimit>,
}

impl RateLimitConfig {
    pub fn new(limits: HashMap<ActionKind, WindowLimit>) -> Self {
        Self { limits }
    }

    pub fn with_limit(mut self, kind: ActionKind, limit: WindowLimit) -> Self {
        self.limits.insert(kind, limit);
        self
    }

    pub fn limit_for(&self, kind: ActionKind) -> WindowLimit {
        self.limits
            .get(&kind)
            .copied()
            .unwrap_or(WindowLimit::new(usize::MAX, Duration::from_secs(60)))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(60 * 60);
        const DAY: Duration = Duration::from_secs(24 * 60 * 60);

        let limits = HashMap::from([
            (ActionKind::Message, WindowLimit::new(MESSAGES_PER_MINUTE, MINUTE)),
            (ActionKind::Like, WindowLimit::new(LIKES_PER_DAY, DAY)),
            (ActionKind::Report, WindowLimit::new(REPORTS_PER_HOUR, HOUR)),
            (ActionKind::Search, WindowLimit::new(SEARCHES_PER_MINUTE, MINUTE)),
            (
                ActionKind::DailyMessageCap,
                WindowLimit::new(DAILY_MESSAGE_CAP, DAY),
            ),
        ]);
        Self { limits }
    }
}

/// Sliding-window rate limiter with durable windows.
///
/// Admission checks are serialized through an async mutex held across the
/// persistence flush, so two simultaneous checks against a window with one
/// slot left can never both succeed.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    windows: Mutex<HashMap<ActionKind, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Build a limiter, reloading persisted windows and immediately pruning
    /// entries that fell outside their window while the process was down.
    pub async fn load(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
    ) -> StorageResult<Self> {
        let mut windows = HashMap::new();
        let now = clock.now();

        for kind in ActionKind::ALL {
            let Some(bytes) = store.load(&kind.storage_key()).await? else {
                continue;
            };
            let mut timestamps: VecDeque<DateTime<Utc>> = match serde_json::from_slice(&bytes) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "discarding unreadable rate window");
                    continue;
                }
            };
            let limit = config.limit_for(kind);
            prune(&mut timestamps, now, limit.window);
            if !timestamps.is_empty() {
                windows.insert(kind, timestamps);
            }
        }

        Ok(Self {
            config,
            clock,
            store,
            windows: Mutex::new(windows),
        })
    }

    /// Check-and-consume: returns `true` and records the event if the window
    /// has room, `false` without mutating state otherwise.
    pub async fn try_admit(&self, kind: ActionKind) -> StorageResult<bool> {
        let limit = self.config.limit_for(kind);
        let now = self.clock.now();

        let mut windows = self.windows.lock().await;
        let window = windows.entry(kind).or_default();
        prune(window, now, limit.window);

        if window.len() >= limit.ceiling {
            debug!(kind = %kind, count = window.len(), "rate limit denied");
            return Ok(false);
        }

        window.push_back(now);
        let bytes = serde_json::to_vec(&window)?;
        self.store.save(&kind.storage_key(), bytes).await?;
        Ok(true)
    }

    /// Like [`try_admit`](Self::try_admit) but maps denial to the typed
    /// rate-limit error carrying a retry-after hint.
    pub async fn admit(&self, kind: ActionKind) -> crate::Result<()> {
        self.admit_many(&[kind]).await
    }

    /// Admit against several windows atomically: every window is checked
    /// before any slot is consumed, so a denial on one kind leaves the
    /// others untouched. The error names the kind that denied.
    pub async fn admit_many(&self, kinds: &[ActionKind]) -> crate::Result<()> {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;

        for &kind in kinds {
            let limit = self.config.limit_for(kind);
            let window = windows.entry(kind).or_default();
            prune(window, now, limit.window);

            if window.len() >= limit.ceiling {
                debug!(kind = %kind, count = window.len(), "rate limit denied");
                let retry_after = window
                    .front()
                    .and_then(|oldest| (*oldest + chrono_duration(limit.window) - now).to_std().ok());
                return Err(crate::Error::RateLimited {
                    action: kind,
                    retry_after,
                });
            }
        }

        for &kind in kinds {
            let window = windows.entry(kind).or_default();
            window.push_back(now);
            let bytes = serde_json::to_vec(&window)?;
            self.store.save(&kind.storage_key(), bytes).await?;
        }
        Ok(())
    }

    /// Remaining admissions in the current window.
    pub async fn remaining(&self, kind: ActionKind) -> usize {
        let limit = self.config.limit_for(kind);
        let now = self.clock.now();

        let mut windows = self.windows.lock().await;
        let window = windows.entry(kind).or_default();
        prune(window, now, limit.window);
        limit.ceiling.saturating_sub(window.len())
    }

    /// Time until the oldest surviving event leaves the window, freeing a
    /// slot. `None` when the window is empty.
    pub async fn time_until_reset(&self, kind: ActionKind) -> Option<Duration> {
        let limit = self.config.limit_for(kind);
        let now = self.clock.now();

        let mut windows = self.windows.lock().await;
        let window = windows.entry(kind).or_default();
        prune(window, now, limit.window);

        let oldest = window.front()?;
        (*oldest + chrono_duration(limit.window) - now).to_std().ok()
    }
}

fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, length: Duration) {
    let cutoff = now - chrono_duration(length);
    while let Some(oldest) = window.front() {
        if *oldest < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}
