//! Budget tracking over rolling calendar periods.
//!
//! The tracker keeps an append-only log of [`ActualCost`] records and
//! derives per-period totals on demand: the local calendar day, the ISO
//! week (Monday through Sunday), and the calendar month. Alert thresholds
//! fire once per period as daily utilisation crosses them; the
//! `emergency_mode` action latches a cheap-routing mode that only an
//! explicit [`BudgetTracker::reset_alerts`] clears.
//!
//! All mutating operations serialise against a single lock; status
//! snapshots take the same lock and return copies.

use crate::costbook::{round_micro_usd, ActualCost};
use chrono::{Datelike, Duration as ChronoDuration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{info, warn};

/// Rolling accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Local calendar day, midnight to midnight.
    Daily,
    /// ISO week, Monday 00:00 inclusive to next Monday 00:00 exclusive.
    Weekly,
    /// Calendar month.
    Monthly,
}

impl BudgetPeriod {
    /// Canonical lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

/// What to do when a threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    /// Informational log line only.
    Log,
    /// Warn and fan out to the budget event channel.
    Notify,
    /// Latch emergency routing mode.
    EmergencyMode,
}

/// One alert threshold over daily utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    /// Daily percent-used at which the alert fires.
    pub percentage: f64,
    /// Action taken when it fires.
    pub action: AlertAction,
}

/// Budget tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily spend ceiling, USD. Non-positive means unlimited.
    pub daily_limit: f64,
    /// Weekly spend ceiling, USD.
    pub weekly_limit: f64,
    /// Monthly spend ceiling, USD.
    pub monthly_limit: f64,
    /// Thresholds checked against daily percent-used, ascending.
    pub alert_thresholds: Vec<AlertThreshold>,
    /// Whether the `emergency_mode` action is allowed to latch.
    pub emergency_latch_enabled: bool,
    /// Providers refused while emergency mode is latched.
    pub disable_providers: Vec<String>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 5.0,
            weekly_limit: 25.0,
            monthly_limit: 100.0,
            alert_thresholds: vec![
                AlertThreshold { percentage: 50.0, action: AlertAction::Log },
                AlertThreshold { percentage: 80.0, action: AlertAction::Notify },
                AlertThreshold { percentage: 95.0, action: AlertAction::EmergencyMode },
            ],
            emergency_latch_enabled: true,
            disable_providers: vec!["anthropic".to_string()],
        }
    }
}

/// Derived spend snapshot for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Which period this snapshot covers.
    pub period: BudgetPeriod,
    /// Configured ceiling, USD.
    pub limit: f64,
    /// Spend within the period, rounded to micro-USD.
    pub spent: f64,
    /// `max(0, limit - spent)`, rounded to micro-USD.
    pub remaining: f64,
    /// Percent of the limit used, rounded to 0.01 %.
    pub percent_used: f64,
    /// Inclusive period start, local time.
    pub period_start: NaiveDateTime,
    /// Exclusive period end, local time.
    pub period_end: NaiveDateTime,
}

/// A fired alert, returned so callers can fan it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    /// Threshold that fired.
    pub percentage: f64,
    /// Its action.
    pub action: AlertAction,
    /// Daily percent-used at fire time.
    pub percent_used: f64,
    /// Daily spend at fire time, USD.
    pub spent: f64,
    /// Daily limit, USD.
    pub limit: f64,
}

/// Inclusive/exclusive local bounds of the period containing `today`.
pub fn period_bounds(period: BudgetPeriod, today: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let midnight = |d: NaiveDate| d.and_time(NaiveTime::MIN);
    match period {
        BudgetPeriod::Daily => {
            let next = today.succ_opt().unwrap_or(today);
            (midnight(today), midnight(next))
        }
        BudgetPeriod::Weekly => {
            let monday = today
                - ChronoDuration::days(i64::from(today.weekday().num_days_from_monday()));
            (midnight(monday), midnight(monday + ChronoDuration::days(7)))
        }
        BudgetPeriod::Monthly => {
            let first = today.with_day(1).unwrap_or(today);
            let next = first.checked_add_months(Months::new(1)).unwrap_or(first);
            (midnight(first), midnight(next))
        }
    }
}

struct Inner {
    records: Vec<ActualCost>,
    config: BudgetConfig,
    emergency_mode: bool,
    fired: BTreeSet<String>,
}

/// Thread-safe budget tracker. Single-writer lock; readers copy.
pub struct BudgetTracker {
    inner: Mutex<Inner>,
}

impl BudgetTracker {
    /// New tracker with no recorded spend.
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                config,
                emergency_mode: false,
                fired: BTreeSet::new(),
            }),
        }
    }

    /// Append a cost record and evaluate alert thresholds.
    ///
    /// Returns the alerts that fired on this transition, in ascending
    /// threshold order, so the caller can publish them.
    pub fn record_cost(&self, cost: ActualCost) -> Vec<BudgetAlert> {
        let mut inner = self.lock();
        inner.records.push(cost);
        Self::check_alerts_locked(&mut inner, Local::now().date_naive())
    }

    /// Spend snapshot for `period` as of now.
    pub fn status(&self, period: BudgetPeriod) -> BudgetStatus {
        self.status_at(period, Local::now().date_naive())
    }

    /// Spend snapshot with an explicit "today" (test seam).
    pub fn status_at(&self, period: BudgetPeriod, today: NaiveDate) -> BudgetStatus {
        let inner = self.lock();
        Self::status_locked(&inner, period, today)
    }

    /// Daily, weekly, and monthly snapshots taken under one lock.
    pub fn statuses(&self) -> [BudgetStatus; 3] {
        let inner = self.lock();
        let today = Local::now().date_naive();
        [
            Self::status_locked(&inner, BudgetPeriod::Daily, today),
            Self::status_locked(&inner, BudgetPeriod::Weekly, today),
            Self::status_locked(&inner, BudgetPeriod::Monthly, today),
        ]
    }

    /// Daily spend aggregated by provider.
    pub fn spend_by_provider(&self) -> BTreeMap<String, f64> {
        self.aggregate(|c| c.provider.clone())
    }

    /// Daily spend aggregated by `provider/model`.
    pub fn spend_by_model(&self) -> BTreeMap<String, f64> {
        self.aggregate(|c| format!("{}/{}", c.provider, c.model))
    }

    /// Whether the emergency latch is set.
    pub fn is_emergency_mode(&self) -> bool {
        self.lock().emergency_mode
    }

    /// Explicitly set or clear the emergency latch.
    pub fn set_emergency_mode(&self, active: bool) {
        let mut inner = self.lock();
        if inner.emergency_mode != active {
            warn!(active, "emergency mode changed explicitly");
        }
        inner.emergency_mode = active;
    }

    /// True only when emergency mode is latched and `provider` is listed.
    pub fn is_provider_disabled(&self, provider: &str) -> bool {
        let inner = self.lock();
        inner.emergency_mode && inner.config.disable_providers.iter().any(|p| p == provider)
    }

    /// Clear fired alerts and the emergency latch (period rollover).
    pub fn reset_alerts(&self) {
        let mut inner = self.lock();
        inner.fired.clear();
        inner.emergency_mode = false;
        info!("budget alerts reset");
    }

    /// Drop records older than 90 days.
    pub fn prune(&self) {
        let cutoff = Utc::now() - ChronoDuration::days(90);
        let mut inner = self.lock();
        let before = inner.records.len();
        inner.records.retain(|c| c.timestamp >= cutoff);
        let dropped = before - inner.records.len();
        if dropped > 0 {
            info!(dropped, "pruned aged budget records");
        }
    }

    /// Replace the configuration. Fired alert keys are kept so existing
    /// thresholds do not re-fire within the same period.
    pub fn update_config(&self, config: BudgetConfig) {
        self.lock().config = config;
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> BudgetConfig {
        self.lock().config.clone()
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned budget lock means a panic mid-append; the log is
            // still well-formed, so recover the guard and continue.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn status_locked(inner: &Inner, period: BudgetPeriod, today: NaiveDate) -> BudgetStatus {
        let (start, end) = period_bounds(period, today);
        let spent_raw: f64 = inner
            .records
            .iter()
            .filter(|c| {
                let local = c.timestamp.with_timezone(&Local).naive_local();
                local >= start && local < end
            })
            .map(|c| c.total_cost)
            .sum();

        let limit = match period {
            BudgetPeriod::Daily => inner.config.daily_limit,
            BudgetPeriod::Weekly => inner.config.weekly_limit,
            BudgetPeriod::Monthly => inner.config.monthly_limit,
        };

        let spent = round_micro_usd(spent_raw);
        let remaining = round_micro_usd((limit - spent).max(0.0));
        let percent_used = if limit > 0.0 {
            ((spent / limit) * 100.0 * 100.0).round() / 100.0
        } else {
            0.0
        };

        BudgetStatus {
            period,
            limit,
            spent,
            remaining,
            percent_used,
            period_start: start,
            period_end: end,
        }
    }

    fn check_alerts_locked(inner: &mut Inner, today: NaiveDate) -> Vec<BudgetAlert> {
        let daily = Self::status_locked(inner, BudgetPeriod::Daily, today);
        let mut thresholds = inner.config.alert_thresholds.clone();
        thresholds.sort_by(|a, b| {
            a.percentage
                .partial_cmp(&b.percentage)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut fired = Vec::new();
        for t in thresholds {
            let key = format!("daily-{:.2}", t.percentage);
            if daily.percent_used >= t.percentage && !inner.fired.contains(&key) {
                inner.fired.insert(key);
                match t.action {
                    AlertAction::Log => {
                        info!(
                            percent_used = daily.percent_used,
                            threshold = t.percentage,
                            "budget threshold crossed"
                        );
                    }
                    AlertAction::Notify => {
                        warn!(
                            percent_used = daily.percent_used,
                            spent = daily.spent,
                            limit = daily.limit,
                            "budget warning threshold crossed"
                        );
                    }
                    AlertAction::EmergencyMode => {
                        if inner.config.emergency_latch_enabled && !inner.emergency_mode {
                            inner.emergency_mode = true;
                            warn!(
                                percent_used = daily.percent_used,
                                "emergency routing mode latched"
                            );
                        }
                    }
                }
                fired.push(BudgetAlert {
                    percentage: t.percentage,
                    action: t.action,
                    percent_used: daily.percent_used,
                    spent: daily.spent,
                    limit: daily.limit,
                });
            }
        }
        fired
    }

    fn aggregate<F>(&self, key: F) -> BTreeMap<String, f64>
    where
        F: Fn(&ActualCost) -> String,
    {
        let inner = self.lock();
        let today = Local::now().date_naive();
        let (start, end) = period_bounds(BudgetPeriod::Daily, today);
        let mut out: BTreeMap<String, f64> = BTreeMap::new();
        for c in inner.records.iter().filter(|c| {
            let local = c.timestamp.with_timezone(&Local).naive_local();
            local >= start && local < end
        }) {
            *out.entry(key(c)).or_insert(0.0) += c.total_cost;
        }
        for v in out.values_mut() {
            *v = round_micro_usd(*v);
        }
        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
