use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};

const DRIVER_TICK: Duration = Duration::from_secs(1);

/// Where scheduler ticks land. The flow manager implements this and drops
/// ticks for flows that are not running.
#[async_trait]
pub trait TriggerTarget: Send + Sync {
    async fn fire(&self, flow_id: &str, node_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    Cron { expr: String, utc: bool },
    Interval { every: Duration },
}

impl TriggerSpec {
    fn kind(&self) -> &'static str {
        match self {
            TriggerSpec::Cron { .. } => "cron",
            TriggerSpec::Interval { .. } => "interval",
        }
    }

    fn key(&self) -> String {
        match self {
            TriggerSpec::Cron { expr, .. } => expr.clone(),
            TriggerSpec::Interval { every } => format!("{}ms", every.as_millis()),
        }
    }
}

/// `@every <duration>` is the interval spelling of a schedule; anything
/// else is handed to the cron parser.
pub fn parse_schedule(expr: &str, utc: bool) -> Result<TriggerSpec> {
    if let Some(rest) = expr.strip_prefix("@every") {
        let every = parse_duration(rest.trim())?;
        return Ok(TriggerSpec::Interval { every });
    }
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| RuntimeError::Validation(format!("bad cron expression '{expr}': {e}")))?;
    Ok(TriggerSpec::Cron {
        expr: expr.to_string(),
        utc,
    })
}

/// `90s`, `5m`, `1h`, `250ms` style durations.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let parse = |n: &str| -> Result<u64> {
        n.parse()
            .map_err(|_| RuntimeError::Validation(format!("bad duration '{s}'")))
    };
    if let Some(n) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse(n)?));
    }
    if let Some(n) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse(n)?));
    }
    if let Some(n) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse(n)? * 60));
    }
    if let Some(n) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse(n)? * 3600));
    }
    Err(RuntimeError::Validation(format!("bad duration '{s}'")))
}

#[derive(Debug, Clone)]
struct Trigger {
    node_id: String,
    spec: TriggerSpec,
}

/// Cron and interval triggers bound to flows.
///
/// One driver task wakes every second; each due trigger asks the target to
/// deliver a tick. The scheduler never touches flow state itself: if the
/// flow is not running, the target drops the tick.
pub struct Scheduler {
    triggers: RwLock<HashMap<String, Vec<Trigger>>>,
    tick: Duration,
    driver: std::sync::Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_tick(DRIVER_TICK)
    }

    /// Driver granularity override, for tests.
    pub fn with_tick(tick: Duration) -> Self {
        Scheduler {
            triggers: RwLock::new(HashMap::new()),
            tick,
            driver: std::sync::Mutex::new(None),
        }
    }

    pub fn add_cron(&self, flow_id: &str, node_id: &str, expr: &str, utc: bool) -> Result<()> {
        let spec = parse_schedule(expr, utc)?;
        self.add(flow_id, node_id, spec)
    }

    pub fn add_interval(&self, flow_id: &str, node_id: &str, every: Duration) -> Result<()> {
        self.add(flow_id, node_id, TriggerSpec::Interval { every })
    }

    fn add(&self, flow_id: &str, node_id: &str, spec: TriggerSpec) -> Result<()> {
        let mut triggers = self.triggers.write().expect("scheduler lock poisoned");
        let list = triggers.entry(flow_id.to_string()).or_default();
        if list
            .iter()
            .any(|t| t.spec.kind() == spec.kind() && t.spec.key() == spec.key())
        {
            return Err(RuntimeError::Validation(format!(
                "duplicate {} trigger for flow {flow_id}: {}",
                spec.kind(),
                spec.key()
            )));
        }
        list.push(Trigger {
            node_id: node_id.to_string(),
            spec,
        });
        Ok(())
    }

    pub fn remove_all(&self, flow_id: &str) {
        self.triggers
            .write()
            .expect("scheduler lock poisoned")
            .remove(flow_id);
    }

    pub fn trigger_count(&self, flow_id: &str) -> usize {
        self.triggers
            .read()
            .expect("scheduler lock poisoned")
            .get(flow_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Start the single driver task. Idempotent.
    pub fn start(self: &Arc<Self>, target: Arc<dyn TriggerTarget>) {
        let mut driver = self.driver.lock().expect("scheduler lock poisoned");
        if driver.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(self.clone(), target, cancel.clone(), self.tick));
        *driver = Some((handle, cancel));
        tracing::info!("scheduler started");
    }

    /// Stop scheduling new firings; in-flight firings complete.
    pub fn stop(&self) {
        if let Some((handle, cancel)) = self.driver.lock().expect("scheduler lock poisoned").take() {
            cancel.cancel();
            handle.abort();
            tracing::info!("scheduler stopped");
        }
    }

    fn snapshot(&self) -> Vec<(String, Trigger)> {
        let triggers = self.triggers.read().expect("scheduler lock poisoned");
        triggers
            .iter()
            .flat_map(|(flow_id, list)| list.iter().map(|t| (flow_id.clone(), t.clone())))
            .collect()
    }
}

fn next_cron_fire(expr: &str, utc: bool) -> Option<DateTime<Utc>> {
    let cron = Cron::new(expr).with_seconds_optional().parse().ok()?;
    if utc {
        cron.find_next_occurrence(&Utc::now(), false).ok()
    } else {
        cron.find_next_occurrence(&chrono::Local::now(), false)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

async fn drive(
    scheduler: Arc<Scheduler>,
    target: Arc<dyn TriggerTarget>,
    cancel: CancellationToken,
    tick: Duration,
) {
    // Driver-local fire times keyed by (flow, node, kind, key); triggers
    // added or removed between ticks are picked up from the snapshot.
    let mut due: HashMap<(String, String, &'static str, String), DateTime<Utc>> = HashMap::new();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let now = Utc::now();
        let snapshot = scheduler.snapshot();
        let live_keys: std::collections::HashSet<_> = snapshot
            .iter()
            .map(|(f, t)| (f.clone(), t.node_id.clone(), t.spec.kind(), t.spec.key()))
            .collect();
        due.retain(|k, _| live_keys.contains(k));

        for (flow_id, trigger) in snapshot {
            let key = (
                flow_id.clone(),
                trigger.node_id.clone(),
                trigger.spec.kind(),
                trigger.spec.key(),
            );
            let next = match due.get(&key) {
                Some(next) => *next,
                None => {
                    // Newly seen: schedule the first firing, do not fire now.
                    let first = match &trigger.spec {
                        TriggerSpec::Cron { expr, utc } => match next_cron_fire(expr, *utc) {
                            Some(t) => t,
                            None => continue,
                        },
                        TriggerSpec::Interval { every } => {
                            now + chrono::Duration::from_std(*every).unwrap_or_default()
                        }
                    };
                    due.insert(key, first);
                    continue;
                }
            };

            if now < next {
                continue;
            }

            let follow_up = match &trigger.spec {
                TriggerSpec::Cron { expr, utc } => next_cron_fire(expr, *utc),
                TriggerSpec::Interval { every } => {
                    Some(now + chrono::Duration::from_std(*every).unwrap_or_default())
                }
            };
            match follow_up {
                Some(t) => {
                    due.insert(key, t);
                }
                None => {
                    due.remove(&key);
                }
            }

            let target = target.clone();
            let node_id = trigger.node_id.clone();
            tokio::spawn(async move {
                target.fire(&flow_id, &node_id).await;
            });
        }
    }
}
