use crate::store::RuleSource;
use crate::telemetry::Channel;
use anyhow::Result;
use arc_swap::ArcSwap;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl CompareOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            "==" => Some(Self::Eq),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
        }
    }

    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            // Exact IEEE equality. Sensor readings rarely land exactly on the
            // threshold, so `==` rules will almost never fire.
            Self::Eq => value == threshold,
        }
    }
}

/// One enabled rule joined with its device, as loaded from the store.
#[derive(Debug, Clone, FromRow)]
pub struct AlertRuleRow {
    pub id: i64,
    pub device_id: i64,
    pub device_uid: String,
    pub device_name: Option<String>,
    pub user_id: i64,
    pub threshold_type: Option<String>,
    pub condition: Option<String>,
    pub threshold_value: Option<f64>,
    pub interval_minutes: Option<i32>,
    pub notify_email: Option<bool>,
    pub notify_whatsapp: Option<bool>,
    pub notify_sms: Option<bool>,
}

impl AlertRuleRow {
    pub fn into_rule(self, default_interval_minutes: u32) -> Result<AlertRule, String> {
        let input_name = self
            .threshold_type
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "missing threshold_type".to_string())?;
        let channel = Channel::resolve(&input_name)
            .ok_or_else(|| format!("unknown threshold channel {input_name:?}"))?;
        let raw_condition = self.condition.unwrap_or_default();
        let op = CompareOp::parse(&raw_condition)
            .ok_or_else(|| format!("unknown condition {raw_condition:?}"))?;
        let threshold = self
            .threshold_value
            .filter(|value| value.is_finite())
            .ok_or_else(|| "threshold_value must be a finite number".to_string())?;
        let interval_minutes = match self.interval_minutes {
            Some(minutes) if minutes > 0 => minutes as u32,
            _ => default_interval_minutes,
        };

        Ok(AlertRule {
            id: self.id,
            device_id: self.device_id,
            device_uid: self.device_uid,
            device_name: self.device_name,
            user_id: self.user_id,
            input_name,
            channel,
            op,
            threshold,
            interval: chrono::Duration::minutes(i64::from(interval_minutes)),
            notify_email: self.notify_email.unwrap_or(false),
            notify_whatsapp: self.notify_whatsapp.unwrap_or(false),
            notify_sms: self.notify_sms.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: i64,
    pub device_id: i64,
    pub device_uid: String,
    pub device_name: Option<String>,
    pub user_id: i64,
    /// Threshold channel name as configured; copied into the alert log.
    pub input_name: String,
    pub channel: Channel,
    pub op: CompareOp,
    pub threshold: f64,
    pub interval: chrono::Duration,
    pub notify_email: bool,
    pub notify_whatsapp: bool,
    pub notify_sms: bool,
}

#[derive(Debug, Default)]
pub struct RuleSnapshot {
    by_device: HashMap<String, Vec<AlertRule>>,
}

impl RuleSnapshot {
    pub fn from_rules(rules: impl IntoIterator<Item = AlertRule>) -> Self {
        let mut by_device: HashMap<String, Vec<AlertRule>> = HashMap::new();
        for rule in rules {
            by_device
                .entry(rule.device_uid.clone())
                .or_default()
                .push(rule);
        }
        Self { by_device }
    }

    pub fn rules_for(&self, device_uid: &str) -> &[AlertRule] {
        self.by_device
            .get(device_uid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn device_count(&self) -> usize {
        self.by_device.len()
    }

    pub fn rule_count(&self) -> usize {
        self.by_device.values().map(Vec::len).sum()
    }
}

/// Device → enabled rules, reloaded wholesale from the store. Readers get the
/// current snapshot without waiting on a refresh in progress.
pub struct RuleSnapshotStore {
    current: ArcSwap<RuleSnapshot>,
    source: Arc<dyn RuleSource>,
    default_interval_minutes: u32,
}

impl RuleSnapshotStore {
    pub fn new(source: Arc<dyn RuleSource>, default_interval_minutes: u32) -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::default()),
            source,
            default_interval_minutes,
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    /// Replaces the snapshot with a fresh load. On error the previous snapshot
    /// stays in place.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self.source.load_enabled_rules().await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id = row.id;
            match row.into_rule(self.default_interval_minutes) {
                Ok(rule) => rules.push(rule),
                Err(err) => tracing::warn!(rule_id, error = %err, "skipping alert rule"),
            }
        }
        let snapshot = RuleSnapshot::from_rules(rules);
        tracing::debug!(
            devices = snapshot.device_count(),
            rules = snapshot.rule_count(),
            "alert rule snapshot reloaded"
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    pub fn spawn_refresher(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately and startup already loaded once.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            tracing::warn!(error = %err, "alert rule refresh failed; keeping previous snapshot");
                        }
                    }
                }
            }
        })
    }
}
