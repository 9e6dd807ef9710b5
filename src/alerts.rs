use crate::rules::{AlertRule, CompareOp, RuleSnapshotStore};
use crate::telemetry::Reading;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// One fired rule evaluation, persisted by the alert log batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertLogRecord {
    pub rule_id: i64,
    pub device_id: i64,
    pub device_uid: String,
    pub user_id: i64,
    pub input_name: String,
    pub triggered_value: f64,
    pub condition: CompareOp,
    pub threshold: f64,
    /// Channels the rule has enabled. Nothing is delivered from here.
    pub notify_email: bool,
    pub notify_whatsapp: bool,
    pub notify_sms: bool,
    pub action_taken: bool,
    pub triggered_at: DateTime<Utc>,
}

impl AlertLogRecord {
    fn fired(rule: &AlertRule, value: f64, at: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id,
            device_id: rule.device_id,
            device_uid: rule.device_uid.clone(),
            user_id: rule.user_id,
            input_name: rule.input_name.clone(),
            triggered_value: value,
            condition: rule.op,
            threshold: rule.threshold,
            notify_email: rule.notify_email,
            notify_whatsapp: rule.notify_whatsapp,
            notify_sms: rule.notify_sms,
            action_taken: false,
            triggered_at: at,
        }
    }
}

/// Last-fired time per rule id. Memory only.
#[derive(Debug, Default)]
pub struct Cooldowns {
    last_fired: HashMap<i64, DateTime<Utc>>,
}

impl Cooldowns {
    pub fn ready(&self, rule_id: i64, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_fired.get(&rule_id) {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(*last);
                elapsed >= chrono::Duration::zero() && elapsed >= interval
            }
        }
    }

    /// Never moves a rule's last-fired time backwards.
    pub fn mark(&mut self, rule_id: i64, now: DateTime<Utc>) {
        let entry = self.last_fired.entry(rule_id).or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }

    #[cfg(test)]
    pub fn last_fired(&self, rule_id: i64) -> Option<DateTime<Utc>> {
        self.last_fired.get(&rule_id).copied()
    }
}

pub struct AlertEvaluator {
    rules: Arc<RuleSnapshotStore>,
    cooldowns: Cooldowns,
}

impl AlertEvaluator {
    pub fn new(rules: Arc<RuleSnapshotStore>) -> Self {
        Self {
            rules,
            cooldowns: Cooldowns::default(),
        }
    }

    #[cfg(test)]
    pub fn cooldowns(&self) -> &Cooldowns {
        &self.cooldowns
    }

    pub fn evaluate(&mut self, reading: &Reading, now: DateTime<Utc>) -> Vec<AlertLogRecord> {
        let snapshot = self.rules.snapshot();
        let mut fired = Vec::new();
        for rule in snapshot.rules_for(&reading.device_id) {
            let Some(value) = reading.channels.get(rule.channel) else {
                continue;
            };
            if !rule.op.compare(value, rule.threshold) {
                continue;
            }
            if !self.cooldowns.ready(rule.id, rule.interval, now) {
                tracing::trace!(rule_id = rule.id, device = %reading.device_id, "alert rule cooling down");
                continue;
            }
            self.cooldowns.mark(rule.id, now);
            tracing::info!(
                rule_id = rule.id,
                device = %reading.device_id,
                device_name = rule.device_name.as_deref().unwrap_or(""),
                channel = %rule.input_name,
                condition = rule.op.as_str(),
                threshold = rule.threshold,
                value,
                "alert triggered"
            );
            fired.push(AlertLogRecord::fired(rule, value, now));
        }
        fired
    }
}
