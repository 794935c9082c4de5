use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::quota::types::{AlertSink, MeteringSink, UsageSummary};
use crate::storage::month_key;

/// Alert types for metered usage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CostAlertType {
    /// Usage is approaching the included monthly allowance
    AllowanceThreshold { used: u64, included: u64, percent: u64 },
    /// Usage has gone past the allowance and is billed as overage
    Overage { overage_tokens: u64, overage_cost: Decimal },
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Emergency => "emergency",
        }
    }
}

/// Usage alert notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAlert {
    pub id: String,
    pub org_id: String,
    pub billing_period: String,
    pub alert_type: CostAlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub suggested_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAlertConfig {
    pub enabled: bool,
    /// Tokens per month included before overage billing starts
    pub included_monthly_tokens: u64,
    pub warning_percent: u64,
    pub critical_percent: u64,
}

impl Default for CostAlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            included_monthly_tokens: 10_000_000,
            warning_percent: 80,
            critical_percent: 95,
        }
    }
}

const HISTORY_LIMIT: usize = 1000;

/// Threshold alerts over metered usage. Each org gets at most one alert per
/// billing period and severity.
pub struct QuotaAlerts {
    config: CostAlertConfig,
    metering: Arc<dyn MeteringSink>,
    alert_sender: mpsc::UnboundedSender<CostAlert>,
    sent: Mutex<HashSet<(String, String, AlertSeverity)>>,
    alert_history: Mutex<Vec<CostAlert>>,
}

impl QuotaAlerts {
    pub fn new(
        config: CostAlertConfig,
        metering: Arc<dyn MeteringSink>,
    ) -> (Self, mpsc::UnboundedReceiver<CostAlert>) {
        let (alert_sender, alert_receiver) = mpsc::unbounded_channel();

        let alerts = Self {
            config,
            metering,
            alert_sender,
            sent: Mutex::new(HashSet::new()),
            alert_history: Mutex::new(Vec::new()),
        };

        (alerts, alert_receiver)
    }

    /// Alerts `summary` warrants that have not been raised yet this period.
    pub fn check_summary(&self, summary: &UsageSummary) -> Vec<CostAlert> {
        if !self.config.enabled || self.config.included_monthly_tokens == 0 {
            return Vec::new();
        }

        let included = self.config.included_monthly_tokens;
        let percent = summary.total_tokens.saturating_mul(100) / included;
        let now = Utc::now();
        let mut alerts = Vec::new();

        let candidates = [
            (AlertSeverity::Warning, self.config.warning_percent),
            (AlertSeverity::Critical, self.config.critical_percent),
        ];
        for (severity, threshold) in candidates {
            if percent < threshold || !self.mark_sent(summary, severity) {
                continue;
            }
            alerts.push(CostAlert {
                id: uuid::Uuid::new_v4().to_string(),
                org_id: summary.org_id.clone(),
                billing_period: summary.period.clone(),
                alert_type: CostAlertType::AllowanceThreshold {
                    used: summary.total_tokens,
                    included,
                    percent,
                },
                severity,
                message: format!(
                    "{} has used {}% of its {} included tokens for {}",
                    summary.org_id, percent, included, summary.period
                ),
                timestamp: now,
                acknowledged: false,
                suggested_action: Some("Review usage or enable overage billing".to_string()),
            });
        }

        if summary.overage_tokens > 0 && self.mark_sent(summary, AlertSeverity::Emergency) {
            alerts.push(CostAlert {
                id: uuid::Uuid::new_v4().to_string(),
                org_id: summary.org_id.clone(),
                billing_period: summary.period.clone(),
                alert_type: CostAlertType::Overage {
                    overage_tokens: summary.overage_tokens,
                    overage_cost: summary.overage_cost,
                },
                severity: AlertSeverity::Emergency,
                message: format!(
                    "{} is billing overage: {} tokens, ${:.2} so far in {}",
                    summary.org_id, summary.overage_tokens, summary.overage_cost, summary.period
                ),
                timestamp: now,
                acknowledged: false,
                suggested_action: Some("Consider upgrading the plan".to_string()),
            });
        }

        alerts
    }

    /// Also forgets alerts from billing periods before the current month.
    fn mark_sent(&self, summary: &UsageSummary, severity: AlertSeverity) -> bool {
        let current = month_key(Utc::now());
        let mut sent = self.sent.lock();
        sent.retain(|(_, period, _)| *period >= current);
        sent.insert((summary.org_id.clone(), summary.period.clone(), severity))
    }

    pub fn get_recent_alerts(&self, limit: Option<usize>) -> Vec<CostAlert> {
        let limit = limit.unwrap_or(50);
        self.alert_history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) {
        if let Some(alert) = self.alert_history.lock().iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
            info!("Acknowledged usage alert: {}", alert_id);
        }
    }

    pub fn get_config(&self) -> &CostAlertConfig {
        &self.config
    }
}

#[async_trait]
impl AlertSink for QuotaAlerts {
    async fn send_alert_notifications(&self, org_id: &str) -> Result<()> {
        let summary = self.metering.usage_summary(org_id).await?;
        let alerts = self.check_summary(&summary);

        for alert in &alerts {
            warn!("[{}] {}", alert.severity.as_str(), alert.message);
            if let Err(e) = self.alert_sender.send(alert.clone()) {
                error!("Failed to send usage alert: {}", e);
            } else {
                debug!("Sent usage alert: {:?}", alert.alert_type);
            }
        }

        let mut history = self.alert_history.lock();
        history.extend(alerts);
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_LIMIT;
            history.drain(0..excess);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryMeter;

    fn alerts_with(meter: Arc<InMemoryMeter>) -> (QuotaAlerts, mpsc::UnboundedReceiver<CostAlert>) {
        let config = CostAlertConfig {
            included_monthly_tokens: 1_000,
            ..CostAlertConfig::default()
        };
        QuotaAlerts::new(config, meter)
    }

    #[tokio::test]
    async fn test_below_threshold_sends_nothing() {
        let meter = Arc::new(InMemoryMeter::new(1_000, Decimal::from(10)));
        let (alerts, mut rx) = alerts_with(meter.clone());

        meter.track_tokens("acme", 500).await.unwrap();
        alerts.send_alert_notifications("acme").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_thresholds_fire_once_per_period() {
        let meter = Arc::new(InMemoryMeter::new(1_000, Decimal::from(10)));
        let (alerts, mut rx) = alerts_with(meter.clone());

        meter.track_tokens("acme", 850).await.unwrap();
        alerts.send_alert_notifications("acme").await.unwrap();
        assert_eq!(rx.try_recv().unwrap().severity, AlertSeverity::Warning);

        alerts.send_alert_notifications("acme").await.unwrap();
        assert!(rx.try_recv().is_err());

        meter.track_tokens("acme", 250).await.unwrap();
        alerts.send_alert_notifications("acme").await.unwrap();
        assert_eq!(rx.try_recv().unwrap().severity, AlertSeverity::Critical);
        let overage = rx.try_recv().unwrap();
        assert_eq!(overage.severity, AlertSeverity::Emergency);
        assert!(matches!(overage.alert_type, CostAlertType::Overage { overage_tokens: 100, .. }));

        assert_eq!(alerts.get_recent_alerts(None).len(), 3);
    }

    #[test]
    fn test_past_periods_are_forgotten() {
        let meter = Arc::new(InMemoryMeter::new(1_000, Decimal::from(10)));
        let (alerts, _rx) = alerts_with(meter);
        let summary = |period: &str| UsageSummary {
            org_id: "acme".to_string(),
            period: period.to_string(),
            total_tokens: 900,
            ..UsageSummary::default()
        };

        assert_eq!(alerts.check_summary(&summary("2001-01")).len(), 1);
        assert_eq!(alerts.check_summary(&summary("2001-02")).len(), 1);
        assert_eq!(alerts.sent.lock().len(), 1);

        assert_eq!(alerts.check_summary(&summary(&month_key(Utc::now()))).len(), 1);
        let sent = alerts.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent.iter().all(|(_, period, _)| *period == month_key(Utc::now())));
    }

    #[tokio::test]
    async fn test_acknowledge_marks_history() {
        let meter = Arc::new(InMemoryMeter::new(1_000, Decimal::from(10)));
        let (alerts, _rx) = alerts_with(meter.clone());

        meter.track_tokens("acme", 990).await.unwrap();
        alerts.send_alert_notifications("acme").await.unwrap();

        let id = alerts.get_recent_alerts(Some(1))[0].id.clone();
        alerts.acknowledge_alert(&id);
        assert!(alerts.get_recent_alerts(Some(1))[0].acknowledged);
    }
}
