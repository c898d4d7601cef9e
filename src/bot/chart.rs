//! Usage charts rendered to PNG by a Chart.js rendering service.
//!
//! The service (QuickChart or a self-hosted instance) takes a Chart.js
//! config and returns image bytes; nothing touches the filesystem.

use chrono::{Duration, NaiveDate};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Periods offered on the chart keyboard, in days.
pub const CHART_PERIODS: [u32; 3] = [7, 30, 90];

pub struct ChartRenderer {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug)]
pub enum ChartError {
    Http(String),
    Api(String),
    NotPng,
}

impl std::fmt::Display for ChartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChartError::Http(e) => write!(f, "chart HTTP error: {e}"),
            ChartError::Api(e) => write!(f, "chart service error: {e}"),
            ChartError::NotPng => write!(f, "chart service did not return a PNG"),
        }
    }
}

impl std::error::Error for ChartError {}

/// One bar in the chart.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPoint {
    pub day: NaiveDate,
    pub count: u64,
}

/// Exactly `days` points ending at `today`, zero-filled where there is no data.
pub fn daily_series(counts: &BTreeMap<NaiveDate, u64>, days: u32, today: NaiveDate) -> Vec<DailyPoint> {
    let days = days.max(1) as i64;
    (0..days)
        .rev()
        .map(|back| {
            let day = today - Duration::days(back);
            DailyPoint { day, count: counts.get(&day).copied().unwrap_or(0) }
        })
        .collect()
}

/// Chart.js bar chart request body.
pub fn chart_spec(series: &[DailyPoint], title: &str) -> Value {
    let labels: Vec<String> = series.iter().map(|p| p.day.format("%m-%d").to_string()).collect();
    let data: Vec<u64> = series.iter().map(|p| p.count).collect();

    json!({
        "width": 800,
        "height": 400,
        "format": "png",
        "backgroundColor": "white",
        "chart": {
            "type": "bar",
            "data": {
                "labels": labels,
                "datasets": [{
                    "label": "requests",
                    "data": data,
                    "backgroundColor": "rgba(66, 133, 244, 0.8)"
                }]
            },
            "options": {
                "plugins": {
                    "title": { "display": true, "text": title },
                    "legend": { "display": false }
                },
                "scales": {
                    "y": { "beginAtZero": true, "ticks": { "precision": 0 } }
                }
            }
        }
    })
}

impl ChartRenderer {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { endpoint, client }
    }

    /// Render a chart spec to PNG bytes.
    pub async fn render(&self, spec: &Value) -> Result<Vec<u8>, ChartError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(spec)
            .send()
            .await
            .map_err(|e| ChartError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(ChartError::Api(format!("{status}: {preview}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChartError::Http(e.to_string()))?;
        debug!("Chart service returned {} bytes", bytes.len());

        if !bytes.starts_with(PNG_SIGNATURE) {
            return Err(ChartError::NotPng);
        }

        info!("📊 Chart rendered ({} bytes)", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_daily_series_zero_fills() {
        let mut counts = BTreeMap::new();
        counts.insert(date(2026, 3, 5), 4);
        counts.insert(date(2026, 3, 7), 1);
        // Outside the window, must be ignored.
        counts.insert(date(2026, 2, 1), 99);

        let series = daily_series(&counts, 7, date(2026, 3, 7));
        assert_eq!(series.len(), 7);
        assert_eq!(series.first().unwrap().day, date(2026, 3, 1));
        assert_eq!(series.last().unwrap(), &DailyPoint { day: date(2026, 3, 7), count: 1 });
        assert_eq!(series.iter().map(|p| p.count).sum::<u64>(), 5);
    }

    #[test]
    fn test_daily_series_crosses_month() {
        let series = daily_series(&BTreeMap::new(), 3, date(2026, 3, 1));
        let days: Vec<NaiveDate> = series.iter().map(|p| p.day).collect();
        assert_eq!(days, vec![date(2026, 2, 27), date(2026, 2, 28), date(2026, 3, 1)]);
    }

    #[test]
    fn test_daily_series_zero_days_yields_today() {
        let series = daily_series(&BTreeMap::new(), 0, date(2026, 3, 1));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_chart_spec_shape() {
        let series = vec![
            DailyPoint { day: date(2026, 3, 1), count: 2 },
            DailyPoint { day: date(2026, 3, 2), count: 0 },
        ];
        let spec = chart_spec(&series, "Last 2 days");
        assert_eq!(spec["format"], "png");
        assert_eq!(spec["chart"]["type"], "bar");
        assert_eq!(spec["chart"]["data"]["labels"], json!(["03-01", "03-02"]));
        assert_eq!(spec["chart"]["data"]["datasets"][0]["data"], json!([2, 0]));
        assert_eq!(spec["chart"]["options"]["plugins"]["title"]["text"], "Last 2 days");
    }
}
