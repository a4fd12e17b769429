//! Felix Prometheus metrics scraping.
//!
//! Felix serves plain Prometheus text on each node. Tests read counters such
//! as `calico_denied_packets` straight from that endpoint to corroborate
//! what connectivity probes observe.

use crate::eventual::{assert_eventually, ConsistencyCategory, NotConverged};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Counter Felix increments for packets dropped by policy.
pub const DENIED_PACKETS: &str = "calico_denied_packets";

/// Metrics scraping errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Metrics endpoint {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Malformed metrics line: {0}")]
    Malformed(String),

    #[error(transparent)]
    NotConverged(#[from] NotConverged),
}

/// One sample from Prometheus text exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    fn matches(&self, name: &str, filters: &[(&str, &str)]) -> bool {
        self.name == name
            && filters
                .iter()
                .all(|(k, v)| self.labels.get(*k).map(String::as_str) == Some(*v))
    }
}

/// Parse Prometheus text exposition. Comment lines are skipped.
pub fn parse_samples(text: &str) -> Result<Vec<Sample>, MetricsError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<Sample, MetricsError> {
    let malformed = || MetricsError::Malformed(line.to_string());

    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}').filter(|c| *c > open).ok_or_else(malformed)?;
            let name = line.get(..open).ok_or_else(malformed)?;
            let body = line.get(open + 1..close).ok_or_else(malformed)?;
            let rest = line.get(close + 1..).ok_or_else(malformed)?;
            (name, parse_labels(body).ok_or_else(malformed)?, rest)
        }
        None => {
            let (name, rest) = line.split_once(char::is_whitespace).ok_or_else(malformed)?;
            (name, HashMap::new(), rest)
        }
    };

    // An optional timestamp may follow the value.
    let value = rest
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(malformed)?;

    Ok(Sample {
        name: name.trim().to_string(),
        labels,
        value,
    })
}

fn parse_labels(body: &str) -> Option<HashMap<String, String>> {
    let mut labels = HashMap::new();
    let mut chars = body.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(labels);
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if chars.next() != Some('"') {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()? {
                '\\' => match chars.next()? {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                '"' => break,
                c => value.push(c),
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
}

/// Reads a single node's Felix metrics endpoint.
pub struct MetricsScraper {
    url: String,
    http_client: Client,
}

impl MetricsScraper {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Scraper for Felix on the node with `host_ip`.
    pub fn for_node(host_ip: &str, port: u16) -> Self {
        Self::new(format!("http://{}:{}/metrics", host_ip, port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and parse every sample.
    pub async fn scrape(&self) -> Result<Vec<Sample>, MetricsError> {
        let response = self.http_client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(MetricsError::BadStatus {
                url: self.url.clone(),
                status: response.status().as_u16(),
            });
        }

        parse_samples(&response.text().await?)
    }

    /// Sum every sample of `name` whose labels include all of `filters`.
    pub async fn sum_counter(
        &self,
        name: &str,
        filters: &[(&str, &str)],
    ) -> Result<f64, MetricsError> {
        let total: f64 = self
            .scrape()
            .await?
            .iter()
            .filter(|s| s.matches(name, filters))
            .map(|s| s.value)
            .sum();
        debug!(target: "netpol.metrics", url = %self.url, metric = name, total, "Scraped counter");
        Ok(total)
    }

    /// Wait until the summed counter exceeds `threshold`.
    ///
    /// Scrape errors count as "not yet"; returns the last value seen.
    pub async fn wait_for_counter_above(
        &self,
        name: &str,
        filters: &[(&str, &str)],
        threshold: f64,
    ) -> Result<f64, MetricsError> {
        let last = std::sync::Mutex::new(None::<f64>);
        let seen = &last;

        assert_eventually(ConsistencyCategory::MetricsScrape, move || async move {
            match self.sum_counter(name, filters).await {
                Ok(value) => {
                    if let Ok(mut guard) = seen.lock() {
                        *guard = Some(value);
                    }
                    value > threshold
                }
                Err(e) => {
                    debug!(target: "netpol.metrics", error = %e, "Scrape failed, retrying");
                    false
                }
            }
        })
        .await?;

        let value = last.lock().ok().and_then(|guard| *guard).unwrap_or(threshold);
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const FELIX_TEXT: &str = r#"
# HELP calico_denied_packets Total number of packets denied by calico policies.
# TYPE calico_denied_packets gauge
calico_denied_packets{policy="profile|kns.netpol-e2e-a|0|deny",srcIP="10.0.1.7"} 3
calico_denied_packets{policy="default|netpol-e2e-a/deny-all|0|deny",srcIP="10.0.1.8"} 5 1700000000000
felix_active_local_policies 4
"#;

    #[test]
    fn test_parse_samples_skips_comments() {
        let samples = parse_samples(FELIX_TEXT).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].name, DENIED_PACKETS);
        assert_eq!(samples[0].labels["srcIP"], "10.0.1.7");
        assert_eq!(samples[1].value, 5.0);
        assert!(samples[2].labels.is_empty());
    }

    #[test]
    fn test_label_filtering() {
        let samples = parse_samples(FELIX_TEXT).unwrap();
        let total: f64 = samples
            .iter()
            .filter(|s| s.matches(DENIED_PACKETS, &[]))
            .map(|s| s.value)
            .sum();
        assert_eq!(total, 8.0);

        let filtered: Vec<_> = samples
            .iter()
            .filter(|s| s.matches(DENIED_PACKETS, &[("srcIP", "10.0.1.8")]))
            .collect();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, 5.0);
    }

    #[test]
    fn test_escaped_label_values() {
        let samples = parse_samples(r#"m{a="x\"y",b="1,2"} 1"#).unwrap();
        assert_eq!(samples[0].labels["a"], "x\"y");
        assert_eq!(samples[0].labels["b"], "1,2");
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(matches!(
            parse_samples("calico_denied_packets{policy=\"x\"} not-a-number"),
            Err(MetricsError::Malformed(_))
        ));
    }

    #[test]
    fn test_for_node_url() {
        let scraper = MetricsScraper::for_node("172.18.0.2", 9091);
        assert_eq!(scraper.url(), "http://172.18.0.2:9091/metrics");
    }
}
