//! Webhook notification rendering and per-target fan-out delivery.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use hwatch_core::{Report, ReportMetrics};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hwatch-notify";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub username: String,
    pub avatar_url: String,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<Footer>,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// How a message field derives its value from a report and its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Raw counter value, e.g. `1000`.
    Counter(String),
    /// Counter with separators and signed delta, e.g. `1,234 (+12)`.
    CounterWithDelta(String),
    /// Rolling means of one counter, e.g. `12.3/10.1`. Only windows with a
    /// defined mean are listed; the field is dropped when none are.
    MovingAverage { counter: String, windows: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field label. For moving averages this is the suffix after the
    /// window list, e.g. `Day Moving Average`.
    pub name: String,
    pub value: FieldValue,
}

impl FieldSpec {
    pub fn new(name: &str, value: FieldValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub username: String,
    pub avatar_url: String,
    /// `{date}` and `{source}` are substituted.
    pub title: String,
    pub url: Option<String>,
    pub color: Option<u32>,
    pub footer: Option<String>,
    pub date_display_format: String,
    pub fields: Vec<FieldSpec>,
}

impl MessageTemplate {
    pub fn render(
        &self,
        source_name: &str,
        report: &Report,
        metrics: &ReportMetrics,
    ) -> WebhookMessage {
        let date = report.date.format(&self.date_display_format).to_string();
        let title = self
            .title
            .replace("{date}", &date)
            .replace("{source}", source_name);
        let fields = self
            .fields
            .iter()
            .filter_map(|spec| render_field(spec, report, metrics))
            .collect();

        WebhookMessage {
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
            embeds: vec![Embed {
                title,
                url: self.url.clone(),
                color: self.color,
                footer: self.footer.clone().map(|text| Footer { text }),
                fields,
            }],
        }
    }
}

fn render_field(spec: &FieldSpec, report: &Report, metrics: &ReportMetrics) -> Option<EmbedField> {
    let (name, value) = match &spec.value {
        FieldValue::Counter(counter) => (spec.name.clone(), report.counter(counter)?.to_string()),
        FieldValue::CounterWithDelta(counter) => {
            let value = format_count(report.counter(counter)?);
            let value = match metrics.delta(counter) {
                Some(delta) => format!("{value} ({})", format_delta(delta)),
                None => value,
            };
            (spec.name.clone(), value)
        }
        FieldValue::MovingAverage { counter, windows } => {
            let defined = windows
                .iter()
                .filter_map(|w| metrics.rolling_mean(counter, *w).map(|mean| (*w, mean)))
                .collect::<Vec<_>>();
            if defined.is_empty() {
                return None;
            }
            let label = defined
                .iter()
                .map(|(w, _)| w.to_string())
                .collect::<Vec<_>>()
                .join("/");
            let value = defined
                .iter()
                .map(|(_, mean)| format!("{mean:.1}"))
                .collect::<Vec<_>>()
                .join("/");
            (format!("{label} {}", spec.name), value)
        }
    };
    Some(EmbedField {
        name,
        value,
        inline: true,
    })
}

/// English thousands grouping: `1234567` -> `1,234,567`.
pub fn format_count(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Positive deltas carry an explicit `+`.
pub fn format_delta(delta: i64) -> String {
    if delta > 0 {
        format!("+{}", format_count(delta))
    } else {
        format_count(delta)
    }
}

/// Externally configured webhook endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub url: String,
}

impl NotificationTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Scheme and host only; webhook paths embed credentials.
    pub fn redacted(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => format!("{}://{}", url.scheme(), url.host_str().unwrap_or("?")),
            Err(_) => "<invalid url>".to_string(),
        }
    }
}

impl fmt::Display for NotificationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("target responded with http status {status}")]
    HttpStatus { status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        target: &NotificationTarget,
        message: &WebhookMessage,
    ) -> Result<(), DeliveryError>;
}

/// POSTs the message as JSON. Each delivery is bounded by its own timeout so
/// one slow target cannot hold up the rest.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(
        &self,
        target: &NotificationTarget,
        message: &WebhookMessage,
    ) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&target.url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub target: NotificationTarget,
    pub result: Result<(), DeliveryError>,
}

#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }
}

/// Deliver to every target in order. A failing target is logged and
/// skipped; it never prevents delivery to the others.
pub async fn fan_out(
    notifier: &dyn Notifier,
    targets: &[NotificationTarget],
    message: &WebhookMessage,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for target in targets {
        let result = notifier.deliver(target, message).await;
        match &result {
            Ok(()) => info!(webhook = %target, "notification delivered"),
            Err(err) => warn!(webhook = %target, error = %err, "notification delivery failed"),
        }
        report.outcomes.push(DeliveryOutcome {
            target: target.clone(),
            result,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::NaiveDate;
    use hwatch_core::RollingMean;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    type Received = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    fn cases_template() -> MessageTemplate {
        MessageTemplate {
            username: "GT Stamps Health Services".into(),
            avatar_url: "https://img.example.org/stamps.png".into(),
            title: "[{date}] GT COVID-19 Update".into(),
            url: Some("https://health.gatech.edu/coronavirus/health-alerts".into()),
            color: Some(11772777),
            footer: Some("Stamps Health Watch".into()),
            date_display_format: "%B %-d, %Y".into(),
            fields: vec![
                FieldSpec::new("Reported Today", FieldValue::Counter("reported".into())),
                FieldSpec::new("Total", FieldValue::Counter("total".into())),
                FieldSpec::new(
                    "Day Moving Average",
                    FieldValue::MovingAverage {
                        counter: "reported".into(),
                        windows: vec![7, 30],
                    },
                ),
            ],
        }
    }

    fn report() -> Report {
        Report::new("cases", NaiveDate::from_ymd_opt(2021, 3, 5).unwrap())
            .with_counter("reported", 15)
            .with_counter("total", 1000)
    }

    fn means(seven: Option<f64>, thirty: Option<f64>) -> ReportMetrics {
        ReportMetrics {
            deltas: BTreeMap::new(),
            rolling_means: vec![
                RollingMean {
                    counter: "reported".into(),
                    window: 7,
                    value: seven,
                },
                RollingMean {
                    counter: "reported".into(),
                    window: 30,
                    value: thirty,
                },
            ],
        }
    }

    fn field<'a>(message: &'a WebhookMessage, name: &str) -> Option<&'a str> {
        message.embeds[0]
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    async fn spawn_receiver() -> (String, Received) {
        async fn record(
            State(received): State<Received>,
            Path(id): Path<String>,
            Json(body): Json<serde_json::Value>,
        ) -> StatusCode {
            received.lock().await.push((id.clone(), body));
            if id == "broken" {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::NO_CONTENT
            }
        }

        let received: Received = Arc::default();
        let app = Router::new()
            .route("/hook/{id}", post(record))
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), received)
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/hook/gone")
    }

    #[test]
    fn renders_title_and_plain_counter_fields() {
        let message = cases_template().render("GT COVID-19", &report(), &means(Some(12.34), Some(10.06)));
        let embed = &message.embeds[0];
        assert_eq!(embed.title, "[March 5, 2021] GT COVID-19 Update");
        assert_eq!(field(&message, "Reported Today"), Some("15"));
        assert_eq!(field(&message, "Total"), Some("1000"));
        assert_eq!(field(&message, "7/30 Day Moving Average"), Some("12.3/10.1"));
        assert_eq!(embed.footer.as_ref().map(|f| f.text.as_str()), Some("Stamps Health Watch"));
    }

    #[test]
    fn undefined_windows_are_omitted_not_shortened() {
        let only_seven = cases_template().render("GT", &report(), &means(Some(40.0), None));
        assert_eq!(field(&only_seven, "7 Day Moving Average"), Some("40.0"));
        assert_eq!(field(&only_seven, "7/30 Day Moving Average"), None);

        let none = cases_template().render("GT", &report(), &means(None, None));
        assert_eq!(none.embeds[0].fields.len(), 2);
    }

    #[test]
    fn counter_with_delta_uses_separators_and_sign() {
        let mut template = cases_template();
        template.fields = vec![FieldSpec::new(
            "Total",
            FieldValue::CounterWithDelta("total".into()),
        )];
        let mut metrics = ReportMetrics::default();
        metrics.deltas.insert("total".into(), 12);
        let with_delta = template.render("GT", &report().with_counter("total", 1234), &metrics);
        assert_eq!(field(&with_delta, "Total"), Some("1,234 (+12)"));

        let first_run = template.render("GT", &report(), &ReportMetrics::default());
        assert_eq!(field(&first_run, "Total"), Some("1,000"));
    }

    #[test]
    fn count_and_delta_formatting() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
        assert_eq!(format_count(-4321), "-4,321");
        assert_eq!(format_delta(15), "+15");
        assert_eq!(format_delta(0), "0");
        assert_eq!(format_delta(-1200), "-1,200");
    }

    #[test]
    fn payload_matches_webhook_shape() {
        let message = cases_template().render("GT", &report(), &ReportMetrics::default());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["username"], "GT Stamps Health Services");
        assert_eq!(json["embeds"][0]["color"], 11772777);
        assert_eq!(json["embeds"][0]["footer"]["text"], "Stamps Health Watch");
        assert_eq!(json["embeds"][0]["fields"][0]["inline"], true);
    }

    #[test]
    fn redaction_keeps_only_scheme_and_host() {
        let target = NotificationTarget::new("https://discord.com/api/webhooks/123/secret-token");
        assert_eq!(target.redacted(), "https://discord.com");
        assert_eq!(NotificationTarget::new("not a url").redacted(), "<invalid url>");
    }

    #[tokio::test]
    async fn refused_target_does_not_block_siblings() {
        let (base, received) = spawn_receiver().await;
        let targets = vec![
            NotificationTarget::new(format!("{base}/hook/one")),
            NotificationTarget::new(refused_url().await),
            NotificationTarget::new(format!("{base}/hook/three")),
        ];
        let message = cases_template().render("GT", &report(), &ReportMetrics::default());
        let notifier = WebhookNotifier::new(Duration::from_secs(5));

        let report = fan_out(&notifier, &targets, &message).await;

        assert_eq!(report.delivered(), 2);
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.outcomes[1].result, Err(DeliveryError::Request(_))));
        let received = received.lock().await;
        let ids = received.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["one", "three"]);
        assert_eq!(received[0].1["embeds"][0]["fields"][0]["value"], "15");
    }

    #[tokio::test]
    async fn non_success_response_is_a_delivery_error() {
        let (base, received) = spawn_receiver().await;
        let targets = vec![NotificationTarget::new(format!("{base}/hook/broken"))];
        let message = cases_template().render("GT", &report(), &ReportMetrics::default());
        let notifier = WebhookNotifier::new(Duration::from_secs(5));

        let report = fan_out(&notifier, &targets, &message).await;

        assert!(matches!(
            report.outcomes[0].result,
            Err(DeliveryError::HttpStatus { status: 500 })
        ));
        assert_eq!(received.lock().await.len(), 1);
    }
}
