use chrono::NaiveDate;
use hwatch_adapters::{
    cases_extraction, parse_published_date, surveys_extraction, ExtractionDescriptor,
};
use hwatch_core::TableSpec;
use hwatch_notify::{FieldSpec, FieldValue, MessageTemplate};

use crate::metrics::MetricsPolicy;

const USERNAME: &str = "GT Stamps Health Services";
const AVATAR_URL: &str = "https://img.aditya.diwakar.io/stamps.png";
const EMBED_COLOR: u32 = 11772777;
const FOOTER: &str = "Made with ❤️ by Aditya Diwakar";
const DISPLAY_DATE_FORMAT: &str = "%B %-d, %Y";

/// Everything that differs between watched pages: where to fetch, how to
/// extract, where to persist, and how to announce.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub url: String,
    pub marker_key: String,
    /// Path segment under `/gt-jpj/` in the read API.
    pub api_path: String,
    pub extraction: ExtractionDescriptor,
    pub table: TableSpec,
    pub template: MessageTemplate,
    pub metrics: MetricsPolicy,
    pub chart_counters: Vec<String>,
}

impl SourceDescriptor {
    /// Marker values are stored in the page's own date style, e.g. `March 5, 2021`.
    pub fn format_marker(&self, date: NaiveDate) -> String {
        date.format(&self.template.date_display_format).to_string()
    }

    /// Accepts the page's date formats and ISO `YYYY-MM-DD`.
    pub fn parse_marker(&self, raw: &str) -> Option<NaiveDate> {
        let mut formats = self.extraction.date_formats.clone();
        formats.push("%Y-%m-%d".to_string());
        parse_published_date(raw, &formats)
    }
}

fn template(title: &str, url: &str, fields: Vec<FieldSpec>) -> MessageTemplate {
    MessageTemplate {
        username: USERNAME.to_string(),
        avatar_url: AVATAR_URL.to_string(),
        title: title.to_string(),
        url: Some(url.to_string()),
        color: Some(EMBED_COLOR),
        footer: Some(FOOTER.to_string()),
        date_display_format: DISPLAY_DATE_FORMAT.to_string(),
        fields,
    }
}

pub fn cases_source() -> SourceDescriptor {
    let url = "https://health.gatech.edu/coronavirus/health-alerts";
    SourceDescriptor {
        id: "cases".to_string(),
        display_name: "GT COVID-19".to_string(),
        url: url.to_string(),
        marker_key: "gt.cases.lastdate".to_string(),
        api_path: "cases".to_string(),
        extraction: cases_extraction(),
        table: TableSpec::new("cases", &["reported", "total"]),
        template: template(
            "[{date}] GT COVID-19 Update",
            url,
            vec![
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
        ),
        metrics: MetricsPolicy {
            rolling_counter: Some("reported".to_string()),
            windows: vec![7, 30],
        },
        chart_counters: vec!["reported".to_string()],
    }
}

pub fn surveys_source() -> SourceDescriptor {
    let url = "https://health.gatech.edu/surveillance-testing-program-results";
    SourceDescriptor {
        id: "surveys".to_string(),
        display_name: "Surveillance Testing Program".to_string(),
        url: url.to_string(),
        marker_key: "gt.survey.lastdate".to_string(),
        api_path: "testing".to_string(),
        extraction: surveys_extraction(),
        table: TableSpec::new("surveys", &["positive", "administered"]),
        template: template(
            "[{date}] Surveillance Testing Program Results",
            url,
            vec![
                FieldSpec::new(
                    "Tested Positive (All Time)",
                    FieldValue::CounterWithDelta("positive".into()),
                ),
                FieldSpec::new(
                    "Tests Administered",
                    FieldValue::CounterWithDelta("administered".into()),
                ),
            ],
        ),
        metrics: MetricsPolicy::default(),
        chart_counters: vec!["positive".to_string(), "administered".to_string()],
    }
}

pub fn builtin_sources() -> Vec<SourceDescriptor> {
    vec![cases_source(), surveys_source()]
}

pub fn source_for_id(source_id: &str) -> Option<SourceDescriptor> {
    match source_id {
        "cases" => Some(cases_source()),
        "surveys" => Some(surveys_source()),
        _ => None,
    }
}
