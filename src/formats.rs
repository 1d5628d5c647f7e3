use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use anyhow::Result;
use itertools::Itertools;
use lazy_static::lazy_static;

use crate::core::Report;

pub const RUN_VERSION: &str = "codefang.run.v1";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid unified model: {0}")]
    InvalidUnifiedModel(String),
    #[error("binary envelope count: expected 1, found {0}")]
    BinaryEnvelopeCount(usize),
    #[error("invalid input format: {0}")]
    InvalidInputFormat(String),
}

/// Serialization formats recognized by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
pub enum Format {
    #[strum(serialize = "json")]
    Json,
    #[strum(serialize = "yaml")]
    Yaml,
    #[strum(serialize = "bin", serialize = "binary", to_string = "binary")]
    Binary,
    #[strum(serialize = "text")]
    Text,
    #[strum(serialize = "compact")]
    Compact,
    #[strum(serialize = "plot")]
    Plot,
    #[strum(serialize = "timeseries")]
    TimeSeries,
    #[strum(serialize = "timeseries-ndjson")]
    TimeSeriesNdjson,
}

impl Format {
    pub fn resolve(name: &str) -> Result<Self, FormatError> {
        Format::from_str(name).map_err(|_| FormatError::UnsupportedFormat(name.to_string()))
    }
}

/// The canonical cross-format model: one record per analyzer run.
#[derive(Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct UnifiedModel {
    pub version: String,
    pub analyzers: Vec<UnifiedAnalyzer>,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct UnifiedAnalyzer {
    pub id: String,
    pub mode: String,
    pub report: Report,
}

impl UnifiedModel {
    pub fn new(analyzers: Vec<UnifiedAnalyzer>) -> Self {
        Self { version: RUN_VERSION.to_string(), analyzers }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.version != RUN_VERSION {
            return Err(FormatError::InvalidUnifiedModel(format!(
                "version {:?}, expected {:?}",
                self.version, RUN_VERSION
            )));
        }
        for analyzer in &self.analyzers {
            if analyzer.id.is_empty() {
                return Err(FormatError::InvalidUnifiedModel("empty analyzer id".to_string()));
            }
            if crate::registry::AnalyzerMode::parse(&analyzer.mode).is_err() {
                return Err(FormatError::InvalidUnifiedModel(format!(
                    "analyzer {:?} has invalid mode {:?}",
                    analyzer.id, analyzer.mode
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, FormatError> {
        let model: UnifiedModel = serde_json::from_slice(bytes)
            .map_err(|err| FormatError::InvalidInputFormat(err.to_string()))?;
        model.validate()?;
        Ok(model)
    }
}

/// Encode the model as a single length-prefixed envelope frame wrapping
/// one JSON payload.
pub fn encode_envelope(model: &UnifiedModel) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(model)?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<UnifiedModel, FormatError> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(FormatError::InvalidInputFormat("truncated frame header".to_string()));
        }
        let len = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(FormatError::InvalidInputFormat("truncated frame payload".to_string()));
        }
        frames.push(&rest[..len]);
        rest = &rest[len..];
    }
    if frames.len() != 1 {
        return Err(FormatError::BinaryEnvelopeCount(frames.len()));
    }
    UnifiedModel::from_json(frames[0])
}

/// Render the model in one of the report formats. The timeseries formats
/// are produced by the history runner, which owns the commit stream.
pub fn render(model: &UnifiedModel, format: Format) -> Result<Vec<u8>> {
    Ok(match format {
        Format::Json => {
            let mut text = serde_json::to_vec_pretty(model)?;
            text.push(b'\n');
            text
        }
        Format::Yaml => serde_yaml::to_string(model)?.into_bytes(),
        Format::Binary => encode_envelope(model)?,
        Format::Text => render_text(model).into_bytes(),
        Format::Compact => render_compact(model).into_bytes(),
        Format::Plot => render_plot(model).into_bytes(),
        Format::TimeSeries | Format::TimeSeriesNdjson => {
            return Err(FormatError::InvalidInputFormat(format!(
                "{} is produced by the history runner",
                format
            ))
            .into())
        }
    })
}

fn render_text(model: &UnifiedModel) -> String {
    let mut out = String::new();
    for analyzer in &model.analyzers {
        out.push_str(&format!("== {} ({}) ==\n", analyzer.id, analyzer.mode));
        for (key, value) in &analyzer.report {
            out.push_str(&format!("  {}: {}\n", key, summarize(value)));
        }
        out.push('\n');
    }
    out
}

fn render_compact(model: &UnifiedModel) -> String {
    model
        .analyzers
        .iter()
        .map(|analyzer| {
            let fields = analyzer
                .report
                .iter()
                .map(|(key, value)| format!("{}={}", key, summarize(value)))
                .join(" ");
            format!("{} {}", analyzer.id, fields)
        })
        .join("\n")
        + "\n"
}

/// Scalars verbatim; containers as element counts, terminal output stays
/// one line per key.
fn summarize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => format!("[{} items]", items.len()),
        serde_json::Value::Object(map) => format!("{{{} keys}}", map.len()),
        other => other.to_string(),
    }
}

type PlotRenderer = fn(&UnifiedAnalyzer) -> Option<String>;
type PlotSectionRenderer = fn(&UnifiedModel) -> Option<String>;

lazy_static! {
    static ref PLOT_RENDERERS: RwLock<HashMap<String, PlotRenderer>> =
        RwLock::new(HashMap::new());
    static ref PLOT_SECTION_RENDERERS: RwLock<Vec<PlotSectionRenderer>> =
        RwLock::new(Vec::new());
}

/// Override the HTML section for one analyzer id.
pub fn register_plot_renderer(id: &str, renderer: PlotRenderer) {
    PLOT_RENDERERS.write().unwrap().insert(id.to_string(), renderer);
}

/// Append a document-level section (summary tables, legends).
pub fn register_plot_section_renderer(renderer: PlotSectionRenderer) {
    PLOT_SECTION_RENDERERS.write().unwrap().push(renderer);
}

/// Standalone HTML document embedding the report data and an inline
/// renderer. Custom renderers registered above take precedence per
/// analyzer.
fn render_plot(model: &UnifiedModel) -> String {
    let mut sections = String::new();
    let renderers = PLOT_RENDERERS.read().unwrap();
    for analyzer in &model.analyzers {
        let section = renderers
            .get(&analyzer.id)
            .and_then(|renderer| renderer(analyzer))
            .unwrap_or_else(|| default_plot_section(analyzer));
        sections.push_str(&section);
    }
    for renderer in PLOT_SECTION_RENDERERS.read().unwrap().iter() {
        if let Some(section) = renderer(model) {
            sections.push_str(&section);
        }
    }

    let data = serde_json::to_string(model).unwrap_or_else(|_| "null".to_string());
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>codefang report</title>\n\
         <style>body{{font-family:sans-serif;margin:2em}}\
         .bar{{fill:#4878a8}}.section{{margin-bottom:2em}}</style>\n\
         </head>\n<body>\n<h1>codefang report</h1>\n{}\
         <script type=\"application/json\" id=\"report-data\">{}</script>\n\
         </body>\n</html>\n",
        sections, data
    )
}

fn default_plot_section(analyzer: &UnifiedAnalyzer) -> String {
    let mut bars = String::new();
    // Chart the first numeric-valued object key; everything else is
    // listed verbatim below the chart.
    if let Some((key, values)) = analyzer.report.iter().find_map(|(key, value)| {
        value.as_object().and_then(|map| {
            let numeric: Vec<(&String, f64)> =
                map.iter().filter_map(|(k, v)| v.as_f64().map(|n| (k, n))).collect();
            (!numeric.is_empty()).then_some((key, numeric))
        })
    }) {
        let max = values.iter().map(|(_, n)| *n).fold(f64::MIN, f64::max).max(1.0);
        let rows = values.len().min(30);
        bars.push_str(&format!(
            "<h3>{}</h3>\n<svg width=\"640\" height=\"{}\">\n",
            key,
            rows * 22
        ));
        for (row, (label, n)) in values.into_iter().take(rows).enumerate() {
            let width = (n / max * 420.0).max(1.0);
            bars.push_str(&format!(
                "<text x=\"0\" y=\"{y}\" font-size=\"12\">{label}</text>\
                 <rect class=\"bar\" x=\"200\" y=\"{ry}\" width=\"{width:.0}\" height=\"14\"></rect>\n",
                y = row * 22 + 14,
                ry = row * 22 + 4,
            ));
        }
        bars.push_str("</svg>\n");
    }
    format!(
        "<div class=\"section\"><h2>{}</h2>\n{}</div>\n",
        analyzer.id, bars
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> UnifiedModel {
        let mut report = Report::new();
        report.insert("total".to_string(), serde_json::json!(7));
        report.insert(
            "by_file".to_string(),
            serde_json::json!({ "a.rs": 3, "b.rs": 4 }),
        );
        UnifiedModel::new(vec![UnifiedAnalyzer {
            id: "couples".to_string(),
            mode: "history".to_string(),
            report,
        }])
    }

    #[test]
    fn resolver_accepts_known_names_and_aliases() {
        assert_eq!(Format::resolve("json").unwrap(), Format::Json);
        assert_eq!(Format::resolve("binary").unwrap(), Format::Binary);
        assert_eq!(Format::resolve("bin").unwrap(), Format::Binary);
        assert_eq!(Format::resolve("timeseries-ndjson").unwrap(), Format::TimeSeriesNdjson);
        assert!(matches!(
            Format::resolve("xml"),
            Err(FormatError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn json_round_trip_is_identity() {
        let original = model();
        let rendered = render(&original, Format::Json).unwrap();
        let decoded = UnifiedModel::from_json(&rendered).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn envelope_round_trip_is_identity() {
        let original = model();
        let encoded = encode_envelope(&original).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn envelope_count_is_enforced() {
        let one = encode_envelope(&model()).unwrap();
        let two: Vec<u8> = one.iter().chain(one.iter()).copied().collect();
        assert!(matches!(
            decode_envelope(&two),
            Err(FormatError::BinaryEnvelopeCount(2))
        ));
        assert!(matches!(
            decode_envelope(&[]),
            Err(FormatError::BinaryEnvelopeCount(0))
        ));
    }

    #[test]
    fn truncated_envelope_is_invalid_input() {
        let mut encoded = encode_envelope(&model()).unwrap();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            decode_envelope(&encoded),
            Err(FormatError::InvalidInputFormat(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_models() {
        let mut wrong_version = model();
        wrong_version.version = "codefang.run.v0".to_string();
        assert!(matches!(
            wrong_version.validate(),
            Err(FormatError::InvalidUnifiedModel(_))
        ));

        let mut empty_id = model();
        empty_id.analyzers[0].id.clear();
        assert!(empty_id.validate().is_err());

        let mut bad_mode = model();
        bad_mode.analyzers[0].mode = "live".to_string();
        assert!(bad_mode.validate().is_err());
    }

    #[test]
    fn yaml_parses_back() {
        let rendered = render(&model(), Format::Yaml).unwrap();
        let decoded: UnifiedModel =
            serde_yaml::from_slice(&rendered).expect("yaml round-trips");
        assert_eq!(decoded, model());
    }

    #[test]
    fn text_and_compact_mention_every_analyzer() {
        let text = String::from_utf8(render(&model(), Format::Text).unwrap()).unwrap();
        assert!(text.contains("== couples (history) =="));
        assert!(text.contains("total: 7"));
        assert!(text.contains("by_file: {2 keys}"));

        let compact = String::from_utf8(render(&model(), Format::Compact).unwrap()).unwrap();
        assert_eq!(compact.lines().count(), 1);
        assert!(compact.starts_with("couples "));
    }

    #[test]
    fn plot_embeds_data_and_charts_numeric_maps() {
        let html = String::from_utf8(render(&model(), Format::Plot).unwrap()).unwrap();
        assert!(html.contains("report-data"));
        assert!(html.contains("<svg"));
        assert!(html.contains("a.rs"));
    }

    #[test]
    fn timeseries_formats_are_runner_only() {
        let err = render(&model(), Format::TimeSeries).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FormatError>(),
            Some(FormatError::InvalidInputFormat(_))
        ));
    }
}
