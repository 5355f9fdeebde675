//! Strategy definitions.
//!
//! A strategy is a declarative document (YAML, JSON, or TOML, chosen by file
//! extension). Loading happens in two phases so callers can be lenient:
//!
//! 1. [`load_document`] parses the file into a generic JSON value.
//! 2. [`StrategyDefinition::from_document`] validates the value and
//!    deserializes it into typed form.
//!
//! Plan building uses the first phase alone to report a best-effort
//! strategy id even when validation fails.

use crate::pipeline::supervisor::SupervisorRules;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;

const REQUIRED_ROOT_FIELDS: [&str; 6] = [
    "strategy_id",
    "version",
    "universe",
    "rebalance",
    "portfolio",
    "supervisor",
];

const TRAIN_WINDOW_KEYS: [&str; 4] = ["train_from", "train_to", "valid_from", "valid_to"];

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum StrategyError {
    Io { path: String, source: std::io::Error },
    Parse { path: String, message: String },
    Invalid(Vec<String>),
    UnsupportedUniverse(String),
}

impl std::fmt::Display for StrategyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "Cannot read strategy {}: {}", path, source),
            Self::Parse { path, message } => write!(f, "Cannot parse strategy {}: {}", path, message),
            Self::Invalid(errors) => write!(f, "Invalid strategy: {}", errors.join("; ")),
            Self::UnsupportedUniverse(kind) => write!(f, "Unsupported universe.type: {}", kind),
        }
    }
}

impl std::error::Error for StrategyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// DEFINITION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub strategy_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    pub universe: UniverseSpec,
    #[serde(alias = "rebalance_frequency")]
    pub rebalance: RebalanceFrequency,
    pub portfolio: PortfolioSpec,
    #[serde(default)]
    pub supervisor: SupervisorRules,
    #[serde(default)]
    pub signal: Option<SignalSpec>,
    #[serde(default)]
    pub recommender: Option<RecommenderSpec>,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    Equal,
    ScoreWeighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSpec {
    pub top_k: usize,
    #[serde(default)]
    pub weighting: Weighting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalInputs {
    #[serde(default)]
    pub feature_name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub feature_version: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    FactorRank,
    ModelScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub inputs: SignalInputs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommenderKind {
    FactorRank,
    MlGbdt,
}

impl RecommenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FactorRank => "factor_rank",
            Self::MlGbdt => "ml_gbdt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAlgo {
    Lightgbm,
    Xgboost,
    Catboost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelTarget {
    #[serde(rename = "forward_ret_5d")]
    ForwardRet5d,
    #[serde(rename = "forward_ret_20d")]
    ForwardRet20d,
}

impl ModelTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForwardRet5d => "forward_ret_5d",
            Self::ForwardRet20d => "forward_ret_20d",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainWindow {
    pub train_from: NaiveDate,
    pub train_to: NaiveDate,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub algo: ModelAlgo,
    pub target: ModelTarget,
    #[serde(default = "default_featureset")]
    pub featureset: String,
    pub train_window: TrainWindow,
}

fn default_featureset() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommenderSpec {
    #[serde(rename = "type")]
    pub kind: RecommenderKind,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub weighting: Option<Weighting>,
    #[serde(default)]
    pub inputs: Option<SignalInputs>,
    #[serde(default)]
    pub model: Option<ModelSpec>,
}

/// How a day's P&L is split across active symbols in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    #[default]
    Even,
    WeightProportional,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default)]
    pub fee_bps: f64,
    #[serde(default)]
    pub slippage_bps: f64,
    #[serde(default)]
    pub attribution: Attribution,
}

/// Scoring source resolved from the signal / recommender blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoreSource {
    /// Rank by a stored feature.
    Feature { name: String, version: String },
    /// Caller-supplied scoring function.
    Plugged { label: String },
}

/// Effective recommendation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub kind: String,
    pub source: ScoreSource,
    pub top_k: usize,
    pub weighting: Weighting,
}

impl StrategyDefinition {
    /// Validate and deserialize a parsed document.
    pub fn from_document(doc: &Value) -> Result<Self, StrategyError> {
        let errors = validate_document(doc);
        if !errors.is_empty() {
            return Err(StrategyError::Invalid(errors));
        }
        serde_json::from_value(doc.clone()).map_err(|e| StrategyError::Invalid(vec![e.to_string()]))
    }

    /// Load, validate, and deserialize a strategy file.
    pub fn load(path: &Path) -> Result<Self, StrategyError> {
        Self::from_document(&load_document(path)?)
    }

    /// Symbols named by the universe block.
    pub fn universe_symbols(&self) -> Result<Vec<String>, StrategyError> {
        match self.universe.kind.as_str() {
            "symbols" => Ok(normalize_symbols(self.universe.symbols.iter().map(String::as_str))),
            other => Err(StrategyError::UnsupportedUniverse(other.to_string())),
        }
    }

    /// Resolve where scores come from. The recommender block wins over the
    /// signal block when both are present.
    pub fn recommendation(&self) -> Recommendation {
        let signal_inputs = self.signal.as_ref().map(|s| &s.inputs);
        if let Some(rec) = &self.recommender {
            let top_k = rec.top_k.unwrap_or(self.portfolio.top_k);
            let weighting = rec.weighting.unwrap_or(self.portfolio.weighting);
            let source = match rec.kind {
                RecommenderKind::FactorRank => {
                    let inputs = rec.inputs.as_ref().or(signal_inputs);
                    feature_source(inputs)
                }
                RecommenderKind::MlGbdt => ScoreSource::Plugged {
                    label: rec
                        .model
                        .as_ref()
                        .map(|m| format!("ml_gbdt:{:?}:{}", m.algo, m.target.as_str()).to_lowercase())
                        .unwrap_or_else(|| "ml_gbdt".to_string()),
                },
            };
            return Recommendation {
                kind: rec.kind.as_str().to_string(),
                source,
                top_k,
                weighting,
            };
        }

        let (kind, source) = match self.signal.as_ref().map(|s| s.kind) {
            Some(SignalKind::ModelScore) => (
                "model_score",
                ScoreSource::Plugged {
                    label: signal_inputs
                        .and_then(|i| i.model_id.clone())
                        .unwrap_or_else(|| "model_score".to_string()),
                },
            ),
            _ => ("factor_rank", feature_source(signal_inputs)),
        };
        Recommendation {
            kind: kind.to_string(),
            source,
            top_k: self.portfolio.top_k,
            weighting: self.portfolio.weighting,
        }
    }
}

fn feature_source(inputs: Option<&SignalInputs>) -> ScoreSource {
    ScoreSource::Feature {
        name: inputs
            .and_then(|i| i.feature_name.clone())
            .unwrap_or_default(),
        version: inputs
            .and_then(|i| i.feature_version.clone())
            .unwrap_or_default(),
    }
}

// =============================================================================
// LOADING & VALIDATION
// =============================================================================

/// Parse a strategy file into a generic document by extension.
pub fn load_document(path: &Path) -> Result<Value, StrategyError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| StrategyError::Io {
        path: display.clone(),
        source,
    })?;
    let parse_err = |message: String| StrategyError::Parse {
        path: display.clone(),
        message,
    };

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let doc: Value = match ext.as_deref() {
        Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
        Some("toml") => toml::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
    };

    if doc.is_null() {
        return Err(StrategyError::Invalid(vec!["Empty strategy configuration.".to_string()]));
    }
    Ok(doc)
}

/// SHA-256 of the strategy file contents.
pub fn fingerprint_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(format!("{:x}", Sha256::digest(&bytes)))
}

/// Every schema problem in `doc`; empty when valid.
pub fn validate_document(doc: &Value) -> Vec<String> {
    let Some(root) = doc.as_object() else {
        return vec!["Strategy document must be a mapping.".to_string()];
    };
    let mut errors = Vec::new();

    let missing: Vec<&str> = REQUIRED_ROOT_FIELDS
        .iter()
        .copied()
        .filter(|field| {
            !root.contains_key(*field)
                && !(*field == "rebalance" && root.contains_key("rebalance_frequency"))
        })
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Missing required fields: {}", missing.join(", ")));
    }

    if let Some(universe) = root.get("universe") {
        if universe.get("type").and_then(Value::as_str).is_none() {
            errors.push("Universe must have a 'type'.".to_string());
        }
    }

    let signal = root.get("signal").and_then(Value::as_object);
    let recommender = root.get("recommender").and_then(Value::as_object);
    if signal.is_none() && recommender.is_none() {
        errors.push("Strategy must have either 'signal' or 'recommender'.".to_string());
    }

    if let Some(signal) = signal {
        validate_signal(signal, &mut errors);
    }
    if let Some(recommender) = recommender {
        validate_recommender(recommender, signal, &mut errors);
    }

    if let Some(portfolio) = root.get("portfolio") {
        match portfolio.get("top_k") {
            None => errors.push("Portfolio must have 'top_k'.".to_string()),
            Some(v) if !is_positive_int(v) => {
                errors.push("portfolio.top_k must be an int > 0".to_string())
            }
            Some(_) => {}
        }
        if let Some(w) = portfolio.get("weighting") {
            if !is_weighting(w) {
                errors.push("portfolio.weighting must be 'equal' or 'score_weighted'".to_string());
            }
        }
    }

    errors
}

fn validate_signal(signal: &Map<String, Value>, errors: &mut Vec<String>) {
    let inputs = signal.get("inputs");
    match signal.get("type").and_then(Value::as_str) {
        None => errors.push("Signal must have a 'type'.".to_string()),
        Some("factor_rank") => {
            if !has_text(inputs, "feature_name") || !has_text(inputs, "feature_version") {
                errors.push(
                    "factor_rank signal requires feature_name and feature_version.".to_string(),
                );
            }
        }
        Some("model_score") => {
            if !has_text(inputs, "model_id") {
                errors.push("model_score signal requires model_id.".to_string());
            }
        }
        Some(other) => errors.push(format!("Unsupported signal type: {}", other)),
    }
}

fn validate_recommender(
    rec: &Map<String, Value>,
    signal: Option<&Map<String, Value>>,
    errors: &mut Vec<String>,
) {
    let rtype = rec.get("type").and_then(Value::as_str);
    if !matches!(rtype, Some("factor_rank") | Some("ml_gbdt")) {
        errors.push("Unsupported recommender.type: must be factor_rank or ml_gbdt".to_string());
    }

    if let Some(top_k) = rec.get("top_k") {
        if !is_positive_int(top_k) {
            errors.push("recommender.top_k must be an int > 0".to_string());
        }
    }
    if let Some(w) = rec.get("weighting") {
        if !is_weighting(w) {
            errors.push("recommender.weighting must be 'equal' or 'score_weighted'".to_string());
        }
    }

    match rtype {
        Some("factor_rank") => {
            let own = rec.get("inputs");
            let from_signal = signal.and_then(|s| s.get("inputs"));
            let has_inputs = |inputs: Option<&Value>| {
                has_text(inputs, "feature_name") && has_text(inputs, "feature_version")
            };
            if !has_inputs(own) && !has_inputs(from_signal) {
                errors.push(
                    "factor_rank requires signal.inputs.feature_name/feature_version".to_string(),
                );
            }
        }
        Some("ml_gbdt") => {
            let model = rec.get("model");
            let field = |key: &str| model.and_then(|m| m.get(key)).and_then(Value::as_str);
            if !matches!(field("algo"), Some("lightgbm") | Some("xgboost") | Some("catboost")) {
                errors.push(
                    "recommender.model.algo must be one of: lightgbm, xgboost, catboost"
                        .to_string(),
                );
            }
            if !matches!(field("target"), Some("forward_ret_5d") | Some("forward_ret_20d")) {
                errors.push(
                    "recommender.model.target must be forward_ret_5d or forward_ret_20d"
                        .to_string(),
                );
            }
            if field("featureset").unwrap_or("default") != "default" {
                errors.push(
                    "recommender.model.featureset currently supports only 'default'".to_string(),
                );
            }
            let window = model.and_then(|m| m.get("train_window"));
            for key in TRAIN_WINDOW_KEYS {
                if !has_text(window, key) {
                    errors.push(format!("recommender.model.train_window.{} is required", key));
                }
            }
        }
        _ => {}
    }
}

fn has_text(obj: Option<&Value>, key: &str) -> bool {
    match obj.and_then(|o| o.get(key)) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Number(_)) => true,
        _ => false,
    }
}

fn is_positive_int(v: &Value) -> bool {
    v.as_u64().map(|n| n > 0).unwrap_or(false)
}

fn is_weighting(v: &Value) -> bool {
    matches!(v.as_str(), Some("equal") | Some("score_weighted"))
}

/// Trim, upper-case, and de-duplicate symbols, keeping first occurrence.
pub fn normalize_symbols<'a, I: IntoIterator<Item = &'a str>>(raw: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for sym in raw {
        let sym = sym.trim().to_uppercase();
        if !sym.is_empty() && !out.contains(&sym) {
            out.push(sym);
        }
    }
    out
}

/// Parse a comma-separated symbol override.
pub fn parse_symbol_override(raw: &str) -> Vec<String> {
    normalize_symbols(raw.split(','))
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_doc() -> Value {
        json!({
            "strategy_id": "momo_kr",
            "version": 2,
            "universe": {"type": "symbols", "symbols": ["aapl", "GOOGL", "AAPL"]},
            "rebalance": "daily",
            "portfolio": {"top_k": 2, "weighting": "equal"},
            "supervisor": {"max_positions": 5},
            "signal": {
                "type": "factor_rank",
                "inputs": {"feature_name": "ret_5d", "feature_version": "v1"}
            },
            "backtest": {"fee_bps": 5, "slippage_bps": 5}
        })
    }

    #[test]
    fn test_valid_document_deserializes() {
        let strategy = StrategyDefinition::from_document(&base_doc()).unwrap();
        assert_eq!(strategy.strategy_id, "momo_kr");
        assert_eq!(strategy.version, "2");
        assert_eq!(strategy.rebalance, RebalanceFrequency::Daily);
        assert_eq!(strategy.supervisor.max_positions, 5);
        assert!((strategy.supervisor.gross_exposure_cap - 1.0).abs() < 1e-12);
        assert!((strategy.backtest.fee_bps - 5.0).abs() < 1e-12);
        assert_eq!(strategy.backtest.attribution, Attribution::Even);
        assert_eq!(strategy.universe_symbols().unwrap(), vec!["AAPL", "GOOGL"]);

        let rec = strategy.recommendation();
        assert_eq!(rec.kind, "factor_rank");
        assert_eq!(rec.top_k, 2);
        assert_eq!(
            rec.source,
            ScoreSource::Feature {
                name: "ret_5d".to_string(),
                version: "v1".to_string()
            }
        );
    }

    #[test]
    fn test_missing_fields_reported_together() {
        let mut doc = base_doc();
        let root = doc.as_object_mut().unwrap();
        root.remove("version");
        root.remove("supervisor");
        let errors = validate_document(&doc);
        assert_eq!(errors, vec!["Missing required fields: version, supervisor".to_string()]);
    }

    #[test]
    fn test_signal_or_recommender_required() {
        let mut doc = base_doc();
        doc.as_object_mut().unwrap().remove("signal");
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.contains("either 'signal' or 'recommender'")));
    }

    #[test]
    fn test_unsupported_recommender_settings_rejected() {
        let mut doc = base_doc();
        doc["recommender"] = json!({
            "type": "ml_gbdt",
            "model": {
                "algo": "random_forest",
                "target": "forward_ret_1d",
                "train_window": {"train_from": "2020-01-01", "train_to": "2021-01-01",
                                 "valid_from": "2021-01-02"}
            }
        });
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.contains("model.algo")));
        assert!(errors.iter().any(|e| e.contains("model.target")));
        assert!(errors.iter().any(|e| e.contains("train_window.valid_to")));

        doc["recommender"] = json!({"type": "svm"});
        let errors = validate_document(&doc);
        assert!(errors.iter().any(|e| e.contains("Unsupported recommender.type")));
    }

    #[test]
    fn test_ml_gbdt_recommendation_is_plugged() {
        let mut doc = base_doc();
        doc["recommender"] = json!({
            "type": "ml_gbdt",
            "top_k": 3,
            "weighting": "score_weighted",
            "model": {
                "algo": "lightgbm",
                "target": "forward_ret_20d",
                "train_window": {"train_from": "2020-01-01", "train_to": "2021-01-01",
                                 "valid_from": "2021-01-02", "valid_to": "2021-06-30"}
            }
        });
        let strategy = StrategyDefinition::from_document(&doc).unwrap();
        let rec = strategy.recommendation();
        assert_eq!(rec.kind, "ml_gbdt");
        assert_eq!(rec.top_k, 3);
        assert_eq!(rec.weighting, Weighting::ScoreWeighted);
        assert!(matches!(rec.source, ScoreSource::Plugged { .. }));
    }

    #[test]
    fn test_unsupported_universe() {
        let mut doc = base_doc();
        doc["universe"] = json!({"type": "index", "index": "KOSPI200"});
        let strategy = StrategyDefinition::from_document(&doc).unwrap();
        assert!(matches!(
            strategy.universe_symbols(),
            Err(StrategyError::UnsupportedUniverse(kind)) if kind == "index"
        ));
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("momo.yaml");
        std::fs::write(
            &path,
            r#"
strategy_id: momo
version: "1.0"
universe:
  type: symbols
  symbols: [AAPL]
rebalance_frequency: weekly
portfolio:
  top_k: 1
supervisor:
  gross_exposure_cap: 0.9
signal:
  type: model_score
  inputs:
    model_id: gbdt-2024
"#,
        )
        .unwrap();
        let strategy = StrategyDefinition::load(&path).unwrap();
        assert_eq!(strategy.rebalance, RebalanceFrequency::Weekly);
        assert_eq!(strategy.version, "1.0");
        assert_eq!(
            strategy.recommendation().source,
            ScoreSource::Plugged {
                label: "gbdt-2024".to_string()
            }
        );
        assert!(fingerprint_file(&path).unwrap().len() == 64);
    }

    #[test]
    fn test_symbol_override_normalization() {
        assert_eq!(parse_symbol_override(" aapl, msft ,,AAPL,goog "), vec!["AAPL", "MSFT", "GOOG"]);
    }
}
