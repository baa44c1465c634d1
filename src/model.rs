use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_MAX_CYCLES: u32 = 5;
pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_THRESHOLD: f64 = 8.0;
pub const OVERALL_METRIC: &str = "overall";
pub const STANDARD_METRICS: [&str; 4] = [OVERALL_METRIC, "repetition", "negotiation", "empathy"];

const THRESHOLD_RANGE: std::ops::RangeInclusive<f64> = 1.0..=10.0;

/// Named score targets keyed by metric, in the order they were configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thresholds(IndexMap<String, f64>);

impl Default for Thresholds {
    fn default() -> Self {
        Self(
            STANDARD_METRICS
                .iter()
                .map(|metric| ((*metric).to_string(), DEFAULT_THRESHOLD))
                .collect(),
        )
    }
}

impl Thresholds {
    #[must_use]
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    pub fn set(&mut self, metric: impl Into<String>, value: f64) {
        self.0.insert(metric.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// The overall target expressed as a fraction, the form older servers read.
    #[must_use]
    pub fn pass_fraction(&self) -> f64 {
        self.get(OVERALL_METRIC).unwrap_or(DEFAULT_THRESHOLD) / 10.0
    }
}

impl FromIterator<(String, f64)> for Thresholds {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Configuration sent to the server as the first message of a session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredConfig")]
pub struct SessionConfig {
    pub api_key: String,
    pub model_name: String,
    pub base_prompt: String,
    pub max_cycles: u32,
    pub batch_size: u32,
    pub thresholds: Thresholds,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model_name: DEFAULT_MODEL.to_string(),
            base_prompt: String::new(),
            max_cycles: DEFAULT_MAX_CYCLES,
            batch_size: DEFAULT_BATCH_SIZE,
            thresholds: Thresholds::default(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("api_key", &redact(&self.api_key))
            .field("model_name", &self.model_name)
            .field("base_prompt_len", &self.base_prompt.len())
            .field("max_cycles", &self.max_cycles)
            .field("batch_size", &self.batch_size)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

impl SessionConfig {
    /// Check the numeric parameters before a session is opened.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_cycles == 0 {
            return Err("max_cycles must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        for (metric, value) in self.thresholds.iter() {
            if !value.is_finite() || !THRESHOLD_RANGE.contains(&value) {
                return Err(format!(
                    "threshold '{metric}' must be between 1 and 10, got {value}"
                ));
            }
        }
        Ok(())
    }

    /// Serialize the configuration in the form the simulation server expects.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn wire_payload(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "threshold".to_string(),
                Value::from(self.thresholds.pass_fraction()),
            );
        }
        serde_json::to_string(&value)
    }
}

/// Lenient shape used when reading configs back from the archive. Runs
/// recorded by older servers carry a single `threshold` fraction instead of
/// named targets.
#[derive(Deserialize)]
struct StoredConfig {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    base_prompt: String,
    #[serde(default)]
    max_cycles: Option<u32>,
    #[serde(default)]
    batch_size: Option<u32>,
    #[serde(default)]
    thresholds: Option<Thresholds>,
    #[serde(default)]
    threshold: Option<f64>,
}

impl From<StoredConfig> for SessionConfig {
    fn from(raw: StoredConfig) -> Self {
        let thresholds = match (raw.thresholds, raw.threshold) {
            (Some(thresholds), _) => thresholds,
            (None, Some(fraction)) => {
                let mut thresholds = Thresholds::default();
                thresholds.set(OVERALL_METRIC, fraction * 10.0);
                thresholds
            }
            (None, None) => Thresholds::default(),
        };
        Self {
            api_key: raw.api_key,
            model_name: raw.model_name.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_prompt: raw.base_prompt,
            max_cycles: raw.max_cycles.unwrap_or(DEFAULT_MAX_CYCLES),
            batch_size: raw.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            thresholds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default = "Persona::unknown_name")]
    pub name: String,
    #[serde(default)]
    pub personality_traits: String,
    #[serde(default = "Persona::unknown_situation")]
    pub financial_situation: String,
    /// How the persona speaks, e.g. "short and angry".
    #[serde(default)]
    pub communication_style: String,
    /// The persona's main pushback, e.g. "I already paid".
    #[serde(default)]
    pub objection_type: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: Self::unknown_name(),
            personality_traits: String::new(),
            financial_situation: Self::unknown_situation(),
            communication_style: String::new(),
            objection_type: String::new(),
        }
    }
}

impl Persona {
    fn unknown_name() -> String {
        "Unknown".to_string()
    }

    fn unknown_situation() -> String {
        "N/A".to_string()
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// First comma-separated trait, used as a short tag.
    #[must_use]
    pub fn primary_trait(&self) -> &str {
        self.personality_traits
            .split(',')
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or("Generic")
    }

    #[must_use]
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// Accepts a persona object, a bare name, or null.
pub(crate) fn deserialize_persona<'de, D>(deserializer: D) -> Result<Persona, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PersonaField {
        Name(String),
        Profile(Persona),
    }

    Ok(match Option::<PersonaField>::deserialize(deserializer)? {
        Some(PersonaField::Name(name)) if !name.trim().is_empty() => Persona::named(name),
        Some(PersonaField::Profile(persona)) => persona,
        _ => Persona::default(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transcript {
    Structured(Vec<Turn>),
    Text(String),
}

impl Default for Transcript {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub cycle: u32,
    #[serde(default, deserialize_with = "deserialize_persona")]
    pub persona: Persona,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<IndexMap<String, f64>>,
    pub transcript: Transcript,
    #[serde(default)]
    pub feedback: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_used: Option<String>,
}

impl ScenarioResult {
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.as_ref()?.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationEntry {
    pub cycle: u32,
    pub old_prompt: String,
    pub new_prompt: String,
    #[serde(default)]
    pub reasoning: String,
}

/// A completed run as recorded in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub total_cycles: u32,
    #[serde(default)]
    pub results: Vec<ScenarioResult>,
    #[serde(default)]
    pub optimization_history: Vec<OptimizationEntry>,
}

impl HistoryItem {
    /// Whether the run met its overall target.
    #[must_use]
    pub fn met_target(&self) -> bool {
        self.success_rate >= self.config.thresholds.pass_fraction()
    }
}
