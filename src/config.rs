use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::catalog;
use crate::models::{DefectRecord, CRITICAL_THRESHOLD, DANGER_THRESHOLD, WARNING_THRESHOLD};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_unknown_operator")]
    pub unknown_operator: String,
    #[serde(default = "catalog::default_virtual_operators")]
    pub virtual_operators: Vec<String>,
    #[serde(default = "catalog::default_virtual_references")]
    pub virtual_references: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    /// Alert endpoint; the in-process mailer is used when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_levels")]
    pub levels: Vec<EscalationTemplate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationTemplate {
    pub threshold: u32,
    pub label: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            cache_dir: default_cache_dir(),
            cache_prefix: default_cache_prefix(),
            database_url: None,
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            unknown_operator: default_unknown_operator(),
            virtual_operators: catalog::default_virtual_operators(),
            virtual_references: catalog::default_virtual_references(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: default_timeout_seconds(),
            state_file: default_state_file(),
            levels: default_levels(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl FilterConfig {
    pub fn is_placeholder_operator(&self, name: &str) -> bool {
        let name = name.trim();
        name.is_empty()
            || name == self.unknown_operator
            || self.virtual_operators.iter().any(|v| v == name)
    }

    pub fn is_virtual_operator(&self, name: &str) -> bool {
        let name = name.trim();
        self.virtual_operators.iter().any(|v| v == name)
    }

    pub fn is_virtual_reference(&self, reference: &str) -> bool {
        let reference = reference.trim();
        self.virtual_references.iter().any(|v| v == reference)
    }

    /// Records produced by demos or tests: a virtual operator or a placeholder reference.
    pub fn is_virtual_record(&self, record: &DefectRecord) -> bool {
        self.is_virtual_operator(&record.operator_name)
            || [&record.project, &record.ref1, &record.ref2]
                .into_iter()
                .flatten()
                .any(|reference| self.is_virtual_reference(reference))
    }

    pub fn excludes(&self, record: &DefectRecord) -> bool {
        self.is_placeholder_operator(&record.operator_name) || self.is_virtual_record(record)
    }
}

impl EscalationConfig {
    pub fn thresholds(&self) -> Vec<u32> {
        let mut thresholds: Vec<u32> = self.levels.iter().map(|l| l.threshold).collect();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        thresholds
    }

    pub fn template(&self, threshold: u32) -> Option<&EscalationTemplate> {
        self.levels.iter().find(|l| l.threshold == threshold)
    }
}

fn default_collection() -> String {
    "defauts".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".quality-cache")
}

fn default_cache_prefix() -> String {
    "quality_tracker_".to_string()
}

fn default_acquire_timeout_seconds() -> u64 {
    5
}

fn default_unknown_operator() -> String {
    catalog::UNKNOWN_OPERATOR.to_string()
}

fn default_timeout_seconds() -> f64 {
    10.0
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".quality-cache/threshold_state.json")
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "https://quality-tracker.vercel.app".to_string(),
        "https://quality-tracker.netlify.app".to_string(),
        "http://localhost:8081".to_string(),
    ]
}

fn default_levels() -> Vec<EscalationTemplate> {
    vec![
        EscalationTemplate {
            threshold: WARNING_THRESHOLD,
            label: "Niveau 1 - chef de ligne".to_string(),
            recipients: vec!["chef.ligne@quality-tracker.local".to_string()],
            subject: "[Qualité] {operator} a atteint {count} défauts".to_string(),
            body: "L'opérateur {operator} cumule {count} défauts (précédemment {previous}).\n\
                   Dernier type de défaut : {defect_type}.\n\
                   Seuil franchi : {level} ({timestamp})."
                .to_string(),
        },
        EscalationTemplate {
            threshold: DANGER_THRESHOLD,
            label: "Niveau 2 - superviseur qualité".to_string(),
            recipients: vec![
                "chef.ligne@quality-tracker.local".to_string(),
                "superviseur.qualite@quality-tracker.local".to_string(),
            ],
            subject: "[Qualité] Escalade niveau 2 : {operator} ({count} défauts)".to_string(),
            body: "L'opérateur {operator} cumule {count} défauts (précédemment {previous}).\n\
                   Dernier type de défaut : {defect_type}.\n\
                   Une formation de rappel est requise. Seuil franchi : {level} ({timestamp})."
                .to_string(),
        },
        EscalationTemplate {
            threshold: CRITICAL_THRESHOLD,
            label: "Niveau 3 - direction".to_string(),
            recipients: vec![
                "chef.ligne@quality-tracker.local".to_string(),
                "superviseur.qualite@quality-tracker.local".to_string(),
                "responsable.production@quality-tracker.local".to_string(),
            ],
            subject: "[Qualité] CRITIQUE : {operator} a atteint {count} défauts".to_string(),
            body: "L'opérateur {operator} cumule {count} défauts (précédemment {previous}).\n\
                   Dernier type de défaut : {defect_type}.\n\
                   Retrait du poste et audit requis. Seuil franchi : {level} ({timestamp})."
                .to_string(),
        },
    ]
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    raw_path.unwrap_or_else(|| PathBuf::from("quality.toml"))
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.store.collection.trim().is_empty() {
        bail!("store.collection must not be empty");
    }
    if cfg.escalation.levels.is_empty() {
        bail!("escalation.levels must define at least one threshold");
    }
    for level in &cfg.escalation.levels {
        if level.threshold == 0 {
            bail!("escalation threshold must be positive ({})", level.label);
        }
        if level.recipients.is_empty() {
            bail!("escalation level {} has no recipients", level.threshold);
        }
    }
    Ok(())
}
