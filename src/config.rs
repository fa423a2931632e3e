//! Configuração do enhance-flow carregada a partir de `enhance-flow.toml`.
//!
//! A struct [`EnhanceConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis. Variáveis de
//! ambiente têm precedência sobre o arquivo; flags da CLI têm precedência
//! sobre ambos (aplicadas em `main`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::batch::{BatchInput, DEFAULT_MARKER, InputDefaults};
use crate::error::{EnhanceError, ErrorKind};
use crate::orchestrator::StepPolicies;
use crate::retry::RetryPolicy;
use crate::step::StepTimeouts;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "enhance-flow.toml";

/// Configuração de nível superior carregada de `enhance-flow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnhanceConfig {
    /// Lista de itens: chaves separadas por vírgula ou array JSON.
    #[serde(default)]
    pub images: Option<String>,

    #[serde(default = "default_source_bucket")]
    pub source_bucket: String,

    #[serde(default = "default_dest_bucket")]
    pub dest_bucket: String,

    /// Item único usado quando a lista está vazia.
    #[serde(default = "default_source_key")]
    pub source_key: String,

    #[serde(default = "default_dest_key")]
    pub dest_key: String,

    /// Prefixo do nome de arquivo de destino derivado.
    #[serde(default = "default_marker")]
    pub marker: String,

    #[serde(default = "default_enhancement_prompt")]
    pub enhancement_prompt: String,

    /// Teto de workflows simultâneos.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,

    #[serde(default)]
    pub transform: TransformSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Serviço de transformação HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Repassada como bearer token; nunca persistida.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Diretórios locais: armazenamento, área temporária e journal.
#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    /// Raiz do armazenamento local; cada bucket é um subdiretório.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Artefatos intermediários; ficam ao lado do journal para sobreviver
    /// a um reinício junto com ele.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
}

/// Parâmetros de retentativa de um passo, no formato do arquivo.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Tipos de erro transitórios tratados como fatais.
    #[serde(default)]
    pub fatal_kinds: Vec<ErrorKind>,
}

/// Seção `[retry]`: valores comuns mais sobrescritas por passo
/// (`[retry.fetch]`, `[retry.transform]`, `[retry.store]`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySection {
    #[serde(flatten)]
    pub common: RetrySettings,

    #[serde(default)]
    pub fetch: Option<RetrySettings>,

    #[serde(default)]
    pub transform: Option<RetrySettings>,

    #[serde(default)]
    pub store: Option<RetrySettings>,
}

/// Prazos por passo, em segundos.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,

    #[serde(default = "default_transform_secs")]
    pub transform_secs: u64,

    #[serde(default = "default_store_secs")]
    pub store_secs: u64,

    #[serde(default = "default_cleanup_secs")]
    pub cleanup_secs: u64,
}

fn default_source_bucket() -> String {
    "source-bucket".to_string()
}

fn default_dest_bucket() -> String {
    "dest-bucket".to_string()
}

fn default_source_key() -> String {
    "funny.png".to_string()
}

fn default_dest_key() -> String {
    "enhanced_funny.png".to_string()
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

fn default_enhancement_prompt() -> String {
    "Make this image more vibrant, increase clarity and sharpness, improve lighting".to_string()
}

// Valor padrão para o teto de concorrência: 5.
fn default_max_concurrent() -> usize {
    5
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1/enhance".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".enhance-flow/scratch")
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from(".enhance-flow/journal")
}

// Valor padrão para tentativas máximas: 3.
fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Valor padrão para o atraso máximo: 5 minutos.
fn default_max_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_jitter() -> bool {
    true
}

fn default_fetch_secs() -> u64 {
    5 * 60
}

fn default_transform_secs() -> u64 {
    10 * 60
}

fn default_store_secs() -> u64 {
    5 * 60
}

fn default_cleanup_secs() -> u64 {
    60
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            scratch_dir: default_scratch_dir(),
            journal_dir: default_journal_dir(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            fatal_kinds: Vec::new(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            transform_secs: default_transform_secs(),
            store_secs: default_store_secs(),
            cleanup_secs: default_cleanup_secs(),
        }
    }
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            images: None,
            source_bucket: default_source_bucket(),
            dest_bucket: default_dest_bucket(),
            source_key: default_source_key(),
            dest_key: default_dest_key(),
            marker: default_marker(),
            enhancement_prompt: default_enhancement_prompt(),
            max_concurrent_workflows: default_max_concurrent(),
            transform: TransformSettings::default(),
            paths: PathSettings::default(),
            retry: RetrySection::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl RetrySettings {
    /// Converte para a política usada pelo motor de retentativas.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            fatal_kinds: self.fatal_kinds.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("{section}: max_attempts must be at least 1");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            bail!(
                "{section}: backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!("{section}: max_delay_ms must not be smaller than base_delay_ms");
        }
        Ok(())
    }
}

impl EnhanceConfig {
    /// Carrega a configuração de `path`, ou de `enhance-flow.toml` no
    /// diretório atual. Sem caminho explícito, um arquivo ausente significa
    /// valores padrão.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(CONFIG_FILE), false),
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<EnhanceConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else if explicit {
            bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Aplica as variáveis de ambiente obtidas por `lookup`. Valores vazios
    /// são ignorados.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(images) = var("IMAGES_TO_PROCESS") {
            self.images = Some(images);
        }
        if let Some(bucket) = var("SOURCE_BUCKET") {
            self.source_bucket = bucket;
        }
        if let Some(bucket) = var("DEST_BUCKET") {
            self.dest_bucket = bucket;
        }
        if let Some(key) = var("SOURCE_KEY") {
            self.source_key = key;
        }
        if let Some(key) = var("DEST_KEY") {
            self.dest_key = key;
        }
        if let Some(prompt) = var("ENHANCEMENT_PROMPT") {
            self.enhancement_prompt = prompt;
        }
        if let Some(max) = var("MAX_CONCURRENT_WORKFLOWS") {
            self.max_concurrent_workflows = max
                .trim()
                .parse()
                .with_context(|| format!("MAX_CONCURRENT_WORKFLOWS is not a number: {max}"))?;
        }
        if let Some(endpoint) = var("TRANSFORM_ENDPOINT") {
            self.transform.endpoint = endpoint;
        }
        if let Some(key) = var("TRANSFORM_API_KEY") {
            self.transform.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workflows == 0 {
            bail!("max_concurrent_workflows must be at least 1");
        }
        self.retry.common.validate("retry")?;
        for (name, settings) in [
            ("retry.fetch", &self.retry.fetch),
            ("retry.transform", &self.retry.transform),
            ("retry.store", &self.retry.store),
        ] {
            if let Some(settings) = settings {
                settings.validate(name)?;
            }
        }
        let timeouts = &self.timeouts;
        if [
            timeouts.fetch_secs,
            timeouts.transform_secs,
            timeouts.store_secs,
            timeouts.cleanup_secs,
        ]
        .contains(&0)
        {
            bail!("step timeouts must be at least one second");
        }
        Ok(())
    }

    /// Políticas por passo: a sobrescrita do passo ou a seção comum.
    pub fn step_policies(&self) -> StepPolicies {
        let pick = |step: &Option<RetrySettings>| {
            step.as_ref().unwrap_or(&self.retry.common).to_policy()
        };
        StepPolicies {
            fetch: pick(&self.retry.fetch),
            transform: pick(&self.retry.transform),
            store: pick(&self.retry.store),
        }
    }

    pub fn step_timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            fetch: Duration::from_secs(self.timeouts.fetch_secs),
            transform: Duration::from_secs(self.timeouts.transform_secs),
            store: Duration::from_secs(self.timeouts.store_secs),
            cleanup: Duration::from_secs(self.timeouts.cleanup_secs),
        }
    }

    pub fn input_defaults(&self) -> InputDefaults {
        InputDefaults {
            source_bucket: self.source_bucket.clone(),
            dest_bucket: self.dest_bucket.clone(),
            source_key: self.source_key.clone(),
            dest_key: self.dest_key.clone(),
            marker: self.marker.clone(),
        }
    }

    /// Decide a forma da lista de itens uma única vez.
    pub fn batch_input(&self) -> Result<BatchInput, EnhanceError> {
        BatchInput::parse(self.images.as_deref(), &self.input_defaults())
    }
}
