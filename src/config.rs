//! Configuração do jobline carregada a partir de `jobline.toml`.
//!
//! A struct [`JoblineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults que reproduzem o pipeline
//! de seis estágios. A variável de ambiente `JOBLINE_STOP_FILE` tem
//! precedência sobre o arquivo para o caminho do sentinela de parada.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lease::{Endpoint, WaitBudget};
use crate::retry::RetryPolicy;
use crate::topology::{StageSpec, Topology, TopologyError};
use crate::transform::TransformSpec;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "jobline.toml";
pub const CONFIG_ENV: &str = "JOBLINE_CONFIG";
pub const STOP_FILE_ENV: &str = "JOBLINE_STOP_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Configuração de nível superior carregada de `jobline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoblineConfig {
    /// Raiz das duas instâncias (`<root>/priority`, `<root>/normal`).
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Diretório dos descritores de lease. Padrão: `<root>/locks`.
    #[serde(default)]
    pub lease_dir: Option<PathBuf>,

    /// Diretório dos registros de rejeição. Padrão: `<root>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Sentinela de parada global. Padrão: `<root>/ALL_STOP`.
    #[serde(default)]
    pub stop_file: Option<PathBuf>,

    /// Área final onde os registros aguardam revisão humana.
    #[serde(default = "default_holding")]
    pub holding: String,

    /// Orçamento de tentativas por registro.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Espera por slots de endpoint.
    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Estágios em ordem de fluxo.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

/// Parâmetros de espera do broker de leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Espera base entre varreduras completas, em milissegundos.
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Jitter máximo somado à espera base, em milissegundos.
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Varreduras antes de desistir com `ResourceExhausted`.
    #[serde(default = "default_lease_attempts")]
    pub max_attempts: u32,
}

/// Um estágio como escrito no arquivo: diretórios mais a transformação.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub input: String,
    pub output: String,
    pub reject: String,
    #[serde(default)]
    pub transform: TransformSpec,
}

impl StageConfig {
    fn new(name: &str, input: &str, output: &str, reject: &str) -> Self {
        Self {
            name: name.to_string(),
            input: input.to_string(),
            output: output.to_string(),
            reject: reject.to_string(),
            transform: TransformSpec::default(),
        }
    }

    pub fn spec(&self) -> StageSpec {
        StageSpec {
            name: self.name.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            reject: self.reject.clone(),
        }
    }
}

// Valor padrão para a raiz: "pipeline".
fn default_root() -> PathBuf {
    PathBuf::from("pipeline")
}

// Valor padrão para a área final: "08_ready_for_review".
fn default_holding() -> String {
    "08_ready_for_review".to_string()
}

// Valor padrão para a espera base: 2000ms.
fn default_retry_wait_ms() -> u64 {
    2000
}

// Valor padrão para o jitter: 1000ms.
fn default_retry_jitter_ms() -> u64 {
    1000
}

// Valor padrão para varreduras: 30.
fn default_lease_attempts() -> u32 {
    30
}

// Os seis estágios de conteúdo, todos com transformação pass-through.
fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("incoming", "01_incoming", "02_parsed", "50_rejected_parse"),
        StageConfig::new("parsed", "02_parsed", "03_deduped", "51_rejected_duplicate"),
        StageConfig::new(
            "deduped",
            "03_deduped",
            "04_clean_checked",
            "52_rejected_cleanliness",
        ),
        StageConfig::new(
            "clean_checked",
            "04_clean_checked",
            "05_formatted",
            "53_rejected_format",
        ),
        StageConfig::new(
            "formatted",
            "05_formatted",
            "06_categorized",
            "54_rejected_category",
        ),
        StageConfig::new(
            "categorized",
            "06_categorized",
            "08_ready_for_review",
            "55_rejected_titled",
        ),
    ]
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            retry_wait_ms: default_retry_wait_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            max_attempts: default_lease_attempts(),
        }
    }
}

impl LeaseConfig {
    pub fn wait_budget(&self) -> WaitBudget {
        WaitBudget {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_wait_ms),
            jitter_max: Duration::from_millis(self.retry_jitter_ms),
        }
    }
}

impl Default for JoblineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            lease_dir: None,
            log_dir: None,
            stop_file: None,
            holding: default_holding(),
            retry: RetryPolicy::default(),
            lease: LeaseConfig::default(),
            endpoints: Vec::new(),
            stages: default_stages(),
        }
    }
}

impl JoblineConfig {
    /// Carrega a configuração.
    ///
    /// Ordem de busca: `path` explícito, depois `JOBLINE_CONFIG`, depois
    /// `./jobline.toml`. Sem arquivo, usa os valores padrão. Um caminho
    /// explícito que não existe é erro.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::load_from(&path)?,
            None => {
                let local = Path::new(CONFIG_FILE);
                if local.exists() {
                    Self::load_from(local)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo para o sentinela.
        config.apply_stop_file_override(std::env::var_os(STOP_FILE_ENV));
        config.validate()?;
        Ok(config)
    }

    /// Lê e interpreta um arquivo específico, sem validar.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_stop_file_override(&mut self, value: Option<OsString>) {
        if let Some(value) = value
            && !value.is_empty()
        {
            self.stop_file = Some(PathBuf::from(value));
        }
    }

    /// Verifica o que o serde não consegue: endpoints e a topologia.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.trim().is_empty() {
                return Err(ConfigError::Invalid("endpoint with an empty id".into()));
            }
            if !ids.insert(endpoint.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} is declared twice",
                    endpoint.id
                )));
            }
            if endpoint.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} has capacity 0",
                    endpoint.id
                )));
            }
        }

        for stage in &self.stages {
            if let TransformSpec::Command { program, .. } = &stage.transform
                && program.trim().is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "stage {:?} has a command transform without a program",
                    stage.name
                )));
            }
        }

        self.topology()?;
        Ok(())
    }

    pub fn topology(&self) -> Result<Topology, TopologyError> {
        Topology::new(
            &self.root,
            self.holding.clone(),
            self.stages.iter().map(StageConfig::spec).collect(),
        )
    }

    pub fn lease_dir(&self) -> PathBuf {
        self.lease_dir
            .clone()
            .unwrap_or_else(|| self.root.join("locks"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.root.join("logs"))
    }

    pub fn stop_file(&self) -> PathBuf {
        self.stop_file
            .clone()
            .unwrap_or_else(|| self.root.join("ALL_STOP"))
    }
}
