//! Runtime registry
//!
//! Built once from configuration at startup and read-only afterwards. A
//! [`LanguageId`] can only be obtained by resolving a name against the
//! registry, so code past the gateway never handles unknown languages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, Language};
use crate::isolate::{IsolateError, validate_mounts};
use crate::types::{MountConfig, ResourceLimits};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported language '{0}'")]
    UnknownLanguage(String),

    #[error("no languages configured")]
    Empty,

    #[error("language '{language}': {message}")]
    InvalidProfile { language: String, message: String },

    #[error("language '{language}': {source}")]
    Mount {
        language: String,
        #[source]
        source: IsolateError,
    },
}

/// Canonical identifier of a registered language
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LanguageId(Arc<str>);

impl LanguageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a sandboxed program is allowed to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub max_processes: Option<u32>,
    pub max_open_files: Option<u32>,
    /// Boxes never get a network namespace with connectivity
    pub network: bool,
}

/// Everything needed to run one language
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    pub language_id: LanguageId,
    pub display_name: String,
    pub version: Option<String>,
    /// Run command template; together with `mounts` this is the language image
    pub image_reference: String,
    pub cpu_limit: Option<Duration>,
    pub memory_limit_bytes: Option<u64>,
    pub wall_clock_limit: Duration,
    pub capabilities: Capabilities,
    /// Full isolate limits for the run step
    pub limits: ResourceLimits,
    /// Limits for the compile step, if any
    pub compile_limits: Option<ResourceLimits>,
    pub mounts: Vec<MountConfig>,
    pub language: Language,
}

impl RuntimeProfile {
    fn build(id: LanguageId, language: &Language, config: &Config) -> Result<Self, RegistryError> {
        let limits = config.effective_limits(language);
        let wall_clock_limit = limits
            .wall_clock()
            .ok_or_else(|| RegistryError::InvalidProfile {
                language: id.to_string(),
                message: "needs a positive wall_time_limit or time_limit".to_owned(),
            })?;

        validate_mounts(&language.run.mounts).map_err(|source| RegistryError::Mount {
            language: id.to_string(),
            source,
        })?;

        let compile_limits = language.compile.as_ref().map(|compile| match compile.limits {
            Some(ref overrides) => limits.with_overrides(overrides),
            None => limits.clone(),
        });

        Ok(Self {
            display_name: language.name.clone(),
            version: language.version.clone(),
            image_reference: language.run.command.join(" "),
            cpu_limit: limits
                .time_limit
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64),
            memory_limit_bytes: limits.memory_limit_bytes(),
            wall_clock_limit,
            capabilities: Capabilities {
                max_processes: limits.max_processes,
                max_open_files: limits.max_open_files,
                network: false,
            },
            limits,
            compile_limits,
            mounts: language.run.mounts.clone(),
            language: language.clone(),
            language_id: id,
        })
    }
}

/// Public description of a language, as listed by `GET /languages`
#[derive(Debug, Clone, Serialize)]
pub struct LanguageSummary {
    pub id: LanguageId,
    pub name: String,
    pub version: Option<String>,
    pub aliases: Vec<String>,
    pub compiled: bool,
    pub cpu_limit_ms: Option<u64>,
    pub wall_clock_limit_ms: u64,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct RuntimeRegistry {
    profiles: HashMap<LanguageId, Arc<RuntimeProfile>>,
    /// Lowercased ids and aliases to canonical ids
    names: HashMap<String, LanguageId>,
}

impl RuntimeRegistry {
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        if config.languages.is_empty() {
            return Err(RegistryError::Empty);
        }
        validate_mounts(&config.sandbox_mounts).map_err(|source| RegistryError::Mount {
            language: "*".to_owned(),
            source,
        })?;

        let mut profiles = HashMap::new();
        let mut names = HashMap::new();
        for (name, language) in &config.languages {
            let id = LanguageId(Arc::from(name.to_lowercase()));
            for alias in std::iter::once(name).chain(&language.aliases) {
                names.insert(alias.to_lowercase(), id.clone());
            }
            let profile = RuntimeProfile::build(id.clone(), language, config)?;
            profiles.insert(id, Arc::new(profile));
        }

        Ok(Self { profiles, names })
    }

    /// Resolve a caller-supplied name (id or alias, case-insensitive)
    pub fn resolve(&self, name: &str) -> Result<LanguageId, RegistryError> {
        self.names
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownLanguage(name.to_owned()))
    }

    pub fn profile(&self, id: &LanguageId) -> Option<Arc<RuntimeProfile>> {
        self.profiles.get(id).cloned()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RuntimeProfile>> {
        self.resolve(name).ok().and_then(|id| self.profile(&id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &LanguageId> {
        self.profiles.keys()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Languages sorted by id
    pub fn summaries(&self) -> Vec<LanguageSummary> {
        let mut summaries: Vec<_> = self
            .profiles
            .values()
            .map(|p| LanguageSummary {
                id: p.language_id.clone(),
                name: p.display_name.clone(),
                version: p.version.clone(),
                aliases: p.language.aliases.clone(),
                compiled: p.language.is_compiled(),
                cpu_limit_ms: p.cpu_limit.map(|d| d.as_millis() as u64),
                wall_clock_limit_ms: p.wall_clock_limit.as_millis() as u64,
                memory_limit_bytes: p.memory_limit_bytes,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}
