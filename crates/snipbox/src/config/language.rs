use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::{MountConfig, ResourceLimits};

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Default PATH inside the sandbox
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A runtime snippets can be submitted for (e.g. `[languages.python]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name shown by the widget (e.g. "Python 3")
    pub name: String,

    /// Source file extension
    pub extension: FileExtension,

    /// Other identifiers accepted for this runtime (e.g. "python3", "py")
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Interpreter or toolchain version reported to clients
    #[serde(default)]
    pub version: Option<String>,

    /// Build step for compiled runtimes
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    pub run: RunConfig,
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Name of the file the snippet is written to inside the sandbox
    pub fn source_name(&self) -> String {
        match self.compile {
            Some(ref compile) => compile.source_name.clone(),
            None => format!("main.{}", self.extension),
        }
    }

    /// Name of the artifact the run command refers to as `{binary}`
    pub fn binary_name(&self) -> String {
        match self.compile {
            Some(ref compile) => compile.output_name.clone(),
            None => self.source_name(),
        }
    }

    /// Substitute `{source}`, `{output}` and `{binary}` in a command template
    pub fn expand_command(command: &[String], source: &str, binary: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
            })
            .collect()
    }

    /// Fully expanded run command for this language
    pub fn run_command(&self) -> Vec<String> {
        Self::expand_command(&self.run.command, &self.source_name(), &self.binary_name())
    }

    /// Fully expanded compile command, if the language has a build step
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile
            .as_ref()
            .map(|c| Self::expand_command(&c.command, &c.source_name, &c.output_name))
    }
}

/// File extension without dot (e.g. "py")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        if extension.contains(INVALID_FILE_EXT_CHARS) {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build step run in the same sandbox before the program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Placeholders: {source}, {output}
    pub command: Vec<String>,

    pub source_name: String,

    pub output_name: String,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Overrides the run limits for the build step
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// How the snippet is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Placeholders: {source}, {binary}
    pub command: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Extra read-only directories the runtime needs
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Overrides `default_limits` field by field
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}
