//! `~/.procvar/config.toml` loading.
//!
//! Every section is optional; a missing file means defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

use procvar_codec::{
    ByteCodec, CodecLimits, DEFAULT_MAX_DEPTH, Extensibility, Mutability, RegistryError,
    TypeDescriptor, TypeRegistry,
};
use procvar_context::{ControllerOptions, VariableController};
use procvar_types::{FlushPolicy, InvalidTypeName, TypeName};

/// Overrides the default config location.
pub const CONFIG_ENV: &str = "PROCVAR_CONFIG";

const fn default_true() -> bool {
    true
}

const fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

const fn default_version() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcvarConfig {
    pub proxy: Option<ProxyConfig>,
    pub flush: Option<FlushConfig>,
    pub codec: Option<CodecConfig>,
    pub logging: Option<LoggingConfig>,
    /// Application types available to the codec, in addition to the builtins.
    #[serde(default)]
    pub types: Vec<TypeConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    /// Hand out change-tracking proxies. When off, every loaded composite is
    /// re-encoded at flush.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlushConfig {
    #[serde(default)]
    pub policy: FlushPolicy,
}

#[derive(Debug, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// One `[[types]]` entry.
#[derive(Debug, Deserialize)]
pub struct TypeConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub parent: Option<String>,
    #[serde(default)]
    pub supersedes: Vec<String>,
    /// Declared field schema. Absent means any fields are kept.
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub sealed: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum TypeConfigError {
    #[error("invalid type name {name:?} in [[types]]")]
    InvalidName {
        name: String,
        #[source]
        source: InvalidTypeName,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ProcvarConfig {
    /// Load from `$PROCVAR_CONFIG` or `~/.procvar/config.toml`.
    ///
    /// `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn proxying_enabled(&self) -> bool {
        self.proxy.as_ref().is_none_or(|proxy| proxy.enabled)
    }

    #[must_use]
    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush.as_ref().map(|flush| flush.policy).unwrap_or_default()
    }

    #[must_use]
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_depth: self
                .codec
                .as_ref()
                .map_or(DEFAULT_MAX_DEPTH, |codec| codec.max_depth),
        }
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.logging.as_ref()?.filter.as_deref()
    }

    #[must_use]
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            proxying: self.proxying_enabled(),
            flush_policy: self.flush_policy(),
        }
    }

    /// Builtin types plus every `[[types]]` entry.
    ///
    /// Entries may be listed in any order; a parent is registered before its
    /// children.
    pub fn type_registry(&self) -> Result<TypeRegistry, TypeConfigError> {
        let mut pending = self
            .types
            .iter()
            .map(TypeConfig::descriptor)
            .collect::<Result<Vec<_>, _>>()?;
        let mut registry = TypeRegistry::new();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for descriptor in pending {
                let ready = descriptor
                    .parent_name()
                    .is_none_or(|parent| registry.contains(parent));
                if ready {
                    registry.register(descriptor)?;
                } else {
                    deferred.push(descriptor);
                }
            }
            if deferred.len() == before {
                // Nothing became ready: the first remaining entry names a
                // parent that is never declared (or a parent cycle).
                if let Some(descriptor) = deferred.into_iter().next() {
                    registry.register(descriptor)?;
                }
                break;
            }
            pending = deferred;
        }
        Ok(registry)
    }

    pub fn codec(&self) -> Result<ByteCodec, TypeConfigError> {
        let registry = Arc::new(self.type_registry()?);
        Ok(ByteCodec::new(registry).with_limits(self.codec_limits()))
    }

    pub fn controller(&self) -> Result<VariableController, TypeConfigError> {
        let registry = Arc::new(self.type_registry()?);
        Ok(VariableController::new(registry)
            .with_limits(self.codec_limits())
            .with_options(self.controller_options()))
    }
}

impl TypeConfig {
    fn descriptor(&self) -> Result<TypeDescriptor, TypeConfigError> {
        let name = type_name(&self.name)?;
        let mut descriptor = TypeDescriptor::new(name).version(self.version);
        if let Some(parent) = &self.parent {
            descriptor = descriptor.parent(type_name(parent)?);
        }
        for old in &self.supersedes {
            descriptor = descriptor.supersedes(type_name(old)?);
        }
        if let Some(fields) = &self.fields {
            descriptor = descriptor.fields(fields.iter().cloned());
        }
        if self.immutable {
            descriptor = descriptor.mutability(Mutability::Immutable);
        }
        if self.sealed {
            descriptor = descriptor.extensibility(Extensibility::Sealed);
        }
        Ok(descriptor)
    }
}

fn type_name(name: &str) -> Result<TypeName, TypeConfigError> {
    TypeName::new(name).map_err(|source| TypeConfigError::InvalidName {
        name: name.to_string(),
        source,
    })
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".procvar").join("config.toml"))
}
