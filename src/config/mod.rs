//! Host configuration management for `previewd.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # One file per TOML section
//! ├── types/         # ConfigError, diagnostics, field paths
//! ├── util.rs        # Config file discovery
//! └── mod.rs         # HostConfig (this file)
//! ```
//!
//! # Sections
//!
//! | Section        | Purpose                                        |
//! |----------------|------------------------------------------------|
//! | `[runtime]`    | Runtime command, port pool, startup/stop bounds |
//! | `[watch]`      | Debounce window and extra ignore patterns      |
//! | `[queue]`      | Change queue tick, bound and retry policy      |
//! | `[conflict]`   | Default resolution strategy and expiry         |
//! | `[registry]`   | Project cap and idle eviction                  |
//! | `[relay]`      | Live update relay endpoint                     |
//! | `[admin]`      | Admin HTTP endpoint                            |
//! | `[[project]]`  | Projects registered at boot                    |

pub mod section;
pub mod types;
mod util;

use util::find_config_file;

pub use section::{
    AdminConfig, ConflictConfig, ProjectEntry, QueueConfig, RegistryConfig, RelayConfig,
    RuntimeConfig, WatchConfig,
};
pub use types::{ConfigDiagnostics, ConfigError, FieldPath};

use crate::{
    cli::{Cli, Commands},
    log,
};
use anyhow::{Context, Result, bail};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure representing `previewd.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Absolute path to the config file (internal use only)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory relative project roots resolve against (internal use only)
    #[serde(skip)]
    pub root: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub conflict: ConflictConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectEntry>,
}

impl HostConfig {
    /// Load configuration for the given CLI invocation.
    ///
    /// Searches upward from cwd for the config file. `serve` falls back to
    /// defaults when none exists; `check` requires one.
    pub fn load(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current working directory")?;

        let mut config = match find_config_file(&cli.config, &cwd) {
            Some(path) => {
                let mut config = Self::from_path(&path)?;
                config.config_path = crate::utils::path::normalize_path(&path);
                config
            }
            None if matches!(cli.command, Commands::Check) => {
                bail!(ConfigError::Validation(format!(
                    "config file '{}' not found",
                    cli.config.display()
                )));
            }
            None => {
                log!("warning"; "no {} found, using defaults", cli.config.display());
                Self::default()
            }
        };

        let root = config
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(cwd);
        config.finalize(&root);
        config.apply_command_options(cli);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file path with unknown field detection.
    fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored, path);
        }

        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    fn print_unknown_fields_warning(fields: &[String], path: &Path) {
        let display_path = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        log!("warning"; "unknown fields in {}, ignoring:", display_path);
        for field in fields {
            eprintln!("- {field}");
        }
    }

    /// Resolve paths against the config directory.
    fn finalize(&mut self, root: &Path) {
        self.root = crate::utils::path::normalize_path(root);
        for project in &mut self.projects {
            project.normalize(&self.root);
        }
    }

    /// Apply command-specific CLI overrides.
    fn apply_command_options(&mut self, cli: &Cli) {
        if let Commands::Serve {
            interface,
            relay_port,
            admin_port,
            no_autostart,
        } = &cli.command
        {
            if let Some(interface) = interface {
                self.relay.interface = *interface;
                self.admin.interface = *interface;
            }
            Self::update_option(&mut self.relay.port, relay_port.as_ref());
            Self::update_option(&mut self.admin.port, admin_port.as_ref());
            if *no_autostart {
                self.projects.iter_mut().for_each(|p| p.autostart = false);
            }
        }
    }

    /// Update config option if CLI value is provided.
    fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
        if let Some(option) = cli_option {
            *config_option = option.clone();
        }
    }

    // ========================================================================
    // validation
    // ========================================================================

    /// Validate configuration, collecting all errors at once.
    pub fn validate(&self) -> Result<()> {
        let diag = self.diagnostics();
        diag.print_warnings();
        diag.into_result()
            .map_err(|e| ConfigError::Diagnostics(e).into())
    }

    fn diagnostics(&self) -> ConfigDiagnostics {
        let mut diag = ConfigDiagnostics::new();

        self.runtime.validate(&mut diag);
        self.queue.validate(&mut diag);
        self.registry.validate(&mut diag);
        self.validate_projects(&mut diag);

        if self.relay.enable && self.admin.enable && self.relay.port == self.admin.port
            && self.relay.interface == self.admin.interface
        {
            diag.error(FieldPath::new("relay.port"), "collides with `admin.port`");
        }

        diag
    }

    fn validate_projects(&self, diag: &mut ConfigDiagnostics) {
        let mut seen = FxHashSet::default();
        for (index, project) in self.projects.iter().enumerate() {
            if project.id.as_str().trim().is_empty() {
                diag.error(FieldPath::indexed("project", index, "id"), "must not be empty");
            } else if !seen.insert(project.id.clone()) {
                diag.error(
                    FieldPath::indexed("project", index, "id"),
                    format!("duplicate project id `{}`", project.id),
                );
            }

            if !project.root.is_dir() {
                diag.warn(
                    FieldPath::indexed("project", index, "root"),
                    format!("`{}` is not a directory", project.root.display()),
                );
            }
        }

        if self.projects.len() > self.registry.max_projects {
            diag.error_with_hint(
                FieldPath::new("project"),
                format!(
                    "{} projects configured, registry holds {}",
                    self.projects.len(),
                    self.registry.max_projects
                ),
                "raise `registry.max_projects`",
            );
        }
    }
}

// ============================================================================
// Test Helpers (available to all modules via `use crate::config::test_*`)
// ============================================================================

/// Parse config, panicking on unknown fields to catch typos in tests.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> HostConfig {
    let (parsed, ignored) = HostConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

// ============================================================================
// tests
// ============================================================================
