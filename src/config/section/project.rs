//! `[[project]]` entries registered when the daemon boots.
//!
//! ```toml
//! [[project]]
//! id = "landing"
//! name = "Landing page"
//! root = "~/sites/landing"    # Relative paths resolve against the config dir
//! autostart = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::ProjectId;
use crate::utils::path::normalize_path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: ProjectId,
    #[serde(default)]
    pub name: Option<String>,
    pub root: PathBuf,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl ProjectEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    /// Expand `~` and resolve relative roots against the config directory.
    pub fn normalize(&mut self, config_dir: &Path) {
        let expanded = shellexpand::tilde(self.root.to_str().unwrap_or_default()).into_owned();
        let path = PathBuf::from(expanded);
        let full = if path.is_relative() {
            config_dir.join(path)
        } else {
            path
        };
        self.root = normalize_path(&full);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::test_parse_config;

    #[test]
    fn test_project_entries() {
        let config = test_parse_config(
            "[[project]]\nid = \"a\"\nroot = \"sites/a\"\n\n[[project]]\nid = \"b\"\nname = \"Bee\"\nroot = \"/srv/b\"\nautostart = false",
        );
        assert_eq!(config.projects.len(), 2);
        assert_eq!(config.projects[0].display_name(), "a");
        assert!(config.projects[0].autostart);
        assert_eq!(config.projects[1].display_name(), "Bee");
        assert!(!config.projects[1].autostart);
    }

    #[test]
    fn test_normalize_relative_root() {
        let mut config = test_parse_config("[[project]]\nid = \"a\"\nroot = \"sites/a\"");
        let entry = &mut config.projects[0];
        entry.normalize(Path::new("/etc/previewd"));
        assert_eq!(entry.root, Path::new("/etc/previewd/sites/a"));
    }
}
