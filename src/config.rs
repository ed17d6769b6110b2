//! Shell configuration from `~/.drvshrc` and the environment.
//!
//! The rc file is plain `KEY=VALUE` lines (`#` starts a comment):
//! - `BASE_DIR` — directory holding the driver sockets
//! - `PROMPT` — prompt string
//!
//! Environment variables `DRVSH_BASE_DIR` and `DRVSH_PROMPT` override the
//! file; a command-line argument overrides both.

use std::env;
use std::fs;
use std::path::PathBuf;

const RC_FILE_NAME: &str = ".drvshrc";

const DEFAULT_PROMPT: &str = "> ";

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub base_dir: PathBuf,
    pub prompt: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl ShellConfig {
    /// Defaults, overlaid by the rc file, overlaid by the environment.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(rc_path) = Self::rc_path() {
            if let Ok(content) = fs::read_to_string(&rc_path) {
                config.apply_rc(&content);
            }
        }

        config.apply_env();
        config
    }

    fn rc_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(RC_FILE_NAME))
    }

    fn apply_rc(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "BASE_DIR" if !value.is_empty() => self.base_dir = PathBuf::from(value),
                "PROMPT" => self.prompt = value.to_string(),
                _ => {}
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(dir) = env::var_os("DRVSH_BASE_DIR") {
            if !dir.is_empty() {
                self.base_dir = PathBuf::from(dir);
            }
        }
        if let Ok(prompt) = env::var("DRVSH_PROMPT") {
            self.prompt = prompt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.base_dir, PathBuf::from("."));
        assert_eq!(config.prompt, "> ");
    }

    #[test]
    fn test_rc_parsing() {
        let mut config = ShellConfig::default();
        config.apply_rc(
            "# drvsh settings\n\
             BASE_DIR = /tmp/drivers\n\
             PROMPT = $ \n\
             UNKNOWN = ignored\n\
             not a setting\n",
        );
        assert_eq!(config.base_dir, PathBuf::from("/tmp/drivers"));
        assert_eq!(config.prompt, "$");
    }

    #[test]
    fn test_rc_ignores_empty_base_dir() {
        let mut config = ShellConfig::default();
        config.apply_rc("BASE_DIR =\n");
        assert_eq!(config.base_dir, PathBuf::from("."));
    }
}
