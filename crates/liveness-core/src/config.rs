//! Startup configuration for the native detector server.
//!
//! A [`ServerConfig`] is built once per session, validated right before the
//! server is launched, and then turned into the server's command line by
//! [`ServerConfig::launch_args`]. It can be assembled in code or loaded
//! from a TOML document:
//!
//! ```toml
//! executable_path = "/opt/liveness/bin/livenessDetectorServer"
//! model_path = "/opt/liveness/models/face_landmarker.task"
//! gestures_dirs = ["/opt/liveness/gestures"]
//! font_path = "/opt/liveness/fonts/DejaVuSans.ttf"
//! language = "en"
//! num_gestures = 2
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Language used when none is configured.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Gestures requested when none is configured.
pub const DEFAULT_NUM_GESTURES: u32 = 2;

/// Longest path a Unix domain socket address can hold (`sun_path` minus NUL).
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Separator the native server uses for list-valued arguments.
const LIST_SEPARATOR: &str = ":";

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a socket path no other session in this process will use.
///
/// Paths live in the user runtime directory when one exists and fall back
/// to the system temp directory.
pub fn unique_socket_path() -> PathBuf {
    let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(format!("liveness-{}-{n}.sock", std::process::id()))
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_num_gestures() -> u32 {
    DEFAULT_NUM_GESTURES
}

/// Configuration for one detector server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Path to the detector server executable.
    pub executable_path: PathBuf,

    /// Face landmark model file handed to the server.
    pub model_path: PathBuf,

    /// Directories holding gesture definitions (at least one).
    pub gestures_dirs: Vec<PathBuf>,

    /// Language tag for prompts rendered by the server.
    #[serde(default = "default_language")]
    pub language: String,

    /// Unix socket the server listens on.
    #[serde(default = "unique_socket_path")]
    pub socket_path: PathBuf,

    /// Number of gestures the subject must perform.
    #[serde(default = "default_num_gestures")]
    pub num_gestures: u32,

    /// Font used by the server to draw prompts.
    pub font_path: PathBuf,

    /// Extra localization directories.
    #[serde(default)]
    pub locales_dirs: Vec<PathBuf>,

    /// Restricts the challenge pool to these gesture names.
    #[serde(default)]
    pub gestures_list: Vec<String>,

    /// Appended verbatim after the standard arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl ServerConfig {
    /// Creates a configuration with default language, gesture count and a
    /// fresh socket path.
    pub fn new(
        executable_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        gestures_dir: impl Into<PathBuf>,
        font_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executable_path: executable_path.into(),
            model_path: model_path.into(),
            gestures_dirs: vec![gestures_dir.into()],
            language: default_language(),
            socket_path: unique_socket_path(),
            num_gestures: DEFAULT_NUM_GESTURES,
            font_path: font_path.into(),
            locales_dirs: Vec::new(),
            gestures_list: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded server config");
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    #[must_use]
    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    #[must_use]
    pub fn with_num_gestures(mut self, num_gestures: u32) -> Self {
        self.num_gestures = num_gestures;
        self
    }

    #[must_use]
    pub fn with_gestures_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gestures_dirs.push(dir.into());
        self
    }

    #[must_use]
    pub fn with_font_path(mut self, font_path: impl Into<PathBuf>) -> Self {
        self.font_path = font_path.into();
        self
    }

    #[must_use]
    pub fn with_locales_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.locales_dirs.push(dir.into());
        self
    }

    #[must_use]
    pub fn with_gestures_list<I, S>(mut self, gestures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gestures_list = gestures.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Checks that every path exists and is readable and that scalar fields
    /// are in range. Must pass before the server is launched.
    pub fn validate(&self) -> ConfigResult<()> {
        check_executable(&self.executable_path)?;
        check_file("model_path", &self.model_path)?;
        check_file("font_path", &self.font_path)?;

        if self.gestures_dirs.is_empty() {
            return Err(ConfigError::InvalidFieldValue {
                field: "gestures_dirs",
                value: "[]".to_string(),
                expected: "at least one directory",
            });
        }
        for dir in &self.gestures_dirs {
            check_list_entry("gestures_dirs", dir)?;
            check_dir("gestures_dir", dir)?;
        }
        for dir in &self.locales_dirs {
            check_list_entry("locales_dirs", dir)?;
            check_dir("locales_dir", dir)?;
        }

        let language_ok = !self.language.is_empty()
            && self
                .language
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !language_ok {
            return Err(ConfigError::InvalidFieldValue {
                field: "language",
                value: self.language.clone(),
                expected: "a language tag such as \"en\" or \"es-MX\"",
            });
        }

        if self.num_gestures == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "num_gestures",
                value: self.num_gestures.to_string(),
                expected: "at least 1",
            });
        }

        if let Some(bad) = self
            .gestures_list
            .iter()
            .find(|g| g.is_empty() || g.contains(LIST_SEPARATOR))
        {
            return Err(ConfigError::InvalidFieldValue {
                field: "gestures_list",
                value: bad.clone(),
                expected: "non-empty gesture names without ':'",
            });
        }

        self.validate_socket_path()
    }

    fn validate_socket_path(&self) -> ConfigResult<()> {
        let len = self.socket_path.as_os_str().len();
        if len == 0 || len > MAX_SOCKET_PATH_LEN {
            return Err(ConfigError::InvalidFieldValue {
                field: "socket_path",
                value: self.socket_path.display().to_string(),
                expected: "a non-empty path of at most 107 bytes",
            });
        }
        match self.socket_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => check_dir("socket directory", parent),
            _ => Ok(()),
        }
    }

    /// Builds the server's command line (without the program name).
    pub fn launch_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--model_path".into(),
            self.model_path.clone().into_os_string(),
            "--gestures_folder_path".into(),
            join_paths(&self.gestures_dirs),
            "--language".into(),
            self.language.clone().into(),
            "--socket_path".into(),
            self.socket_path.clone().into_os_string(),
            "--num_gestures".into(),
            self.num_gestures.to_string().into(),
            "--font_path".into(),
            self.font_path.clone().into_os_string(),
        ];

        if !self.locales_dirs.is_empty() {
            args.push("--locales_paths".into());
            args.push(join_paths(&self.locales_dirs));
        }
        if !self.gestures_list.is_empty() {
            args.push("--gestures_list".into());
            args.push(self.gestures_list.join(LIST_SEPARATOR).into());
        }
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }
}

fn join_paths(paths: &[PathBuf]) -> OsString {
    let mut joined = OsString::new();
    for (i, path) in paths.iter().enumerate() {
        if i > 0 {
            joined.push(LIST_SEPARATOR);
        }
        joined.push(path.as_os_str());
    }
    joined
}

/// Paths joined into a `:` list must not contain the separator themselves.
fn check_list_entry(field: &'static str, path: &Path) -> ConfigResult<()> {
    let raw = path.as_os_str().to_string_lossy();
    if raw.is_empty() || raw.contains(LIST_SEPARATOR) {
        return Err(ConfigError::InvalidFieldValue {
            field,
            value: raw.into_owned(),
            expected: "a non-empty path without ':'",
        });
    }
    Ok(())
}

fn check_executable(path: &Path) -> ConfigResult<()> {
    let meta = fs::metadata(path).map_err(|_| ConfigError::ExecutableNotFound {
        path: path.to_path_buf(),
    })?;
    if !meta.is_file() {
        return Err(ConfigError::ExecutableNotFound {
            path: path.to_path_buf(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ConfigError::InvalidPath {
                field: "executable_path",
                path: path.to_path_buf(),
                reason: "file is not executable".to_string(),
            });
        }
    }

    Ok(())
}

fn check_file(field: &'static str, path: &Path) -> ConfigResult<()> {
    let invalid = |reason: String| ConfigError::InvalidPath {
        field,
        path: path.to_path_buf(),
        reason,
    };
    let meta = fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }
    fs::File::open(path).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

fn check_dir(field: &'static str, path: &Path) -> ConfigResult<()> {
    fs::read_dir(path).map_err(|e| ConfigError::InvalidPath {
        field,
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}
