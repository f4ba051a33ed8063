//! JIT configuration options.

use serde::Deserialize;

/// Error type for loading options from a config file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "could not read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "could not parse config file: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Tunable options for the JIT.
///
/// There are no global options: whoever builds the JIT instance owns an
/// `Options` value and threads it (or a reference) to the code that needs it.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the executable memory region, in MiB. The region is split
    /// in half between the inline and outlined code blocks.
    pub exec_mem_size: usize,

    /// Number of calls to a bytecode sequence before it is compiled.
    pub call_threshold: u64,

    /// Maximum number of block versions kept per bytecode location.
    pub max_versions: usize,

    /// Hold out for an exact context match while under the version limit
    /// instead of settling for the closest compatible version.
    pub greedy_versioning: bool,

    /// Disable type learning: contexts never record specific types.
    pub no_type_prop: bool,

    /// Print a line to stderr for compilation, stub-hit and invalidation
    /// events.
    pub trace_jit: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            exec_mem_size: 16,
            call_threshold: 10,
            max_versions: 4,
            greedy_versioning: false,
            no_type_prop: false,
            trace_jit: false,
        }
    }
}

/// On-disk form of [`Options`]. Every field is optional; missing fields
/// keep their defaults.
#[derive(Debug, Default, Deserialize)]
pub struct OptionsFile {
    pub exec_mem_size: Option<usize>,
    pub call_threshold: Option<u64>,
    pub max_versions: Option<usize>,
    pub greedy_versioning: Option<bool>,
    pub no_type_prop: Option<bool>,
    pub trace_jit: Option<bool>,
}

impl Options {
    /// Load options from a TOML file, applying it on top of the defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let file: OptionsFile = toml::from_str(&text).map_err(ConfigError::Parse)?;

        let mut opts = Options::default();
        opts.apply_file(file);
        Ok(opts)
    }

    /// Overlay the set fields of an [`OptionsFile`] onto these options.
    pub fn apply_file(&mut self, file: OptionsFile) {
        if let Some(v) = file.exec_mem_size {
            self.exec_mem_size = v;
        }
        if let Some(v) = file.call_threshold {
            self.call_threshold = v;
        }
        if let Some(v) = file.max_versions {
            self.max_versions = v;
        }
        if let Some(v) = file.greedy_versioning {
            self.greedy_versioning = v;
        }
        if let Some(v) = file.no_type_prop {
            self.no_type_prop = v;
        }
        if let Some(v) = file.trace_jit {
            self.trace_jit = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.max_versions, 4);
        assert_eq!(opts.call_threshold, 10);
        assert!(!opts.greedy_versioning);
        assert!(!opts.no_type_prop);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_versions = 2").unwrap();
        writeln!(file, "greedy_versioning = true").unwrap();

        let opts = Options::from_file(file.path()).unwrap();
        assert_eq!(opts.max_versions, 2);
        assert!(opts.greedy_versioning);
        // Unset fields keep their defaults
        assert_eq!(opts.call_threshold, 10);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_versions = [nope").unwrap();

        assert!(Options::from_file(file.path()).is_err());
    }
}
