//! Environment variable providers.

use std::collections::HashMap;
use std::path::Path;

/// A string-based, key/value source of configuration variables.
pub trait Provider: Send + Sync {
    /// Returns the value associated with `key`, if present.
    fn lookup(&self, key: &str) -> Option<String>;
}

/// The production provider. Tries to read variables from external sources
/// in order of precedence:
/// - OS environment variables.
/// - Values from any `.env` file that may exist.
///
/// Empty values are treated as "not present" in both sources, so that an
/// exported-but-blank variable falls through to `.env` rather than
/// shadowing it.
pub struct DefaultProvider {
    dot_env: HashMap<String, String>,
}

impl DefaultProvider {
    pub fn new() -> Self {
        Self::from_dot_env_path(Path::new(".env"))
    }

    /// Builds a provider whose `.env` entries come from the given path.
    pub fn from_dot_env_path(path: &Path) -> Self {
        Self {
            dot_env: parse_dot_env(path),
        }
    }
}

impl Default for DefaultProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for DefaultProvider {
    fn lookup(&self, key: &str) -> Option<String> {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }

        match self.dot_env.get(key) {
            Some(value) if !value.is_empty() => Some(value.clone()),
            _ => None,
        }
    }
}

/// A provider backed by a fixed map. Used by tests in place of
/// [`DefaultProvider`] so they never observe the ambient environment.
pub struct MapProvider {
    values: HashMap<String, String>,
}

impl MapProvider {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MapProvider {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl Provider for MapProvider {
    fn lookup(&self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some(value) if !value.is_empty() => Some(value.clone()),
            _ => None,
        }
    }
}

/// Parses a `.env` file into a map. A missing file is fine; entries are
/// `KEY=VALUE`, one per line, with blank lines and `#` comments skipped.
/// A single pair of decorative double-quotes around the value is stripped.
fn parse_dot_env(path: &Path) -> HashMap<String, String> {
    let mut results = HashMap::new();

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return results,
    };

    for raw_line in contents.lines() {
        let line = raw_line.trim_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let separator = match line.find('=') {
            Some(index) if index != line.len() - 1 => index,
            _ => {
                tracing::warn!(line = %line, "invalid dotenv line");
                continue;
            }
        };

        let key = line[..separator].trim_matches([' ', '\t']);
        let mut value = line[separator + 1..].trim_matches([' ', '\t']);
        value = value.strip_prefix('"').unwrap_or(value);
        value = value.strip_suffix('"').unwrap_or(value);

        results.insert(key.to_string(), value.to_string());
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_dot_env(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("relay-dotenv-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_basic_entries() {
        let path = write_dot_env(
            "basic",
            "FOO=bar\n# a comment\n\nBAZ = qux \nQUOTED=\"hello world\"\n",
        );
        let provider = DefaultProvider::from_dot_env_path(&path);

        assert_eq!(provider.lookup("FOO").as_deref(), Some("bar"));
        assert_eq!(provider.lookup("BAZ").as_deref(), Some("qux"));
        assert_eq!(provider.lookup("QUOTED").as_deref(), Some("hello world"));
        assert_eq!(provider.lookup("MISSING"), None);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn skips_invalid_lines() {
        let path = write_dot_env("invalid", "NOVALUE=\nNOSEPARATOR\nGOOD=1\n");
        let provider = DefaultProvider::from_dot_env_path(&path);

        assert_eq!(provider.lookup("NOVALUE"), None);
        assert_eq!(provider.lookup("NOSEPARATOR"), None);
        assert_eq!(provider.lookup("GOOD").as_deref(), Some("1"));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn quotes_are_decoration_not_escapes() {
        let path = write_dot_env("quotes", "A=\"left\nB=right\"\nC=\"\"\n");
        let provider = DefaultProvider::from_dot_env_path(&path);

        assert_eq!(provider.lookup("A").as_deref(), Some("left"));
        assert_eq!(provider.lookup("B").as_deref(), Some("right"));
        // Fully-quoted empty value collapses to empty, which reads as absent.
        assert_eq!(provider.lookup("C"), None);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_yields_empty_provider() {
        let provider =
            DefaultProvider::from_dot_env_path(Path::new("/nonexistent/definitely-not-here.env"));
        assert_eq!(provider.lookup("ANYTHING_AT_ALL_XYZ"), None);
    }

    #[test]
    fn map_provider_treats_empty_as_absent() {
        let provider = MapProvider::from([("SET", "value"), ("EMPTY", "")]);
        assert_eq!(provider.lookup("SET").as_deref(), Some("value"));
        assert_eq!(provider.lookup("EMPTY"), None);
    }
}
