//! `KEY=VALUE` environment files, read with `dotenvy`.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::errors::ConfigError;

/// Env files looked up in order; the first one found is the only one loaded.
pub const ENV_FILES: [&str; 2] = ["local.env", ".env"];

/// Reads every entry of one env file without touching the process
/// environment.
pub fn read(path: &Path) -> Result<Vec<(String, String)>, ConfigError> {
    let env_error = |reason: String| ConfigError::EnvFile {
        path: path.display().to_string(),
        reason,
    };
    dotenvy::from_path_iter(path)
        .map_err(|e| env_error(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| env_error(e.to_string()))
}

/// Loads the first env file that exists in `dir`.
///
/// Returns `None` if neither file exists.
pub fn load(dir: &Path) -> Result<Option<(PathBuf, Vec<(String, String)>)>, ConfigError> {
    for name in ENV_FILES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let vars = read(&path)?;
        info!(path = %path.display(), count = vars.len(), "✅ Loaded environment file");
        return Ok(Some((path, vars)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_env(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_read_quoting_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_env(
            &dir,
            ".env",
            r#"
# credentials
export AWS_REGION=us-east-1
MESSAGE="hello # not a comment"
QUOTED="a\"b"
RAW='a\nb'
EMPTY=
"#,
        );

        let vars = read(&path).unwrap();
        assert_eq!(
            vars,
            vec![
                ("AWS_REGION".to_string(), "us-east-1".to_string()),
                ("MESSAGE".to_string(), "hello # not a comment".to_string()),
                ("QUOTED".to_string(), "a\"b".to_string()),
                ("RAW".to_string(), "a\\nb".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_read_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_env(&dir, ".env", "NOT A PAIR\n");

        let err = read(&path).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFile { .. }));
        assert!(err.to_string().contains(".env"));
    }

    #[test]
    fn test_local_env_wins_over_dot_env() {
        let dir = tempfile::tempdir().unwrap();
        write_env(&dir, ".env", "SOURCE=dotenv\n");
        write_env(&dir, "local.env", "SOURCE=local\n");

        let (path, vars) = load(dir.path()).unwrap().unwrap();
        assert!(path.ends_with("local.env"));
        assert_eq!(vars, vec![("SOURCE".to_string(), "local".to_string())]);
    }

    #[test]
    fn test_dot_env_used_when_local_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_env(&dir, ".env", "SOURCE=dotenv\n");

        let (path, vars) = load(dir.path()).unwrap().unwrap();
        assert!(path.ends_with(".env"));
        assert_eq!(vars, vec![("SOURCE".to_string(), "dotenv".to_string())]);
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }
}
