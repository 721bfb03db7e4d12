use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

use crate::error::{MrError, Result};
use crate::map_reduce_apps::{InvertedIndex, WordCount};

pub use crate::rpc::proto::KeyValue;

/// {key: reduce_output}
pub type Output = std::collections::HashMap<String, String>;

pub trait MapReduceApp: Send + Sync {
    fn map(&self, filename: &str, contents: &str) -> Vec<KeyValue>;
    fn reduce(&self, key: &str, values: &[String]) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    WordCount,
    InvertedIndex,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::WordCount => "wc",
            Operation::InvertedIndex => "ii",
        }
    }

    pub fn app(&self) -> Box<dyn MapReduceApp> {
        match self {
            Operation::WordCount => Box::new(WordCount {}),
            Operation::InvertedIndex => Box::new(InvertedIndex {}),
        }
    }
}

impl FromStr for Operation {
    type Err = MrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wc" | "word-count" => Ok(Operation::WordCount),
            "ii" | "inverted-index" => Ok(Operation::InvertedIndex),
            other => Err(MrError::TaskExecution(format!(
                "unknown operation '{}', expected wc or ii",
                other
            ))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn kv(key: impl Into<String>, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.into(),
        value: value.into(),
    }
}

/// Regular files of `input_dir` as (file name, path), sorted by name.
pub fn read_files_from_dir(input_dir: impl AsRef<Path>) -> Result<Vec<(String, PathBuf)>> {
    let input_dir = input_dir.as_ref();
    let mut input: Vec<_> = Vec::new();
    for entry in fs::read_dir(input_dir).map_err(|e| MrError::io(input_dir, e))? {
        let entry = entry.map_err(|e| MrError::io(input_dir, e))?;
        let path = entry.path();

        if path.is_file() {
            if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                input.push((filename.to_string(), path.clone()));
            }
        }
    }
    input.sort();
    Ok(input)
}

/// Strips any directory part so a remote-supplied name stays inside our root.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .ok_or_else(|| MrError::TaskExecution(format!("invalid file name '{}'", name)))?;
    Ok(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operation_aliases() {
        assert_eq!("wc".parse::<Operation>().unwrap(), Operation::WordCount);
        assert_eq!(
            "inverted-index".parse::<Operation>().unwrap(),
            Operation::InvertedIndex
        );
        assert!(matches!(
            "grep".parse::<Operation>(),
            Err(MrError::TaskExecution(_))
        ));
    }

    #[test]
    fn lists_only_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = read_files_from_dir(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn sanitize_drops_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("a.txt").unwrap(), "a.txt");
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("").is_err());
    }
}
