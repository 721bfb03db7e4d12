//! Intermediate data on disk.
//!
//! Map workers write one [`BucketFile`] per (task, bucket index). The identifier is stored
//! inside the file, so forwarding never depends on parsing the file name. Reduce workers
//! stage forwarded buckets in the same format under the same name, so a bucket delivered
//! twice replaces its earlier copy.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use prost::Message;
use uuid::Uuid;

use crate::common::{KeyValue, Operation};
use crate::error::{MrError, Result};
use crate::rpc::proto::BucketFile;

pub const BUCKET_EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId {
    pub operation: Operation,
    pub task_id: u32,
    pub bucket_index: u32,
}

impl BucketId {
    pub fn file_name(&self) -> String {
        format!(
            "{}_task_{}_bucket_{}.{}",
            self.operation, self.task_id, self.bucket_index, BUCKET_EXTENSION
        )
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/task {}/bucket {}",
            self.operation, self.task_id, self.bucket_index
        )
    }
}

impl FromStr for BucketId {
    type Err = MrError;

    /// Parses `<op>_task_<id>_bucket_<index>.bin`.
    fn from_str(name: &str) -> Result<Self> {
        let invalid = || MrError::Serialization(format!("'{}' is not a bucket file name", name));

        let stem = name
            .strip_suffix(BUCKET_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let (operation, rest) = stem.split_once("_task_").ok_or_else(invalid)?;
        let (task_id, bucket_index) = rest.split_once("_bucket_").ok_or_else(invalid)?;

        Ok(BucketId {
            operation: operation.parse().map_err(|_| invalid())?,
            task_id: task_id.parse().map_err(|_| invalid())?,
            bucket_index: bucket_index.parse().map_err(|_| invalid())?,
        })
    }
}

pub fn encode_bucket(id: &BucketId, pairs: Vec<KeyValue>) -> Vec<u8> {
    BucketFile {
        operation: id.operation.to_string(),
        task_id: id.task_id,
        bucket_index: id.bucket_index,
        pairs,
    }
    .encode_to_vec()
}

pub fn decode_bucket(bytes: &[u8]) -> Result<(BucketId, Vec<KeyValue>)> {
    let file = BucketFile::decode(bytes)?;
    let operation = file
        .operation
        .parse()
        .map_err(|_| MrError::Serialization(format!("unknown operation '{}'", file.operation)))?;
    let id = BucketId {
        operation,
        task_id: file.task_id,
        bucket_index: file.bucket_index,
    };
    Ok((id, file.pairs))
}

/// Writes `dir/<id file name>` through a temporary file and a rename, replacing any
/// earlier copy of the same bucket as a whole.
pub async fn write_bucket(dir: &Path, id: &BucketId, pairs: Vec<KeyValue>) -> Result<()> {
    let path = dir.join(id.file_name());
    let tmp = dir.join(format!(".{}.{}.tmp", id.file_name(), Uuid::new_v4()));
    let bytes = encode_bucket(id, pairs);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| MrError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| MrError::io(&path, e))
}

pub async fn read_bucket(path: &Path) -> Result<(BucketId, Vec<KeyValue>)> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| MrError::io(path, e))?;
    decode_bucket(&bytes)
}

pub fn is_bucket_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(BUCKET_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::kv;

    fn id(task_id: u32, bucket_index: u32) -> BucketId {
        BucketId {
            operation: Operation::WordCount,
            task_id,
            bucket_index,
        }
    }

    #[test]
    fn file_name_round_trips_multi_digit_indices() {
        let original = id(12, 31);
        assert_eq!(original.file_name(), "wc_task_12_bucket_31.bin");
        assert_eq!(original.file_name().parse::<BucketId>().unwrap(), original);
    }

    #[test]
    fn rejects_foreign_file_names() {
        for name in ["logs.txt", "wc_task_x_bucket_1.bin", "grep_task_1_bucket_1.bin", "wc_task_1.bin"] {
            assert!(name.parse::<BucketId>().is_err(), "{} parsed", name);
        }
    }

    #[test]
    fn bucket_round_trip_preserves_order_and_header() {
        let pairs = vec![kv("b", "1"), kv("a", ""), kv("b", "x,y")];
        let bytes = encode_bucket(&id(3, 1), pairs.clone());
        let (decoded_id, decoded) = decode_bucket(&bytes).unwrap();
        assert_eq!(decoded_id, id(3, 1));
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn corrupt_bucket_is_serialization_error() {
        assert!(matches!(
            decode_bucket(&[0xff, 0xff, 0xff]),
            Err(MrError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn rewriting_a_bucket_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), &id(0, 0), vec![kv("the", "1")]).await.unwrap();
        write_bucket(dir.path(), &id(0, 0), vec![kv("the", "1"), kv("cat", "1")])
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![id(0, 0).file_name()]);

        let (read_id, pairs) = read_bucket(&dir.path().join(id(0, 0).file_name()))
            .await
            .unwrap();
        assert_eq!(read_id, id(0, 0));
        assert_eq!(pairs, vec![kv("the", "1"), kv("cat", "1")]);
    }

    #[test]
    fn only_bin_files_are_buckets() {
        assert!(is_bucket_file(Path::new("wc_task_0_bucket_0.bin")));
        assert!(!is_bucket_file(Path::new(".wc_task_0_bucket_0.bin.1234.tmp")));
        assert!(!is_bucket_file(Path::new("logs.txt")));
    }
}
