use std::{
    io::{Cursor, SeekFrom},
    path::PathBuf,
};

use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncSeekExt, BufReader, Stdin},
};

use crate::error::Result;

/// Where a decode provider reads its input from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    File { path: PathBuf },
    Stdin,
    Inline { data: String },
}

impl DataSource {
    pub async fn open(&self) -> Result<SourceReader> {
        Ok(match self {
            DataSource::File { path } => SourceReader::File(BufReader::new(File::open(path).await?)),
            DataSource::Stdin => SourceReader::Stdin(BufReader::new(tokio::io::stdin())),
            DataSource::Inline { data } => SourceReader::Inline(Cursor::new(data.clone().into_bytes())),
        })
    }
}

/// An opened [`DataSource`].
pub enum SourceReader {
    File(BufReader<File>),
    Stdin(BufReader<Stdin>),
    Inline(Cursor<Vec<u8>>),
}

impl SourceReader {
    pub fn reader(&mut self) -> &mut (dyn AsyncBufRead + Send + Unpin) {
        match self {
            SourceReader::File(file) => file,
            SourceReader::Stdin(stdin) => stdin,
            SourceReader::Inline(cursor) => cursor,
        }
    }

    /// Seeks back to the beginning. Returns `false` for sources that cannot be replayed.
    pub async fn rewind(&mut self) -> Result<bool> {
        match self {
            SourceReader::File(file) => {
                file.seek(SeekFrom::Start(0)).await?;
                Ok(true)
            }
            SourceReader::Inline(cursor) => {
                cursor.set_position(0);
                Ok(true)
            }
            SourceReader::Stdin(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncBufReadExt;

    use super::*;

    async fn first_line(reader: &mut SourceReader) -> String {
        let mut line = String::new();
        reader.reader().read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn file_source_rewinds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "one").unwrap();
        writeln!(file, "two").unwrap();

        let source = DataSource::File {
            path: file.path().to_path_buf(),
        };
        let mut reader = source.open().await.unwrap();
        assert_eq!(first_line(&mut reader).await, "one\n");
        assert_eq!(first_line(&mut reader).await, "two\n");
        assert!(reader.rewind().await.unwrap());
        assert_eq!(first_line(&mut reader).await, "one\n");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = DataSource::File {
            path: "/definitely/not/here".into(),
        };
        assert!(matches!(source.open().await, Err(crate::Error::Io(_))));
    }

    #[test]
    fn parses_tagged_sources() {
        let source: DataSource =
            serde_json::from_str(r#"{"type": "file", "path": "ammo.jsonl"}"#).unwrap();
        assert_eq!(
            source,
            DataSource::File {
                path: "ammo.jsonl".into()
            }
        );
        let source: DataSource = serde_json::from_str(r#"{"type": "stdin"}"#).unwrap();
        assert_eq!(source, DataSource::Stdin);
    }
}
