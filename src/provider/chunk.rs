use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::decode::AmmoDecoder;
use crate::{ammo::Ammo, error::BoxError};

/// Outcome of decoding one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The chunk filled the ammo.
    Ammo,
    /// The chunk only changed decoder state (a header or directive applying
    /// to the ammo that follows).
    Meta,
}

pub trait ChunkAmmoDecoder<A: Ammo>: Send {
    fn decode_chunk(&mut self, chunk: &[u8], ammo: &mut A) -> Result<Decoded, BoxError>;
}

#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct LineError {
    pub line: u64,
    #[source]
    pub source: BoxError,
}

/// Feeds a [`ChunkAmmoDecoder`] one line at a time. Blank lines are skipped and
/// the trailing line break is stripped.
pub struct LineDecoder<C> {
    chunk: C,
    line: Vec<u8>,
    line_no: u64,
}

impl<C> LineDecoder<C> {
    pub fn new(chunk: C) -> Self {
        Self {
            chunk,
            line: Vec::new(),
            line_no: 0,
        }
    }
}

#[async_trait]
impl<A, C> AmmoDecoder<A> for LineDecoder<C>
where
    A: Ammo,
    C: ChunkAmmoDecoder<A>,
{
    async fn decode(
        &mut self,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        ammo: &mut A,
    ) -> Result<bool, BoxError> {
        loop {
            self.line.clear();
            if input.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(false);
            }
            self.line_no += 1;
            let chunk = self.line.trim_ascii();
            if chunk.is_empty() {
                continue;
            }
            let decoded = self
                .chunk
                .decode_chunk(chunk, ammo)
                .map_err(|source| LineError {
                    line: self.line_no,
                    source,
                })?;
            if decoded == Decoded::Ammo {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[derive(Debug, Default)]
    struct Request {
        host: String,
        path: String,
    }

    impl Ammo for Request {}

    /// `@host` lines set the host of every request that follows.
    #[derive(Default)]
    struct PathDecoder {
        host: String,
    }

    impl ChunkAmmoDecoder<Request> for PathDecoder {
        fn decode_chunk(&mut self, chunk: &[u8], ammo: &mut Request) -> Result<Decoded, BoxError> {
            let text = std::str::from_utf8(chunk)?;
            if let Some(host) = text.strip_prefix('@') {
                self.host = host.to_owned();
                return Ok(Decoded::Meta);
            }
            if !text.starts_with('/') {
                return Err(format!("not a path: {text}").into());
            }
            ammo.host = self.host.clone();
            ammo.path = text.to_owned();
            Ok(Decoded::Ammo)
        }
    }

    #[tokio::test]
    async fn meta_lines_apply_to_following_ammo() {
        let mut input = Cursor::new(b"@a.example\n/one\n\n@b.example\r\n/two".to_vec());
        let mut decoder = LineDecoder::new(PathDecoder::default());

        let mut ammo = Request::default();
        assert!(decoder.decode(&mut input, &mut ammo).await.unwrap());
        assert_eq!((ammo.host.as_str(), ammo.path.as_str()), ("a.example", "/one"));
        assert!(decoder.decode(&mut input, &mut ammo).await.unwrap());
        assert_eq!((ammo.host.as_str(), ammo.path.as_str()), ("b.example", "/two"));
        assert!(!decoder.decode(&mut input, &mut ammo).await.unwrap());
    }

    #[tokio::test]
    async fn errors_carry_line_numbers() {
        let mut input = Cursor::new(b"/ok\n\nbroken\n".to_vec());
        let mut decoder = LineDecoder::new(PathDecoder::default());
        let mut ammo = Request::default();
        decoder.decode(&mut input, &mut ammo).await.unwrap();

        let err = decoder.decode(&mut input, &mut ammo).await.unwrap_err();
        assert_eq!(err.to_string(), "line 3: not a path: broken");
    }
}
