//! NUL-delimited encoding of argv/environ token sequences.
//!
//! A job's command line and environment are stored as single BLOB columns
//! so that a later `tsp -r <id>` can restore them byte-for-byte, including
//! embedded whitespace and quotes. The encoding is the usual C convention
//! for a `char**`: each token is NUL-terminated, and the sequence itself is
//! terminated by one extra NUL (an empty "token" that marks the end), so a
//! decoder never needs a separate length prefix.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("command blob is empty")]
    Truncated,
    #[error("command blob is not NUL-terminated")]
    Unterminated,
    #[error("token {0} is not valid UTF-8")]
    NotUtf8(usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encode a sequence of tokens (argv or environ) into a self-delimiting blob.
///
/// Tokens must not contain embedded NUL bytes; this is an invariant of the
/// caller (argv/environ entries are NUL-terminated strings at the OS level
/// already), not something this function checks.
pub fn encode<T: AsRef<[u8]>>(tokens: &[T]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(tokens.iter().map(|t| t.as_ref().len() + 1).sum::<usize>() + 1);
    for token in tokens {
        buf.extend_from_slice(token.as_ref());
        buf.push(0);
    }
    buf.push(0);
    buf
}

/// Decode a blob produced by [`encode`] back into its tokens.
///
/// `decode(encode(argv)) == argv` for any `argv` whose entries contain no
/// embedded NULs.
pub fn decode(blob: &[u8]) -> CodecResult<Vec<Vec<u8>>> {
    if blob.is_empty() {
        return Err(CodecError::Truncated);
    }
    if *blob.last().unwrap() != 0 {
        return Err(CodecError::Unterminated);
    }

    let mut parts: Vec<Vec<u8>> = blob.split(|&b| b == 0).map(<[u8]>::to_vec).collect();
    // The final byte is a NUL, so split() always yields a trailing empty
    // segment after it; drop that first.
    parts.pop();
    // What remains is the sentinel empty token inserted by encode()'s extra
    // NUL. Its absence means the blob was truncated mid-token.
    match parts.last() {
        Some(last) if last.is_empty() => {
            parts.pop();
        }
        _ => return Err(CodecError::Unterminated),
    }
    Ok(parts)
}

/// Decode a blob into UTF-8 strings, the common case for environ/argv on Unix.
pub fn decode_utf8(blob: &[u8]) -> CodecResult<Vec<String>> {
    decode(blob)?
        .into_iter()
        .enumerate()
        .map(|(i, tok)| String::from_utf8(tok).map_err(|_| CodecError::NotUtf8(i)))
        .collect()
}

/// An owned buffer plus a non-owning slice-of-slices view over it.
///
/// Mirrors the `char**` the original C++ builds over an owned byte buffer:
/// the buffer strictly outlives the view, and the view is reconstructed
/// on demand rather than stored as raw pointers.
#[derive(Debug, Clone)]
pub struct TokenSequence {
    buf: Vec<u8>,
    offsets: Vec<(usize, usize)>,
}

impl TokenSequence {
    pub fn new<T: AsRef<[u8]>>(tokens: &[T]) -> Self {
        let buf = encode(tokens);
        let offsets = compute_offsets(&buf);
        Self { buf, offsets }
    }

    pub fn from_blob(blob: Vec<u8>) -> CodecResult<Self> {
        // Validate eagerly so construction fails loudly rather than at first access.
        decode(&blob)?;
        let offsets = compute_offsets(&blob);
        Ok(Self { buf: blob, offsets })
    }

    pub fn as_blob(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_blob(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.offsets
            .get(index)
            .map(|&(start, end)| &self.buf[start..end])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.offsets.iter().map(move |&(start, end)| &self.buf[start..end])
    }
}

fn compute_offsets(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut offsets = Vec::new();
    let mut start = 0;
    // Stop one NUL short of the end: the last NUL is the sentinel, not a
    // token terminator.
    for (i, &b) in buf.iter().enumerate() {
        if b == 0 {
            if i + 1 == buf.len() {
                break;
            }
            offsets.push((start, i));
            start = i + 1;
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let argv = vec!["echo", "hi there"];
        let encoded = encode(&argv);
        let decoded = decode_utf8(&encoded).unwrap();
        assert_eq!(decoded, argv);
    }

    #[test]
    fn round_trip_empty_tokens_and_sequence() {
        assert_eq!(decode_utf8(&encode::<&str>(&[])).unwrap(), Vec::<String>::new());
        let argv = vec!["", "b", ""];
        assert_eq!(decode_utf8(&encode(&argv)).unwrap(), argv);
    }

    #[test]
    fn round_trip_preserves_whitespace_and_quotes() {
        let argv = vec!["--label", "a \"quoted\" value\twith tabs"];
        assert_eq!(decode_utf8(&encode(&argv)).unwrap(), argv);
    }

    #[test]
    fn rejects_truncated_blob() {
        assert_eq!(decode(&[]), Err(CodecError::Truncated));
        assert_eq!(decode(b"abc"), Err(CodecError::Unterminated));
        // Missing the extra sentinel NUL after the last token's terminator.
        assert_eq!(decode(b"abc\0"), Err(CodecError::Unterminated));
    }

    #[test]
    fn token_sequence_view() {
        let seq = TokenSequence::new(&["FOO=1", "BAR=2"]);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0), Some(&b"FOO=1"[..]));
        assert_eq!(seq.get(1), Some(&b"BAR=2"[..]));
        assert_eq!(seq.get(2), None);

        let restored = TokenSequence::from_blob(seq.as_blob().to_vec()).unwrap();
        assert_eq!(restored.iter().collect::<Vec<_>>(), seq.iter().collect::<Vec<_>>());
    }
}
