use bytes::Bytes;

/// A byte range that can be appended to an [`Envelope`](crate::Envelope)'s
/// header/body chunk lists without copying: either a literal (stamped
/// headers, CRLF separators) or a zero-copy view into buffer-pool memory
/// already committed by `smtp-pool`. Immutable once built into an envelope.
/// Grounded on NwSMTP's `envelope.h`, which uses the analogous polymorphic
/// chunk type to avoid ever re-copying the message body while stamping
/// headers or composing the final relayed message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    Static(&'static [u8]),
    Owned(Bytes),
}

impl Chunk {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Static(s) => s,
            Chunk::Owned(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&'static str> for Chunk {
    fn from(s: &'static str) -> Chunk {
        Chunk::Static(s.as_bytes())
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Chunk {
        Chunk::Owned(Bytes::from(s.into_bytes()))
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Chunk {
        Chunk::Owned(b)
    }
}

/// Concatenates a chunk list into one contiguous buffer. Used only where a
/// contiguous view is genuinely required (handing a message to a
/// `smtp-client` writer that doesn't support vectored I/O); the common path
/// writes each chunk with `IoSlice` directly, without ever joining them.
pub fn join(chunks: &[Chunk]) -> Vec<u8> {
    let total = chunks.iter().map(Chunk::len).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk.as_bytes());
    }
    out
}
