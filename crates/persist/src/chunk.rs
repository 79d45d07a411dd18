use crate::error::PersistError;

/// Separator between a base key and its chunk index.
pub const CHUNK_MARKER: &str = ":chunk:";
/// Chunk indices are zero-padded to this many digits.
pub const CHUNK_INDEX_WIDTH: usize = 6;
/// One more chunk than fits in `CHUNK_INDEX_WIDTH` digits is rejected.
pub const MAX_CHUNKS: usize = 1_000_000;
/// Keys under this prefix belong to the engine (event mirror, snapshots) and
/// are never valid atom keys.
pub const SYSTEM_KEY_PREFIX: &str = "$chronostate/";

/// One fixed-size piece of a serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub data: Vec<u8>,
}

/// `<base>:chunk:<index, 6 digits>`.
pub fn chunk_key(base: &str, index: usize) -> String {
    format!("{base}{CHUNK_MARKER}{index:0width$}", width = CHUNK_INDEX_WIDTH)
}

/// Prefix shared by every chunk key of `base`.
pub fn chunk_prefix(base: &str) -> String {
    format!("{base}{CHUNK_MARKER}")
}

/// Split a chunk key into (base, index). Anything that is not exactly
/// `<base>:chunk:` followed by six ASCII digits is not a chunk key.
pub fn parse_chunk_key(key: &str) -> Option<(&str, usize)> {
    let at = key.rfind(CHUNK_MARKER)?;
    let base = &key[..at];
    let digits = &key[at + CHUNK_MARKER.len()..];
    if base.contains(CHUNK_MARKER)
        || digits.len() != CHUNK_INDEX_WIDTH
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok().map(|index| (base, index))
}

/// A base key must be non-empty, must not itself look like a chunk key and
/// must stay out of the system namespace.
pub fn validate_base_key(key: &str) -> Result<(), PersistError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.starts_with(SYSTEM_KEY_PREFIX) {
        "key uses the reserved system prefix"
    } else if key.contains(CHUNK_MARKER) {
        "key contains the reserved chunk marker"
    } else {
        return Ok(());
    };
    Err(PersistError::InvalidKey {
        key: key.to_owned(),
        reason,
    })
}

/// Cut `buf` into `ceil(len / size)` pieces; the last may be shorter.
pub fn split_chunks(buf: &[u8], size: usize) -> Vec<ChunkDescriptor> {
    buf.chunks(size.max(1))
        .enumerate()
        .map(|(index, data)| ChunkDescriptor {
            index,
            data: data.to_vec(),
        })
        .collect()
}

/// Concatenate chunks in index order. Indices must be exactly `0..n`.
pub fn reassemble(key: &str, mut chunks: Vec<ChunkDescriptor>) -> Result<Vec<u8>, PersistError> {
    chunks.sort_by_key(|chunk| chunk.index);
    let total = chunks.iter().map(|chunk| chunk.data.len()).sum();
    let mut out = Vec::with_capacity(total);
    for (expected, chunk) in chunks.into_iter().enumerate() {
        if chunk.index != expected {
            return Err(PersistError::MissingChunk {
                key: key.to_owned(),
                index: expected,
            });
        }
        out.extend_from_slice(&chunk.data);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn chunk_key_format() {
        assert_eq!(chunk_key("todos", 0), "todos:chunk:000000");
        assert_eq!(chunk_key("todos", 42), "todos:chunk:000042");
        assert_eq!(chunk_prefix("todos"), "todos:chunk:");
    }

    #[test]
    fn parse_accepts_only_exact_chunk_keys() {
        assert_eq!(parse_chunk_key("a:chunk:000007"), Some(("a", 7)));
        assert_eq!(parse_chunk_key("ns:a:chunk:000000"), Some(("ns:a", 0)));
        for bad in [
            "a",
            "a:chunk:7",
            "a:chunk:0000007",
            "a:chunk:00000x",
            "a:chunk:000001:chunk:000002",
        ] {
            assert_eq!(parse_chunk_key(bad), None, "{bad}");
        }
    }

    #[test]
    fn base_keys_reject_reserved_marker() {
        assert!(validate_base_key("todos").is_ok());
        assert!(matches!(
            validate_base_key("todos:chunk:000001"),
            Err(PersistError::InvalidKey { .. })
        ));
        assert!(validate_base_key("").is_err());
    }

    #[test]
    fn base_keys_reject_system_prefix() {
        assert!(validate_base_key("event:0000000003").is_ok());
        assert!(matches!(
            validate_base_key("$chronostate/event:0000000001"),
            Err(PersistError::InvalidKey { reason, .. }) if reason.contains("system prefix")
        ));
        assert!(validate_base_key("$chronostate/").is_err());
    }

    #[test]
    fn split_sizes() {
        let chunks = split_chunks(&[1; 10], 4);
        let lens: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert!(split_chunks(&[], 4).is_empty());
    }

    #[test]
    fn reassemble_detects_gap() {
        let chunks = vec![
            ChunkDescriptor { index: 0, data: vec![1] },
            ChunkDescriptor { index: 2, data: vec![3] },
        ];
        assert!(matches!(
            reassemble("k", chunks),
            Err(PersistError::MissingChunk { index: 1, .. })
        ));
    }

    proptest! {
        #[test]
        fn split_then_reassemble_out_of_order(
            data in prop::collection::vec(any::<u8>(), 0..2048),
            size in 1usize..300,
            seed in any::<u64>(),
        ) {
            let mut chunks = split_chunks(&data, size);
            // deterministic shuffle
            let n = chunks.len();
            for i in 0..n {
                let j = (seed as usize).wrapping_add(i * 7919) % n;
                chunks.swap(i, j);
            }
            prop_assert_eq!(reassemble("k", chunks).unwrap(), data);
        }
    }
}
