//! Manifest codec: the text serialization of a collection's stream tree.
//!
//! Each line describes one stream (directory): the stream name, one or more
//! block locators (`<32-hex-md5>+<size>[+hint]*`), then one or more file
//! segment tokens (`<offset>:<length>:<name>`) whose offsets address the
//! concatenation of the line's blocks. Spaces and backslashes inside names
//! are octal-escaped (`\040`, `\134`).
//!
//! The codec is pure and stateless. Encoding is the strict inverse of
//! decoding with one documented exception: an empty directory has no
//! representation, so encode drops it (lossy by design).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::FsError;

/// Locator of the zero-length block (md5 of the empty string). Streams that
/// contain only zero-length files reference this block so every stream line
/// carries at least one locator.
pub const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

// ── Block locators ────────────────────────────────────────────────────────────

/// A content-addressed block reference: md5 hash, byte size, and optional
/// service hints (signatures, expiry tokens) carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockLocator {
    pub hash: String,
    pub size: u64,
    pub hints: Vec<String>,
}

impl BlockLocator {
    /// Parse a locator token. The hash must be exactly 32 lowercase hex
    /// digits; hints are kept verbatim.
    pub fn parse(token: &str) -> Result<Self, FsError> {
        let mut parts = token.split('+');
        let hash = parts
            .next()
            .ok_or_else(|| FsError::Corrupt(format!("empty locator: {token:?}")))?;
        if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(FsError::Corrupt(format!("bad locator hash: {token:?}")));
        }
        let size = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| FsError::Corrupt(format!("bad locator size: {token:?}")))?;
        let hints: Vec<String> = parts.map(|h| h.to_string()).collect();
        if hints.iter().any(|h| h.is_empty()) {
            return Err(FsError::Corrupt(format!("empty locator hint: {token:?}")));
        }
        Ok(Self {
            hash: hash.to_string(),
            size,
            hints,
        })
    }

    /// Locator for the given content (md5 + length, no hints).
    pub fn for_content(data: &[u8]) -> Self {
        Self {
            hash: format!("{:x}", md5::compute(data)),
            size: data.len() as u64,
            hints: Vec::new(),
        }
    }

    /// Locator without hints, used as a stable cache/equality key since
    /// hints (signatures) expire and rotate.
    pub fn stripped(&self) -> String {
        format!("{}+{}", self.hash, self.size)
    }
}

impl fmt::Display for BlockLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)?;
        for hint in &self.hints {
            write!(f, "+{hint}")?;
        }
        Ok(())
    }
}

// ── Stream tree ───────────────────────────────────────────────────────────────

/// A byte range within one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSegment {
    pub locator: BlockLocator,
    /// Offset within the block.
    pub offset: u64,
    pub len: u64,
}

impl StreamSegment {
    pub fn new(locator: BlockLocator, offset: u64, len: u64) -> Self {
        Self {
            locator,
            offset,
            len,
        }
    }
}

/// Decoded directory tree of a manifest. A zero-length file is represented
/// by an empty segment list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestTree {
    pub files: BTreeMap<String, Vec<StreamSegment>>,
    pub dirs: BTreeMap<String, ManifestTree>,
}

// ── Name sanitization ─────────────────────────────────────────────────────────

/// Sanitize a filename for use as a path component.
///
/// The empty name and `.` map to `_`, `..` maps to `__`; any NUL, path
/// separator, or control character is replaced by `_` in place. The result
/// has the same character count as the input (except `""`), and the
/// function is idempotent.
pub fn sanitize_name(name: &str) -> String {
    match name {
        "" | "." => "_".to_string(),
        ".." => "__".to_string(),
        _ => name
            .chars()
            .map(|c| if c == '/' || c.is_control() { '_' } else { c })
            .collect(),
    }
}

// ── Token escaping ────────────────────────────────────────────────────────────

/// Escape a name or stream path for embedding in a space-delimited line.
fn escape_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b == b' ' || b == b'\\' || b < 0x20 {
            out.push_str(&format!("\\{b:03o}"));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Reverse of [`escape_token`]: decode `\ooo` octal escapes.
fn unescape_token(token: &str) -> Result<String, FsError> {
    let bytes = token.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let digits = token
                .get(i + 1..i + 4)
                .ok_or_else(|| FsError::Corrupt(format!("truncated escape in {token:?}")))?;
            let value = u8::from_str_radix(digits, 8)
                .map_err(|_| FsError::Corrupt(format!("bad escape in {token:?}")))?;
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| FsError::Corrupt(format!("non-UTF-8 name in {token:?}")))
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// The portable data hash of a manifest text: md5 of the bytes plus length.
pub fn portable_data_hash(manifest_text: &str) -> String {
    format!(
        "{:x}+{}",
        md5::compute(manifest_text.as_bytes()),
        manifest_text.len()
    )
}

/// Parse manifest text into a stream tree.
///
/// Fails with `Corrupt` on any malformed line; a corrupt manifest is never
/// partially applied.
pub fn parse(text: &str) -> Result<ManifestTree, FsError> {
    let mut root = ManifestTree::default();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        parse_stream_line(line, &mut root)?;
    }
    Ok(root)
}

fn parse_stream_line(line: &str, root: &mut ManifestTree) -> Result<(), FsError> {
    let mut tokens = line.split(' ');
    let stream_token = tokens
        .next()
        .ok_or_else(|| FsError::Corrupt("empty stream line".to_string()))?;
    let stream_name = unescape_token(stream_token)?;
    let dir = resolve_stream(&stream_name, root)?;

    // Block table for this stream; starts are recomputed by the range walk.
    let mut blocks: Vec<BlockLocator> = Vec::new();
    let mut stream_len = 0u64;
    let mut in_files = false;
    let mut file_count = 0usize;

    for token in tokens {
        if token.is_empty() {
            return Err(FsError::Corrupt(format!("empty token in stream {stream_name:?}")));
        }
        if !in_files {
            if let Ok(locator) = BlockLocator::parse(token) {
                stream_len += locator.size;
                blocks.push(locator);
                continue;
            }
            in_files = true;
        }
        let (offset, len, raw_name) = parse_file_token(token)?;
        let name = sanitize_name(&unescape_token(raw_name)?);
        let segments = map_stream_range(&blocks, stream_len, offset, len).ok_or_else(|| {
            FsError::Corrupt(format!(
                "segment {offset}:{len}:{name} outside stream {stream_name:?} ({stream_len} bytes)"
            ))
        })?;
        dir.files.entry(name).or_default().extend(segments);
        file_count += 1;
    }

    if file_count == 0 {
        return Err(FsError::Corrupt(format!(
            "stream {stream_name:?} has no file tokens"
        )));
    }
    Ok(())
}

fn parse_file_token(token: &str) -> Result<(u64, u64, &str), FsError> {
    let mut parts = token.splitn(3, ':');
    let offset = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| FsError::Corrupt(format!("bad file token: {token:?}")))?;
    let len = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| FsError::Corrupt(format!("bad file token: {token:?}")))?;
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| FsError::Corrupt(format!("file token without name: {token:?}")))?;
    Ok((offset, len, name))
}

/// Walk `/`-separated stream path components, creating directories.
fn resolve_stream<'a>(
    stream_name: &str,
    root: &'a mut ManifestTree,
) -> Result<&'a mut ManifestTree, FsError> {
    if stream_name == "." {
        return Ok(root);
    }
    let rest = stream_name
        .strip_prefix("./")
        .ok_or_else(|| FsError::Corrupt(format!("stream name must start with '.': {stream_name:?}")))?;
    let mut dir = root;
    for component in rest.split('/') {
        let name = sanitize_name(component);
        dir = dir.dirs.entry(name).or_default();
    }
    Ok(dir)
}

/// Map a stream-relative byte range onto per-block segments. Returns `None`
/// if the range extends past the stream.
fn map_stream_range(
    blocks: &[BlockLocator],
    stream_len: u64,
    offset: u64,
    len: u64,
) -> Option<Vec<StreamSegment>> {
    if offset.checked_add(len)? > stream_len {
        return None;
    }
    if len == 0 {
        return Some(Vec::new());
    }
    let end = offset + len;
    let mut segments = Vec::new();
    let mut start = 0u64;
    for locator in blocks {
        let block_end = start + locator.size;
        if block_end > offset && start < end {
            let seg_start = offset.max(start);
            let seg_end = end.min(block_end);
            segments.push(StreamSegment::new(
                locator.clone(),
                seg_start - start,
                seg_end - seg_start,
            ));
        }
        start = block_end;
        if start >= end {
            break;
        }
    }
    Some(segments)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serialize a stream tree back to manifest text.
///
/// Streams are emitted root-first, subdirectories in path order. Empty
/// directories produce no output (there is no representation for them).
pub fn encode(tree: &ManifestTree) -> String {
    let mut out = String::new();
    encode_stream(tree, ".", &mut out);
    out
}

fn encode_stream(tree: &ManifestTree, path: &str, out: &mut String) {
    if !tree.files.is_empty() {
        // Block table: first-use order across files, each block once.
        let mut starts: HashMap<String, u64> = HashMap::new();
        let mut order: Vec<&BlockLocator> = Vec::new();
        let mut total = 0u64;
        for segments in tree.files.values() {
            for seg in segments {
                let key = seg.locator.to_string();
                if !starts.contains_key(&key) {
                    starts.insert(key, total);
                    total += seg.locator.size;
                    order.push(&seg.locator);
                }
            }
        }

        out.push_str(&escape_token(path));
        if order.is_empty() {
            out.push(' ');
            out.push_str(EMPTY_BLOCK_LOCATOR);
        } else {
            for locator in &order {
                out.push(' ');
                out.push_str(&locator.to_string());
            }
        }
        for (name, segments) in &tree.files {
            if segments.is_empty() {
                out.push_str(&format!(" 0:0:{}", escape_token(name)));
            } else {
                for seg in segments {
                    let start = starts[&seg.locator.to_string()];
                    out.push_str(&format!(
                        " {}:{}:{}",
                        start + seg.offset,
                        seg.len,
                        escape_token(name)
                    ));
                }
            }
        }
        out.push('\n');
    }
    for (name, sub) in &tree.dirs {
        encode_stream(sub, &format!("{path}/{name}"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator_of(data: &[u8]) -> BlockLocator {
        BlockLocator::for_content(data)
    }

    #[test]
    fn test_sanitize_is_length_preserving_and_idempotent() {
        for name in ["", ".", "..", "a/b", "x\0y", "tab\tname", "plain.txt"] {
            let once = sanitize_name(name);
            if !name.is_empty() {
                assert_eq!(once.chars().count(), name.chars().count(), "{name:?}");
            }
            assert_eq!(sanitize_name(&once), once, "{name:?} not idempotent");
        }
        assert_eq!(sanitize_name(""), "_");
        assert_eq!(sanitize_name("."), "_");
        assert_eq!(sanitize_name(".."), "__");
        assert_eq!(sanitize_name("a/b"), "a_b");
        assert_eq!(sanitize_name("ok-name.txt"), "ok-name.txt");
    }

    #[test]
    fn test_locator_parse_roundtrip() {
        let tok = "d41d8cd98f00b204e9800998ecf8427e+0";
        let loc = BlockLocator::parse(tok).unwrap();
        assert_eq!(loc.size, 0);
        assert_eq!(loc.to_string(), tok);

        let hinted = "acbd18db4cc2f85cedef654fccc4a4d8+3+Af00dfeed@12345678";
        let loc = BlockLocator::parse(hinted).unwrap();
        assert_eq!(loc.size, 3);
        assert_eq!(loc.hints.len(), 1);
        assert_eq!(loc.to_string(), hinted);
        assert_eq!(loc.stripped(), "acbd18db4cc2f85cedef654fccc4a4d8+3");
    }

    #[test]
    fn test_locator_rejects_bad_tokens() {
        for tok in ["", "nothex+3", "abc+3", "d41d8cd98f00b204e9800998ecf8427e", "d41d8cd98f00b204e9800998ecf8427e+x"] {
            assert!(BlockLocator::parse(tok).is_err(), "{tok:?} should fail");
        }
    }

    #[test]
    fn test_parse_single_stream() {
        let content = b"hello world";
        let loc = locator_of(content);
        let text = format!(". {loc} 0:5:hello.txt 5:6:world.txt\n");
        let tree = parse(&text).unwrap();
        assert_eq!(tree.files.len(), 2);
        let hello = &tree.files["hello.txt"];
        assert_eq!(hello, &vec![StreamSegment::new(loc.clone(), 0, 5)]);
        let world = &tree.files["world.txt"];
        assert_eq!(world, &vec![StreamSegment::new(loc, 5, 6)]);
    }

    #[test]
    fn test_parse_range_spanning_blocks() {
        let a = locator_of(b"aaaa");
        let b = locator_of(b"bbbb");
        let text = format!(". {a} {b} 2:4:span.bin\n");
        let tree = parse(&text).unwrap();
        let segs = &tree.files["span.bin"];
        assert_eq!(
            segs,
            &vec![
                StreamSegment::new(a, 2, 2),
                StreamSegment::new(b, 0, 2),
            ]
        );
    }

    #[test]
    fn test_parse_nested_streams() {
        let loc = locator_of(b"data");
        let text = format!(". {loc} 0:4:top\n./sub/deep {loc} 0:4:leaf\n");
        let tree = parse(&text).unwrap();
        assert!(tree.files.contains_key("top"));
        let deep = &tree.dirs["sub"].dirs["deep"];
        assert!(deep.files.contains_key("leaf"));
    }

    #[test]
    fn test_parse_rejects_corrupt_lines() {
        let loc = locator_of(b"data");
        // Range past end of stream.
        assert!(parse(&format!(". {loc} 0:5:file\n")).is_err());
        // No file tokens.
        assert!(parse(&format!(". {loc}\n")).is_err());
        // Garbage token.
        assert!(parse(". what-is-this\n").is_err());
        // Stream name not rooted at '.'.
        assert!(parse(&format!("sub {loc} 0:4:file\n")).is_err());
    }

    #[test]
    fn test_escaped_names_roundtrip() {
        let loc = locator_of(b"data");
        let mut tree = ManifestTree::default();
        tree.files.insert(
            "name with spaces".to_string(),
            vec![StreamSegment::new(loc.clone(), 0, 4)],
        );
        let mut sub = ManifestTree::default();
        sub.files.insert(
            "back\\slash".to_string(),
            vec![StreamSegment::new(loc, 0, 4)],
        );
        tree.dirs.insert("dir with spaces".to_string(), sub);

        let text = encode(&tree);
        assert!(text.contains("name\\040with\\040spaces"));
        assert_eq!(parse(&text).unwrap(), tree);
    }

    #[test]
    fn test_roundtrip_decode_encode() {
        let a = locator_of(b"first block");
        let b = locator_of(b"second block!");
        let mut tree = ManifestTree::default();
        tree.files.insert(
            "joined.bin".to_string(),
            vec![
                StreamSegment::new(a.clone(), 0, 11),
                StreamSegment::new(b.clone(), 0, 13),
            ],
        );
        tree.files.insert("empty".to_string(), Vec::new());
        let mut sub = ManifestTree::default();
        sub.files.insert(
            "tail".to_string(),
            vec![StreamSegment::new(b, 5, 8)],
        );
        tree.dirs.insert("sub".to_string(), sub);

        let text = encode(&tree);
        let decoded = parse(&text).unwrap();
        assert_eq!(decoded, tree);
        // Encoding is deterministic.
        assert_eq!(encode(&decoded), text);
    }

    #[test]
    fn test_empty_directories_are_dropped() {
        let loc = locator_of(b"data");
        let mut tree = ManifestTree::default();
        tree.dirs.insert("empty".to_string(), ManifestTree::default());
        let mut sub = ManifestTree::default();
        sub.files.insert(
            "file".to_string(),
            vec![StreamSegment::new(loc, 0, 4)],
        );
        tree.dirs.insert("full".to_string(), sub);

        let text = encode(&tree);
        assert!(!text.contains("empty"));
        let decoded = parse(&text).unwrap();
        assert!(!decoded.dirs.contains_key("empty"));
        assert!(decoded.dirs.contains_key("full"));
    }

    #[test]
    fn test_zero_length_only_stream_uses_empty_block() {
        let mut tree = ManifestTree::default();
        tree.files.insert("touched".to_string(), Vec::new());
        let text = encode(&tree);
        assert_eq!(text, format!(". {EMPTY_BLOCK_LOCATOR} 0:0:touched\n"));
        assert_eq!(parse(&text).unwrap(), tree);
    }

    #[test]
    fn test_portable_data_hash_format() {
        let text = ". d41d8cd98f00b204e9800998ecf8427e+0 0:0:empty\n";
        let pdh = portable_data_hash(text);
        let (hash, size) = pdh.split_once('+').unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(size.parse::<usize>().unwrap(), text.len());
    }
}
