//! Best-effort repair of partially written JSON documents.
//!
//! A process killed mid-write can leave a run record with a torn tail. The
//! recovery chain tries progressively more lossy repairs and stops at the
//! first one that deserializes into the caller's type:
//!
//! 1. parse as-is;
//! 2. cut after the last `}`;
//! 3. take the first balanced top-level object;
//! 4. when the array under `array_key` closed before the tear, end the
//!    document right after it;
//! 5. replace a torn array under `array_key` with `[]`.
//!
//! The scanners understand JSON strings (quotes and escapes), so braces and
//! brackets inside string values never count as structure.

use serde::de::DeserializeOwned;

/// Which repair produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    /// Trailing bytes after the last closing brace were dropped.
    TrailingTruncation,
    /// The first balanced top-level object was extracted.
    FirstObject,
    /// Everything after the intact named array was dropped.
    TailDropped,
    /// The named array was replaced by an empty one.
    ArraySpliced,
}

/// A deserialized document plus the repair (if any) it needed.
#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub repair: Option<RepairStage>,
}

/// Run the recovery chain over `raw`.
///
/// Returns `None` when no stage yields a valid `T`.
pub fn recover<T: DeserializeOwned>(raw: &str, array_key: &str) -> Option<Recovered<T>> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Some(Recovered {
            value,
            repair: None,
        });
    }

    let attempts: [(RepairStage, Vec<String>); 4] = [
        (
            RepairStage::TrailingTruncation,
            truncate_to_last_brace(raw).map(str::to_string).into_iter().collect(),
        ),
        (
            RepairStage::FirstObject,
            first_balanced_object(raw)
                .map(str::to_string)
                .into_iter()
                .collect(),
        ),
        (
            RepairStage::TailDropped,
            close_after_array(raw, array_key).into_iter().collect(),
        ),
        (RepairStage::ArraySpliced, splice_empty_array(raw, array_key)),
    ];

    for (stage, candidates) in attempts {
        for candidate in candidates {
            if let Ok(value) = serde_json::from_str(&candidate) {
                return Some(Recovered {
                    value,
                    repair: Some(stage),
                });
            }
        }
    }
    None
}

/// Everything up to and including the last `}`.
pub fn truncate_to_last_brace(raw: &str) -> Option<&str> {
    let end = raw.rfind('}')?;
    Some(&raw[..=end])
}

/// The first `{ ... }` whose braces and brackets balance, ignoring strings.
pub fn first_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = matching_close(raw, start)?;
    Some(&raw[start..=end])
}

/// The document cut right after the top-level `key` array, when that array
/// is complete.
pub fn close_after_array(raw: &str, key: &str) -> Option<String> {
    let open = find_top_level_array(raw, key)?;
    let close = matching_close(raw, open)?;
    Some(format!("{}}}", &raw[..=close]))
}

/// Candidate documents with the top-level `key` array replaced by `[]`.
///
/// When the array closes, the text after it is kept; the second candidate
/// always ends the document right after the spliced array, which covers a
/// file torn inside the array.
pub fn splice_empty_array(raw: &str, key: &str) -> Vec<String> {
    let Some(open) = find_top_level_array(raw, key) else {
        return Vec::new();
    };
    let prefix = &raw[..open];
    let mut candidates = Vec::new();
    if let Some(close) = matching_close(raw, open) {
        candidates.push(format!("{prefix}[]{}", &raw[close + 1..]));
    }
    candidates.push(format!("{prefix}[]}}"));
    candidates
}

/// Byte index of the bracket or brace closing the one at `open`.
fn matching_close(raw: &str, open: usize) -> Option<usize> {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Byte index of the `[` opening the value of top-level `key`.
fn find_top_level_array(raw: &str, key: &str) -> Option<usize> {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut idx = 0usize;
    while idx < bytes.len() {
        match bytes[idx] {
            b'"' => {
                let end = string_end(bytes, idx)?;
                if depth == 1 && &raw[idx + 1..end] == key {
                    let mut cursor = skip_whitespace(bytes, end + 1);
                    if bytes.get(cursor) == Some(&b':') {
                        cursor = skip_whitespace(bytes, cursor + 1);
                        if bytes.get(cursor) == Some(&b'[') {
                            return Some(cursor);
                        }
                    }
                }
                idx = end + 1;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        idx += 1;
    }
    None
}

/// Index of the quote closing the string that opens at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(start + 1) {
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Some(idx);
        }
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut idx: usize) -> usize {
    while bytes.get(idx).is_some_and(u8::is_ascii_whitespace) {
        idx += 1;
    }
    idx
}
