//! Unified-diff inspection
//!
//! Diff-triggered jobs only need to know which paths a diff touches and, for
//! merge pushes, which pull request the merge came from.

use std::collections::BTreeSet;

const GIT_HEADER: &str = "diff --git ";
const MERGE_PREFIX: &str = "Merge pull request #";

/// Paths touched by a git-style multi-file diff, as `/`-rooted paths.
///
/// The post-image (`b/`) name is used, so renames report their destination.
/// The result is sorted and deduplicated.
pub fn changed_files(diff: &str) -> Vec<String> {
    let mut files = BTreeSet::new();

    for line in diff.lines() {
        let Some(header) = line.strip_prefix(GIT_HEADER) else {
            continue;
        };
        let new_name = if let Some(idx) = header.rfind(" \"b/") {
            header[idx + 4..].strip_suffix('"').map(unquote)
        } else {
            header.rfind(" b/").map(|idx| header[idx + 3..].to_string())
        };
        if let Some(new_name) = new_name.filter(|name| !name.is_empty()) {
            files.insert(format!("/{}", new_name));
        }
    }

    files.into_iter().collect()
}

/// Undoes git's C-style path quoting: `\"`, `\\`, `\t`, `\n` and octal
/// byte escapes such as `\303\251`.
fn unquote(quoted: &str) -> String {
    let mut bytes = Vec::with_capacity(quoted.len());
    let mut rest = quoted.bytes().peekable();

    while let Some(b) = rest.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match rest.next() {
            Some(b't') => bytes.push(b'\t'),
            Some(b'n') => bytes.push(b'\n'),
            Some(d @ b'0'..=b'7') => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match rest.peek() {
                        Some(&o @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(o - b'0');
                            rest.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => bytes.push(other),
            None => bytes.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

/// Extracts the PR number from GitHub's merge commit subject
/// (`Merge pull request #12 from owner/branch`).
pub fn merged_pull_request_number(message: &str) -> Option<u64> {
    let rest = message.strip_prefix(MERGE_PREFIX)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with(" from") {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}
