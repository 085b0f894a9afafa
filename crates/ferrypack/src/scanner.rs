use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

/// Name of the module loader function inside the emitted bundle
pub const RUNTIME_REQUIRE: &str = "__ferrypack_require__";

/// `require("x")` / `require('x')` not preceded by a member access or identifier character.
/// Group 1 spans the call, group 2 or 3 holds the specifier.
static REQUIRE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:^|[^.\w$])(require\s*\(\s*(?:"([^"\\\n]+)"|'([^'\\\n]+)')\s*\))"#,
    )
    .expect("Invalid regex pattern for require detection")
});

/// A literal `require` call found in a module body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireCall {
    /// Byte range of the whole call expression
    pub range: Range<usize>,
    pub specifier: String,
}

/// Find every literal `require` call, in source order.
///
/// Calls that sit inside a comment or a string literal are not code and are skipped.
pub fn scan_requires(source: &str) -> Vec<RequireCall> {
    let skipped = non_code_spans(source);
    REQUIRE_PATTERN
        .captures_iter(source)
        .filter_map(|captures| {
            let call = captures.get(1)?;
            if in_spans(&skipped, call.start()) {
                return None;
            }
            let specifier = captures.get(2).or_else(|| captures.get(3))?;
            Some(RequireCall {
                range: call.range(),
                specifier: specifier.as_str().to_owned(),
            })
        })
        .collect()
}

/// Byte ranges of comments and string, character and template literals, in order.
///
/// Regular expression literals are not recognized; a quote inside one starts a string.
fn non_code_spans(source: &str) -> Vec<Range<usize>> {
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < len {
        let start = i;
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = source[i..].find('\n').map_or(len, |offset| i + offset);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..]
                    .find("*/")
                    .map_or(len, |offset| i + 2 + offset + 2);
            }
            quote @ (b'"' | b'\'' | b'`') => {
                i += 1;
                while i < len {
                    match bytes[i] {
                        b'\\' => i += 2,
                        b'\n' if quote != b'`' => break,
                        byte if byte == quote => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i = i.min(len);
        spans.push(start..i);
    }
    spans
}

fn in_spans(spans: &[Range<usize>], offset: usize) -> bool {
    let index = spans.partition_point(|span| span.end <= offset);
    spans.get(index).is_some_and(|span| span.start <= offset)
}

/// Replace each call with a runtime lookup of the module id at the same index in `ids`.
///
/// With `annotate` the original specifier is kept as a comment.
pub fn rewrite_requires(
    source: &str,
    calls: &[RequireCall],
    ids: &[usize],
    annotate: bool,
) -> String {
    debug_assert_eq!(calls.len(), ids.len());

    let mut output = String::with_capacity(source.len());
    let mut cursor = 0;
    for (call, id) in calls.iter().zip(ids) {
        output.push_str(&source[cursor..call.range.start]);
        if annotate {
            output.push_str(&format!(
                "{RUNTIME_REQUIRE}(/* {} */ {id})",
                call.specifier.replace("*/", "*\\/")
            ));
        } else {
            output.push_str(&format!("{RUNTIME_REQUIRE}({id})"));
        }
        cursor = call.range.end;
    }
    output.push_str(&source[cursor..]);
    output
}
