//! Structural repair for truncated JSON payloads.
//!
//! Agent replies are frequently cut off by output-length limits. The repair
//! here only closes syntax that was left open: an unterminated string, open
//! arrays and objects, and dangling commas. It never fabricates keys or values.

/// Result of scanning a JSON fragment outside of string literals.
#[derive(Debug, Default, PartialEq, Eq)]
struct Scan {
    /// Closers still owed, innermost last.
    owed: Vec<char>,
    /// Fragment ends inside a string literal (odd count of unescaped quotes).
    in_string: bool,
    /// Byte offset to cut back to before closing the string: the start of an
    /// escape sequence the truncation left incomplete.
    cut_at: Option<usize>,
}

/// Escape-sequence state inside a string literal.
#[derive(Debug, Clone, Copy)]
enum Escape {
    None,
    /// Saw `\` at this offset.
    Backslash(usize),
    /// Inside `\uXXXX` started at this offset: digits seen and their value.
    Unicode(usize, u8, u32),
}

fn is_high_surrogate(code: u32) -> bool {
    (0xD800..=0xDBFF).contains(&code)
}

fn scan(text: &str) -> Scan {
    let mut scan = Scan::default();
    let mut escape = Escape::None;
    // A complete `\uD8xx` still waiting for its low surrogate.
    let mut pending_high: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if scan.in_string {
            escape = match escape {
                Escape::Backslash(start) if c == 'u' => Escape::Unicode(start, 0, 0),
                Escape::Backslash(_) => {
                    pending_high = None;
                    Escape::None
                }
                Escape::Unicode(start, digits, value) => match c.to_digit(16) {
                    Some(digit) if digits == 3 => {
                        let code = value * 16 + digit;
                        if is_high_surrogate(code) {
                            pending_high = Some(start);
                        } else {
                            pending_high = None;
                        }
                        Escape::None
                    }
                    Some(digit) => Escape::Unicode(start, digits + 1, value * 16 + digit),
                    None => Escape::None,
                },
                Escape::None if c == '\\' => Escape::Backslash(i),
                Escape::None => {
                    pending_high = None;
                    if c == '"' {
                        scan.in_string = false;
                    }
                    Escape::None
                }
            };
            continue;
        }

        match c {
            '"' => scan.in_string = true,
            '{' => scan.owed.push('}'),
            '[' => scan.owed.push(']'),
            '}' | ']' => {
                if scan.owed.last() == Some(&c) {
                    scan.owed.pop();
                }
            }
            _ => {}
        }
    }

    if scan.in_string {
        let partial = match escape {
            Escape::Backslash(start) | Escape::Unicode(start, _, _) => Some(start),
            Escape::None => None,
        };
        scan.cut_at = pending_high.or(partial);
    }
    scan
}

/// Remove commas that sit directly (modulo whitespace) before a closing
/// bracket or brace, ignoring string contents.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}

fn trim_dangling_comma(text: &mut String) {
    let trimmed_len = text.trim_end().len();
    text.truncate(trimmed_len);
    if text.ends_with(',') {
        text.pop();
    }
}

/// Close whatever the fragment left open.
///
/// The returned text is a best-effort candidate; callers still have to parse
/// it and treat a parse failure as unrecoverable.
pub fn repair_json(fragment: &str) -> String {
    let mut out = strip_trailing_commas(fragment.trim_end());
    let scan = scan(&out);

    if scan.in_string {
        if let Some(cut_at) = scan.cut_at {
            out.truncate(cut_at);
        }
        out.push('"');
    }

    for closer in scan.owed.iter().rev() {
        trim_dangling_comma(&mut out);
        out.push(*closer);
    }

    out
}
