//! Glob-style key patterns
//!
//! The pattern language of `find_keys` / `find_and_get`, evaluated the same
//! way the networked store evaluates `SCAN ... MATCH`:
//!
//! - `?`       exactly one character
//! - `*`       any run of characters, including none
//! - `[abc]`   one of the listed characters
//! - `[a-z]`   one character in the range (reversed ranges are accepted)
//! - `[^abc]`  any character except the listed ones
//! - `\x`      the literal character `x`

/// Whether `text` matches `pattern` in full
pub fn matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(mut p: &[char], mut t: &[char]) -> bool {
    while let Some(&pc) = p.first() {
        match pc {
            '*' => {
                // collapse consecutive stars
                while p.first() == Some(&'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                for start in 0..=t.len() {
                    if match_from(p, &t[start..]) {
                        return true;
                    }
                }
                return false;
            }
            '?' => {
                if t.is_empty() {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
            '[' => {
                let Some(&tc) = t.first() else {
                    return false;
                };
                let (matched, rest) = match_class(&p[1..], tc);
                if !matched {
                    return false;
                }
                p = rest;
                t = &t[1..];
            }
            '\\' if p.len() >= 2 => {
                if t.first() != Some(&p[1]) {
                    return false;
                }
                p = &p[2..];
                t = &t[1..];
            }
            literal => {
                if t.first() != Some(&literal) {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
        }
    }
    t.is_empty()
}

/// Evaluate a bracket class starting right after `[`
///
/// Returns whether `c` is accepted and the pattern remaining after the
/// closing `]`. An unterminated class extends to the end of the pattern.
fn match_class(mut p: &[char], c: char) -> (bool, &[char]) {
    let negate = p.first() == Some(&'^');
    if negate {
        p = &p[1..];
    }

    let mut matched = false;
    loop {
        match p {
            [] => break,
            [']', rest @ ..] => {
                p = rest;
                break;
            }
            ['\\', escaped, rest @ ..] => {
                if *escaped == c {
                    matched = true;
                }
                p = rest;
            }
            [lo, '-', hi, rest @ ..] if *hi != ']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                if lo <= c && c <= hi {
                    matched = true;
                }
                p = rest;
            }
            [single, rest @ ..] => {
                if *single == c {
                    matched = true;
                }
                p = rest;
            }
        }
    }

    (matched != negate, p)
}
