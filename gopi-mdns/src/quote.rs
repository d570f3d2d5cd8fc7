//! DNS-SD instance label quoting.
//!
//! Instance labels are free-form UTF-8 ("Living Room", "Test's Test"), but the
//! textual form of a domain name uses `.` as separator and `\` as escape. A
//! label is therefore quoted byte by byte:
//!
//! | Input byte                    | Output              |
//! |-------------------------------|---------------------|
//! | space, `@`, `.`, `\`          | `\` + the byte      |
//! | newline, CR, tab, form feed   | `\n`, `\r`, `\t`, `\f` |
//! | ASCII alphanumeric, `_ - :`   | the byte            |
//! | anything else                 | `\DDD` (decimal)    |
//!
//! [`unquote`] is the exact inverse and rejects malformed escapes.

use shared::error::{Error, Result};

/// Quotes a single label so it can be embedded in a domain name.
pub fn quote(label: &str) -> String {
    quote_bytes(label.as_bytes())
}

pub(crate) fn quote_bytes(label: &[u8]) -> String {
    let mut out = String::with_capacity(label.len());
    for &b in label {
        match b {
            b' ' | b'@' | b'.' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x0c => out.push_str("\\f"),
            b'_' | b'-' | b':' => out.push(b as char),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => out.push_str(&format!("\\{b:03}")),
        }
    }
    out
}

/// Reverses [`quote`].
///
/// Input without any backslash is returned unchanged. Fails with
/// [`Error::ErrParse`] on a dangling or malformed escape, or when the
/// unescaped bytes are not valid UTF-8.
pub fn unquote(label: &str) -> Result<String> {
    if !label.contains('\\') {
        return Ok(label.to_owned());
    }
    let bytes = unquote_bytes(label)?;
    String::from_utf8(bytes).map_err(|err| Error::ErrParse(format!("{label:?}: {err}")))
}

pub(crate) fn unquote_bytes(label: &str) -> Result<Vec<u8>> {
    let src = label.as_bytes();
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] != b'\\' {
            out.push(src[i]);
            i += 1;
            continue;
        }
        let (b, consumed) = unescape_at(src, i).map_err(|reason| {
            Error::ErrParse(format!("{label:?} at offset {i}: {reason}"))
        })?;
        out.push(b);
        i += consumed;
    }
    Ok(out)
}

// unescape_at decodes the escape sequence starting at src[i] (a backslash) and
// returns the byte plus the number of input bytes consumed.
fn unescape_at(src: &[u8], i: usize) -> std::result::Result<(u8, usize), &'static str> {
    let Some(&next) = src.get(i + 1) else {
        return Err("dangling escape");
    };
    match next {
        b'n' => Ok((b'\n', 2)),
        b'r' => Ok((b'\r', 2)),
        b't' => Ok((b'\t', 2)),
        b'f' => Ok((0x0c, 2)),
        b'0'..=b'9' => {
            let digits = src.get(i + 1..i + 4).ok_or("short decimal escape")?;
            if !digits.iter().all(u8::is_ascii_digit) {
                return Err("short decimal escape");
            }
            let value = digits
                .iter()
                .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
            u8::try_from(value)
                .map(|b| (b, 4))
                .map_err(|_| "decimal escape out of range")
        }
        other => Ok((other, 2)),
    }
}

/// Splits a textual domain name into raw label bytes, honouring escapes.
///
/// The name must be fully qualified (end with an unescaped `.`). The root
/// name `.` yields no labels.
pub(crate) fn split_labels(name: &str) -> Result<Vec<Vec<u8>>> {
    if name == "." {
        return Ok(vec![]);
    }
    let src = name.as_bytes();
    let mut labels = vec![];
    let mut current = vec![];
    let mut i = 0;
    let mut terminated = false;
    while i < src.len() {
        terminated = false;
        match src[i] {
            b'\\' => {
                let (b, consumed) = unescape_at(src, i)
                    .map_err(|reason| Error::ErrParse(format!("{name:?}: {reason}")))?;
                current.push(b);
                i += consumed;
            }
            b'.' => {
                if current.is_empty() {
                    return Err(Error::ErrZeroSegLen);
                }
                labels.push(std::mem::take(&mut current));
                terminated = true;
                i += 1;
            }
            b => {
                current.push(b);
                i += 1;
            }
        }
    }
    if !terminated {
        return Err(Error::ErrNonCanonicalName);
    }
    Ok(labels)
}

/// Joins raw labels back into a fully qualified textual name.
pub(crate) fn join_labels(labels: &[Vec<u8>]) -> String {
    if labels.is_empty() {
        return ".".to_owned();
    }
    let mut out = String::new();
    for label in labels {
        out.push_str(&quote_bytes(label));
        out.push('.');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_corner_cases() {
        assert_eq!(quote("Not\\"), "Not\\\\");
        assert_eq!(quote("a b"), "a\\ b");
        assert_eq!(quote("Test's Test"), "Test\\039s\\ Test");
        assert_eq!(quote("host.name@x"), "host\\.name\\@x");
        assert_eq!(quote("tab\there\n"), "tab\\there\\n");
        assert_eq!(quote("_gopi-svc:1"), "_gopi-svc:1");
        assert_eq!(quote("é"), "\\195\\169");
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("plain").unwrap(), "plain");
        assert_eq!(unquote("a\\ b").unwrap(), "a b");
        assert_eq!(unquote("Test\\039s\\ Test").unwrap(), "Test's Test");
        assert_eq!(unquote("\\195\\169").unwrap(), "é");
        assert_eq!(unquote("\\f\\r").unwrap(), "\x0c\r");
    }

    #[test]
    fn test_unquote_errors() {
        assert!(matches!(unquote("Not\\"), Err(Error::ErrParse(_))));
        assert!(matches!(unquote("bad\\25"), Err(Error::ErrParse(_))));
        assert!(matches!(unquote("bad\\2x5"), Err(Error::ErrParse(_))));
        assert!(matches!(unquote("big\\256"), Err(Error::ErrParse(_))));
        // Valid escapes but not UTF-8.
        assert!(matches!(unquote("\\255\\254"), Err(Error::ErrParse(_))));
    }

    #[test]
    fn test_quote_round_trip() {
        let samples = [
            "",
            "Living Room",
            "Test's Test",
            "a.b.c",
            "back\\slash",
            "ünïcödé ☃",
            "ctl\n\r\t\x0c\x01\x7f",
            "@home:8080_x-y",
        ];
        for s in samples {
            let q = quote(s);
            assert_eq!(unquote(&q).unwrap(), s, "unquote(quote({s:?}))");
            assert_eq!(quote(&unquote(&q).unwrap()), q, "quote(unquote({q:?}))");
        }
    }

    #[test]
    fn test_split_labels() {
        assert_eq!(split_labels(".").unwrap(), Vec::<Vec<u8>>::new());
        assert_eq!(
            split_labels("Living\\ Room._googlecast._tcp.local.").unwrap(),
            vec![
                b"Living Room".to_vec(),
                b"_googlecast".to_vec(),
                b"_tcp".to_vec(),
                b"local".to_vec()
            ]
        );
        assert_eq!(
            split_labels("a\\.b.local.").unwrap(),
            vec![b"a.b".to_vec(), b"local".to_vec()]
        );
        assert_eq!(split_labels("local"), Err(Error::ErrNonCanonicalName));
        assert_eq!(split_labels("a..local."), Err(Error::ErrZeroSegLen));
    }

    #[test]
    fn test_join_labels() {
        let labels = split_labels("Test\\039s\\ Test._gopi._tcp.local.").unwrap();
        assert_eq!(join_labels(&labels), "Test\\039s\\ Test._gopi._tcp.local.");
        assert_eq!(join_labels(&[]), ".");
    }
}
