//! Content hashing for drift detection.
//!
//! Hashes must be stable across checkouts on different platforms, so line
//! endings are collapsed to single spaces and the text is trimmed before
//! hashing. The same normalization is applied to source files and to
//! definitions fetched from the live database.

/// Normalized blake3 hash of a text, rendered as lowercase hex.
pub fn content_hash(text: &str) -> String {
    blake3::hash(normalize(text).as_bytes())
        .to_hex()
        .to_string()
}

fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push(' ');
            }
            '\n' => out.push(' '),
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_endings_do_not_change_the_hash() {
        let unix = "create view app.v_doc as\nselect 1;\n";
        let dos = "create view app.v_doc as\r\nselect 1;\r\n";
        let mac = "create view app.v_doc as\rselect 1;\r";
        assert_eq!(content_hash(unix), content_hash(dos));
        assert_eq!(content_hash(unix), content_hash(mac));
    }

    #[test]
    fn surrounding_whitespace_is_ignored_but_content_is_not() {
        assert_eq!(content_hash("select 1;"), content_hash("\n  select 1;\n\n"));
        assert_ne!(content_hash("select 1;"), content_hash("select 2;"));
    }
}
