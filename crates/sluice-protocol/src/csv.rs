//! Comma-delimited field encoding with backslash escaping.
//!
//! The wire format escapes rather than quotes: `\` becomes `\\`, `,` becomes
//! `\,`, and newline characters become `\n` / `\r` so every logical record
//! stays on one physical line. A field value of exactly `""` round-trips an
//! empty string, while a bare empty field decodes as a null marker handled by
//! the model layer.

/// Split one wire line into its fields, honoring backslash escapes.
///
/// Leading whitespace after a delimiter is trimmed, matching the tolerant
/// reader on the other side of the wire.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut at_field_start = true;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                at_field_start = false;
                match chars.next() {
                    Some('n') => current.push('\n'),
                    Some('r') => current.push('\r'),
                    Some(other) => current.push(other),
                    None => current.push('\\'),
                }
            }
            ',' => {
                fields.push(finish_field(current));
                current = String::new();
                at_field_start = true;
            }
            ' ' | '\t' if at_field_start => {
                // tolerate "token, arg" spacing
            }
            _ => {
                at_field_start = false;
                current.push(c);
            }
        }
    }
    fields.push(finish_field(current));
    fields
}

fn finish_field(raw: String) -> String {
    // `""` is the empty-string marker; see module docs.
    if raw == "\"\"" {
        String::new()
    } else {
        raw
    }
}

/// Escape a single field for the wire.
pub fn escape_field(field: &str) -> String {
    if field.is_empty() {
        return "\"\"".to_string();
    }
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Join fields into one wire line (no trailing newline).
pub fn join_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(field.as_ref()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple() {
        assert_eq!(split_fields("table, customer"), vec!["table", "customer"]);
        assert_eq!(split_fields("keys, id, rev"), vec!["keys", "id", "rev"]);
    }

    #[test]
    fn test_split_escaped_comma() {
        assert_eq!(
            split_fields("insert, a\\,b, c"),
            vec!["insert", "a,b", "c"]
        );
    }

    #[test]
    fn test_split_escaped_backslash_and_newline() {
        assert_eq!(split_fields("insert, a\\\\b"), vec!["insert", "a\\b"]);
        assert_eq!(split_fields("insert, a\\nb"), vec!["insert", "a\nb"]);
    }

    #[test]
    fn test_empty_string_marker() {
        assert_eq!(split_fields("insert, \"\""), vec!["insert", ""]);
    }

    #[test]
    fn test_roundtrip() {
        let fields = vec!["insert", "a,b", "c\\d", "line\nbreak", ""];
        let line = join_fields(&fields);
        assert_eq!(split_fields(&line), fields);
    }

    #[test]
    fn test_join_plain() {
        assert_eq!(join_fields(["commit", "42"]), "commit,42");
    }
}
