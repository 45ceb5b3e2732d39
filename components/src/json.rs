use serde_json::Value;

/// Parses JSON that may contain the non-standard constants `NaN`, `Infinity`
/// and `-Infinity`, which are read as `null`.
pub fn parse_lenient(text: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(&replace_non_finite(text))
}

fn replace_non_finite(text: &str) -> String {
    const CONSTANTS: [&str; 3] = ["-Infinity", "Infinity", "NaN"];

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if let Some(constant) = CONSTANTS.iter().find(|k| rest.starts_with(**k)) {
            let boundary = rest[constant.len()..]
                .chars()
                .next()
                .map_or(true, |next| !next.is_ascii_alphanumeric() && next != '_');
            if boundary && preceded_by_delimiter(&out) {
                out.push_str("null");
                rest = &rest[constant.len()..];
                continue;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn preceded_by_delimiter(out: &str) -> bool {
    out.trim_end()
        .chars()
        .last()
        .map_or(true, |c| matches!(c, '[' | ',' | ':'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_finite_constants_become_null() {
        assert_eq!(parse_lenient("NaN").unwrap(), Value::Null);
        assert_eq!(
            parse_lenient(r#"{"a": NaN, "b": [Infinity, -Infinity, 1.5]}"#).unwrap(),
            json!({"a": null, "b": [null, null, 1.5]})
        );
    }

    #[test]
    fn test_constants_inside_strings_are_kept() {
        assert_eq!(
            parse_lenient(r#"["NaN", "say \"Infinity\""]"#).unwrap(),
            json!(["NaN", "say \"Infinity\""])
        );
    }

    #[test]
    fn test_invalid_json_is_still_rejected() {
        assert!(parse_lenient("{not json}").is_err());
        assert!(parse_lenient("NaNa").is_err());
    }
}
