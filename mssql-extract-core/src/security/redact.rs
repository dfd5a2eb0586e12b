//! Redaction of secrets from connection strings and command lines.

/// Keys whose values are secrets in an ADO connection string.
const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// Masks password values in an ADO-style `key=value;` connection string.
///
/// Values may be double-quoted (with `""` as an escaped quote); the whole
/// value is replaced either way.
///
/// # Example
/// ```rust
/// use mssql_extract_core::security::redact_connection_string;
///
/// let safe = redact_connection_string("Server=tcp:db,1433;User ID=sa;Password=secret;");
/// assert_eq!(safe, "Server=tcp:db,1433;User ID=sa;Password=****;");
/// ```
pub fn redact_connection_string(connection_string: &str) -> String {
    split_ado_pairs(connection_string)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_lowercase().as_str()) => {
                format!("{key}=****")
            }
            _ => pair,
        })
        .fold(String::new(), |mut acc, pair| {
            acc.push_str(&pair);
            acc.push(';');
            acc
        })
}

/// Splits on `;` while respecting double-quoted values.
fn split_ado_pairs(connection_string: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in connection_string.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ';' if !in_quotes => {
                if !current.trim().is_empty() {
                    pairs.push(std::mem::take(&mut current));
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        pairs.push(current);
    }
    pairs
}

/// Masks the value following every `-P` flag in a command line.
pub fn mask_password_args(args: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            masked.push("*****".to_string());
            hide_next = false;
        } else {
            hide_next = arg == "-P";
            masked.push(arg.clone());
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_plain_password() {
        let redacted = redact_connection_string("Server=tcp:h,1433;Password=abc;Database=d");
        assert_eq!(redacted, "Server=tcp:h,1433;Password=****;Database=d;");
    }

    #[test]
    fn test_redact_quoted_password_with_semicolon() {
        let redacted = redact_connection_string(r#"Server=h;Pwd="a;b""c";Encrypt=true"#);
        assert!(!redacted.contains("a;b"));
        assert!(redacted.contains("Pwd=****"));
        assert!(redacted.contains("Encrypt=true"));
    }

    #[test]
    fn test_redact_without_password_is_unchanged() {
        assert_eq!(
            redact_connection_string("Server=h;Database=d;"),
            "Server=h;Database=d;"
        );
    }

    #[test]
    fn test_mask_password_args() {
        let args: Vec<String> = ["-S", "host", "-U", "sa", "-P", "secret", "-d", "db"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let masked = mask_password_args(&args);
        assert!(!masked.contains(&"secret".to_string()));
        assert_eq!(masked[5], "*****");
        assert_eq!(masked[7], "db");
    }
}
