//! INI-style parser for systemd-syntax files
//!
//! Reads the driver configuration into structured data. Values are kept
//! verbatim; repeated keys accumulate in file order and the last one wins.

use std::collections::HashMap;
use std::path::Path;

/// A section contains key-value pairs, where each key can have multiple values
/// The u32 is the order the value appeared (for stable ordering)
pub type ParsedSection = HashMap<String, Vec<(u32, String)>>;

/// A parsed file is a map of section names to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Parse a file from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, ParseError> {
    let mut sections = HashMap::new();
    let lines: Vec<&str> = content.lines().map(|s| s.trim()).collect();

    let mut lines_iter = lines.iter().peekable();

    // Skip lines before the first section
    while lines_iter.peek().map_or(false, |l| !l.starts_with('[')) {
        lines_iter.next();
    }

    let Some(first_section) = lines_iter.next() else {
        return Ok(sections);
    };

    let mut current_section_name = first_section.to_string();
    let mut current_section_lines = Vec::new();

    for line in lines_iter {
        if line.starts_with('[') {
            if sections.contains_key(&current_section_name) {
                return Err(ParseError::DuplicateSection(current_section_name));
            }
            sections.insert(
                current_section_name.clone(),
                parse_section(&current_section_lines),
            );
            current_section_name = line.to_string();
            current_section_lines.clear();
        } else {
            current_section_lines.push(*line);
        }
    }

    if sections.contains_key(&current_section_name) {
        return Err(ParseError::DuplicateSection(current_section_name));
    }
    sections.insert(current_section_name, parse_section(&current_section_lines));

    Ok(sections)
}

/// Parse a single section's lines into key-value pairs
fn parse_section(lines: &[&str]) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();
    let mut entry_number = 0u32;

    for line in lines {
        if line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        let name = name.trim().to_uppercase();
        entries
            .entry(name)
            .or_default()
            .push((entry_number, value.trim().to_string()));
        entry_number += 1;
    }

    entries
}

/// Read and parse a file from disk
pub async fn parse_path(path: &Path) -> Result<ParsedFile, ParseError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_file(&content)
}

/// Last value assigned to `key` in `section`, systemd's "last one wins"
pub fn last_value<'a>(parsed: &'a ParsedFile, section: &str, key: &str) -> Option<&'a str> {
    parsed
        .get(section)?
        .get(&key.to_uppercase())?
        .iter()
        .max_by_key(|(order, _)| *order)
        .map(|(_, v)| v.as_str())
}

/// Parse a boolean the way systemd does
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_file() {
        let content = r#"
[Driver]
Enabled=yes
UnitDirectory=/etc/systemd/nspawn

[Import]
Verify=checksum
"#;
        let parsed = parse_file(content).unwrap();

        assert!(parsed.contains_key("[Driver]"));
        assert!(parsed.contains_key("[Import]"));
        assert_eq!(last_value(&parsed, "[Driver]", "Enabled"), Some("yes"));
        assert_eq!(last_value(&parsed, "[Import]", "verify"), Some("checksum"));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_empty_file() {
        let parsed = parse_file("").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_comments_only() {
        let content = "# This is a comment\n; Another comment\n";
        let parsed = parse_file(content).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_values_kept_verbatim() {
        let content = r#"
[Exec]
Parameters=1,2,3
Capability=CAP_A CAP_B
Environment=FOO=bar=baz
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(last_value(&parsed, "[Exec]", "Parameters"), Some("1,2,3"));
        assert_eq!(last_value(&parsed, "[Exec]", "Capability"), Some("CAP_A CAP_B"));
        assert_eq!(last_value(&parsed, "[Exec]", "Environment"), Some("FOO=bar=baz"));
    }

    #[test]
    fn test_empty_value_is_recorded() {
        let parsed = parse_file("[Exec]\nUser=\n").unwrap();
        assert_eq!(last_value(&parsed, "[Exec]", "User"), Some(""));
    }

    #[test]
    fn test_last_value_wins() {
        let content = r#"
[Driver]
watchinterval=1s
WATCHINTERVAL=2s
WatchInterval=3s
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(last_value(&parsed, "[Driver]", "WatchInterval"), Some("3s"));
    }

    #[test]
    fn test_whitespace_handling() {
        let content = "[Driver]\n   UnitDirectory   =   /tmp/units  \n";
        let parsed = parse_file(content).unwrap();
        assert_eq!(last_value(&parsed, "[Driver]", "UnitDirectory"), Some("/tmp/units"));
    }

    #[test]
    fn test_duplicate_section_error() {
        let content = r#"
[Driver]
Enabled=yes

[Driver]
Enabled=no
"#;
        let result = parse_file(content);
        assert!(matches!(result.unwrap_err(), ParseError::DuplicateSection(_)));
    }

    #[test]
    fn test_lines_before_first_section() {
        let content = r#"
# Header comment
; Another comment

[Driver]
Enabled=yes
"#;
        let parsed = parse_file(content).unwrap();
        assert!(parsed.contains_key("[Driver]"));
    }
}
