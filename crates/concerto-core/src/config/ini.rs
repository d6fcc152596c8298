//! Minimal INI reader for the server's config files.
//!
//! Supports `[section]` headers, `key = value` pairs, `#`/`;` comments and
//! blank lines. Keys before any section header land in the "" section.
//! Later duplicates win. This covers the whole grammar the blocklist and
//! card config files use.

use std::collections::HashMap;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IniFile {
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl IniFile {
    pub fn parse(text: &str) -> IniFile {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
        let mut current = String::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                if !sections.iter().any(|(s, _)| *s == current) {
                    sections.push((current.clone(), Vec::new()));
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            let entries = match sections.iter_mut().find(|(s, _)| *s == current) {
                Some((_, entries)) => entries,
                None => {
                    sections.push((current.clone(), Vec::new()));
                    &mut sections.last_mut().expect("just pushed").1
                }
            };
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some((_, slot)) => *slot = value,
                None => entries.push((key, value)),
            }
        }
        IniFile { sections }
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(name, _)| name.as_str())
    }

    pub fn section(&self, name: &str) -> Option<&[(String, String)]> {
        self.sections
            .iter()
            .find(|(s, _)| s == name)
            .map(|(_, entries)| entries.as_slice())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Section map keyed by name, preserving entry order per section.
    pub fn to_map(&self) -> HashMap<String, Vec<(String, String)>> {
        self.sections.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections_and_keys() {
        let ini = IniFile::parse(
            "# comment\n[USB_Outputs]\n0d8c_0008_00000012_0 = 1\n\n[Other]\nkey=value\n",
        );
        assert_eq!(ini.get("USB_Outputs", "0d8c_0008_00000012_0"), Some("1"));
        assert_eq!(ini.get("Other", "key"), Some("value"));
        assert_eq!(ini.get("Other", "missing"), None);
        assert_eq!(ini.get("Missing", "key"), None);
    }

    #[test]
    fn test_duplicate_key_last_wins() {
        let ini = IniFile::parse("[S]\nk = 1\nk = 2\n");
        assert_eq!(ini.get("S", "k"), Some("2"));
        assert_eq!(ini.section("S").unwrap().len(), 1);
    }

    #[test]
    fn test_whitespace_and_garbage_tolerated() {
        let ini = IniFile::parse("  [ S ]  \n  a  =  b c  \nnot-a-pair\n; note\n");
        assert_eq!(ini.get("S", "a"), Some("b c"));
    }
}
