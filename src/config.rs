//! A small, line-oriented config format: top-level `key = value` scalars and `[section]`
//! blocks of their own scalars, one level deep. Not a general INI reader — duplicate
//! sections merge, and a key can't be both a scalar and a section.

use std::fs;
use std::path::Path;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    Section(Vec<(String, String)>),
}

/// An ordered key/value store, preserving first-insertion position like the config file
/// it mirrors.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: Vec<(String, Value)>,
}

impl Config {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config = Config::new();
        let mut section: Option<String> = None;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].to_string();
                match config.find(&name) {
                    Some(Value::Section(_)) => {}
                    Some(Value::Scalar(_)) => {
                        return Err(Error::ConfigParse(format!(
                            "[{name}] already present as a regular key"
                        )))
                    }
                    None => config.entries.push((name.clone(), Value::Section(Vec::new()))),
                }
                section = Some(name);
            } else if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let value = value.trim().to_string();
                match &section {
                    Some(name) => config.set_in_section(name, &key, value)?,
                    None => config.set_scalar(&key, value)?,
                }
            } else {
                return Err(Error::ConfigParse(format!("could not parse the line '{line}'")));
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn write(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            if let Value::Scalar(v) = value {
                out.push_str(&format!("{key} = {v}\n"));
            }
        }
        for (name, value) in &self.entries {
            if let Value::Section(pairs) = value {
                out.push('\n');
                out.push_str(&format!("[{name}]\n"));
                for (key, v) in pairs {
                    out.push_str(&format!("{key} = {v}\n"));
                }
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.write())?;
        Ok(())
    }

    pub fn get_scalar(&self, key: &str) -> Option<&str> {
        match self.find(key) {
            Some(Value::Scalar(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_section(&self, name: &str) -> Option<&[(String, String)]> {
        match self.find(name) {
            Some(Value::Section(pairs)) => Some(pairs.as_slice()),
            _ => None,
        }
    }

    pub fn set_scalar(&mut self, key: &str, value: String) -> Result<(), Error> {
        match self.find_mut(key) {
            Some(Value::Scalar(v)) => {
                *v = value;
                Ok(())
            }
            Some(Value::Section(_)) => Err(Error::ConfigParse(format!(
                "{key} already present as a section"
            ))),
            None => {
                self.entries.push((key.to_string(), Value::Scalar(value)));
                Ok(())
            }
        }
    }

    pub fn set_in_section(&mut self, section: &str, key: &str, value: String) -> Result<(), Error> {
        if self.find(section).is_none() {
            self.entries
                .push((section.to_string(), Value::Section(Vec::new())));
        }
        match self.find_mut(section) {
            Some(Value::Section(pairs)) => {
                if let Some(existing) = pairs.iter_mut().find(|(k, _)| k == key) {
                    existing.1 = value;
                } else {
                    pairs.push((key.to_string(), value));
                }
                Ok(())
            }
            _ => Err(Error::ConfigParse(format!(
                "[{section}] already present as a regular key"
            ))),
        }
    }

    fn find(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars_and_sections() {
        let text = "a = 1\n[net]\nmac = 02:00:00:00:00:01\nifname = eth0\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.get_scalar("a"), Some("1"));
        assert_eq!(
            config.get_section("net"),
            Some(&[("mac".to_string(), "02:00:00:00:00:01".to_string()), ("ifname".to_string(), "eth0".to_string())][..])
        );
    }

    #[test]
    fn merges_duplicate_sections() {
        let text = "[net]\nmac = a\n[net]\nifname = eth0\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(
            config.get_section("net"),
            Some(&[("mac".to_string(), "a".to_string()), ("ifname".to_string(), "eth0".to_string())][..])
        );
    }

    #[test]
    fn rejects_section_scalar_collision() {
        let text = "net = 1\n[net]\nmac = a\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn rejects_unparseable_line() {
        assert!(Config::parse("not a valid line").is_err());
    }

    #[test]
    fn write_round_trips_order() {
        let text = "b = 2\na = 1\n\n[net]\nmac = a\n";
        let config = Config::parse(text).unwrap();
        let out = config.write();
        let reparsed = Config::parse(&out).unwrap();
        assert_eq!(reparsed.get_scalar("a"), Some("1"));
        assert_eq!(reparsed.get_scalar("b"), Some("2"));
        assert_eq!(reparsed.get_section("net").unwrap()[0].1, "a");
    }
}
