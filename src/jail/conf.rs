//! Jail configuration blocks
//!
//! A jail is described by one `jail.conf(5)` style block:
//!
//! ```text
//! web {
//!   host.hostname = web.local;
//!   ip4.addr = "lo1|10.0.0.4/24";
//!   allow.raw_sockets;
//! }
//! ```
//!
//! Keys are dotted lowercase identifiers, values are bare or double quoted,
//! and a key without a value is a flag stored as `"true"`. Lines starting
//! with `#` between tokens are comments. Files whose content starts with `{`
//! are read as JSON documents of the form `{"jail": {"name": "web", ...}}`.

use crate::error::{ConfZone, Error, Result};
use crate::sys::validate_name;
use nom::{
    IResult, Parser,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, satisfy},
    combinator::recognize,
    multi::many0,
    sequence::{delimited, pair},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_EXEC_START: &str = "/bin/sh /etc/rc";
pub const DEFAULT_EXEC_STOP: &str = "/bin/sh /etc/rc.shutdown";

/// Key/value configuration of one jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailConf {
    pub name: String,
    pub config: BTreeMap<String, String>,
    /// Where the block was last written to
    #[serde(default)]
    pub filepath: Option<PathBuf>,
}

#[derive(Deserialize)]
struct JsonJailFile {
    jail: BTreeMap<String, String>,
}

fn conf_err(zone: ConfZone, message: impl Into<String>) -> Error {
    Error::ConfBlock {
        zone,
        message: message.into(),
    }
}

impl JailConf {
    pub fn new(name: &str) -> Self {
        JailConf {
            name: name.to_string(),
            config: BTreeMap::new(),
            filepath: None,
        }
    }

    /// Parse a configuration block
    pub fn parse(text: &str) -> Result<Self> {
        let input = skip_blank(text);
        let (input, name) = jail_name(input)
            .map_err(|_| conf_err(ConfZone::Name, "missing or invalid jail name"))?;
        validate_name(name)
            .map_err(|_| conf_err(ConfZone::Name, format!("invalid jail name '{}'", name)))?;

        let mut input = skip_blank(input)
            .strip_prefix('{')
            .ok_or_else(|| conf_err(ConfZone::Name, format!("expected '{{' after '{}'", name)))?;

        let mut conf = JailConf::new(name);
        loop {
            input = skip_blank(input);
            if let Some(rest) = input.strip_prefix('}') {
                input = rest;
                break;
            }
            if input.is_empty() {
                return Err(conf_err(ConfZone::Key, "block is not closed with '}'"));
            }

            let (rest, key) = key_path(input)
                .map_err(|_| conf_err(ConfZone::Key, format!("invalid key at '{}'", snippet(input))))?;

            if let Some(c) = rest.chars().next()
                && !(c.is_whitespace() || c == ';' || c == '=' || c == '#')
            {
                return Err(conf_err(
                    ConfZone::Key,
                    format!("invalid character '{}' in key '{}'", c, key),
                ));
            }

            let rest = skip_blank(rest);
            if let Some(rest) = rest.strip_prefix(';') {
                conf.config.insert(key.to_string(), "true".to_string());
                input = rest;
            } else if let Some(rest) = rest.strip_prefix('=') {
                let (rest, value) = parse_value(key, rest)?;
                conf.config.insert(key.to_string(), value.to_string());
                input = rest;
            } else {
                return Err(conf_err(
                    ConfZone::Key,
                    format!("key '{}' is not closed with ';'", key),
                ));
            }
        }

        let trailing = skip_blank(input);
        if !trailing.is_empty() {
            return Err(conf_err(
                ConfZone::Name,
                format!("unexpected content after block: '{}'", snippet(trailing)),
            ));
        }

        Ok(conf)
    }

    /// Parse the JSON jail file layout
    pub fn parse_json(text: &str) -> Result<Self> {
        let file: JsonJailFile = serde_json::from_str(text)
            .map_err(|e| conf_err(ConfZone::Name, format!("invalid JSON jail file: {}", e)))?;
        let mut config = file.jail;

        let name = config
            .remove("name")
            .ok_or_else(|| conf_err(ConfZone::Name, "jail name is missing from the jail file"))?;
        validate_name(&name)
            .map_err(|_| conf_err(ConfZone::Name, format!("invalid jail name '{}'", name)))?;

        // Values must survive being written back as a block
        for (key, value) in &config {
            match key_path(key) {
                Ok(("", _)) => {}
                _ => return Err(conf_err(ConfZone::Key, format!("invalid key '{}'", key))),
            }
            if value.is_empty() {
                return Err(conf_err(ConfZone::Value, format!("empty value for '{}'", key)));
            }
            if value.contains('"') {
                return Err(conf_err(
                    ConfZone::Value,
                    format!("value for '{}' contains '\"'", key),
                ));
            }
        }

        Ok(JailConf {
            name,
            config,
            filepath: None,
        })
    }

    /// Read and parse a jail file, block or JSON
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "parsing jail config");
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound {
                kind: "Jail config file".into(),
                name: path.display().to_string(),
            },
            _ => Error::Io(e),
        })?;

        if text.trim_start().starts_with('{') {
            Self::parse_json(&text)
        } else {
            Self::parse(&text)
        }
    }

    /// Value of `key`, treating an empty value as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.config.insert(key.to_string(), value.to_string());
    }

    /// Check required keys.
    ///
    /// With `path` set the jail has its own root, which must be an existing
    /// directory, and `exec.start`/`exec.stop` are required. Without `path`
    /// the jail shares the host filesystem and nothing else is required.
    pub fn validate(&self) -> Result<()> {
        let Some(path) = self.get("path") else {
            return Ok(());
        };

        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(Error::Validation(format!("'path' {} is not a directory", path))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Validation(format!("'path' {} does not exist", path)));
            }
            Err(e) => return Err(Error::Io(e)),
        }

        for key in ["exec.start", "exec.stop"] {
            if self.get(key).is_none() {
                return Err(Error::MissingKey(key.to_string()));
            }
        }

        Ok(())
    }

    /// Fill in hostname and rc scripts when they are not set
    pub fn apply_defaults(&mut self) {
        if self.get("host.hostname").is_none() {
            let name = self.name.clone();
            self.set("host.hostname", &name);
        }
        if self.get("exec.start").is_none() {
            self.set("exec.start", DEFAULT_EXEC_START);
        }
        if self.get("exec.stop").is_none() {
            self.set("exec.stop", DEFAULT_EXEC_STOP);
        }
    }

    /// Serialize the block to `path`, creating its directory if needed
    pub fn write(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())?;
        debug!(jail = %self.name, path = %path.display(), "jail config written");
        self.filepath = Some(path.to_path_buf());
        Ok(())
    }

    /// Delete the written block. Nothing written, or already gone, is fine.
    pub fn remove(&self) -> Result<()> {
        let Some(path) = &self.filepath else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(jail = %self.name, path = %path.display(), "jail config removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for JailConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {{", self.name)?;
        for (key, value) in &self.config {
            if value == "true" {
                writeln!(f, "  {};", key)?;
            } else if needs_quotes(value) {
                writeln!(f, "  {} = \"{}\";", key, value)?;
            } else {
                writeln!(f, "  {} = {};", key, value)?;
            }
        }
        writeln!(f, "}}")
    }
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '='))
}

/// Skip whitespace and `#` comment lines
fn skip_blank(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if s.starts_with('#') {
            s = s.find('\n').map_or("", |i| &s[i..]);
        } else {
            return s;
        }
    }
}

fn snippet(s: &str) -> &str {
    let line = s.lines().next().unwrap_or_default();
    match line.char_indices().nth(24) {
        Some((i, _)) => &line[..i],
        None => line,
    }
}

fn parse_value<'a>(key: &str, input: &'a str) -> Result<(&'a str, &'a str)> {
    let input = input.trim_start();

    let (rest, value) = if input.starts_with('"') {
        quoted_value(input).map_err(|_| {
            conf_err(
                ConfZone::Value,
                format!("unterminated quoted value for '{}'", key),
            )
        })?
    } else if input.is_empty() {
        return Err(conf_err(
            ConfZone::Value,
            format!("unterminated value for '{}'", key),
        ));
    } else {
        match bare_value(input) {
            Ok((rest, value)) => (rest, value.trim_end()),
            Err(_) => (input, ""),
        }
    };

    if value.is_empty() {
        return Err(conf_err(ConfZone::Value, format!("empty value for '{}'", key)));
    }

    let rest = rest
        .trim_start()
        .strip_prefix(';')
        .ok_or_else(|| conf_err(ConfZone::Value, format!("value for '{}' is not closed with ';'", key)))?;

    Ok((rest, value))
}

// Nom parsers for the lexical pieces of a block

fn jail_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_lowercase()),
        take_while(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
    ))
    .parse(input)
}

fn key_segment(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_lowercase()),
        take_while(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
    ))
    .parse(input)
}

fn key_path(input: &str) -> IResult<&str, &str> {
    recognize(pair(key_segment, many0(pair(char('.'), key_segment)))).parse(input)
}

fn quoted_value(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c: char| c != '"'), char('"')).parse(input)
}

fn bare_value(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !matches!(c, ';' | '\n' | '"' | '{' | '}')).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEB: &str = r#"
# web frontend
web {
  host.hostname = web.local;
  exec.start = "/bin/sh /etc/rc";
  ip4.addr = lo1|10.0.0.4/24;
  allow.raw_sockets;
  mount.devfs = true;
}
"#;

    fn zone_of(text: &str) -> ConfZone {
        match JailConf::parse(text) {
            Err(Error::ConfBlock { zone, .. }) => zone,
            other => panic!("expected a block error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_block() {
        let conf = JailConf::parse(WEB).unwrap();
        assert_eq!(conf.name, "web");
        assert_eq!(conf.get("host.hostname"), Some("web.local"));
        assert_eq!(conf.get("exec.start"), Some("/bin/sh /etc/rc"));
        assert_eq!(conf.get("ip4.addr"), Some("lo1|10.0.0.4/24"));
        assert_eq!(conf.get("allow.raw_sockets"), Some("true"));
        assert_eq!(conf.get("mount.devfs"), Some("true"));
        assert_eq!(conf.config.len(), 5);
    }

    #[test]
    fn test_parse_compact_and_comments() {
        let conf = JailConf::parse("db{persist;path=/jails/db;\n# note\nexec.clean ;}").unwrap();
        assert_eq!(conf.name, "db");
        assert_eq!(conf.get("persist"), Some("true"));
        assert_eq!(conf.get("path"), Some("/jails/db"));
        assert_eq!(conf.get("exec.clean"), Some("true"));
    }

    #[test]
    fn test_parse_unquoted_value_with_space() {
        let conf = JailConf::parse("app {\n  exec.stop = /bin/sh /etc/rc.shutdown ;\n}").unwrap();
        assert_eq!(conf.get("exec.stop"), Some("/bin/sh /etc/rc.shutdown"));
    }

    #[test]
    fn test_name_zone_errors() {
        assert_eq!(zone_of(""), ConfZone::Name);
        assert_eq!(zone_of("{ a = b; }"), ConfZone::Name);
        assert_eq!(zone_of("Web { }"), ConfZone::Name);
        assert_eq!(zone_of("web a = b; }"), ConfZone::Name);
        assert_eq!(zone_of("bad--name { }"), ConfZone::Name);
        assert_eq!(zone_of("web { } extra"), ConfZone::Name);
    }

    #[test]
    fn test_key_zone_errors() {
        assert_eq!(zone_of("web { exec.= x; }"), ConfZone::Key);
        assert_eq!(zone_of("web { exec.; }"), ConfZone::Key);
        assert_eq!(zone_of("web { Host = x; }"), ConfZone::Key);
        assert_eq!(zone_of("web { persist }"), ConfZone::Key);
        assert_eq!(zone_of("web { a = b;"), ConfZone::Key);
        assert_eq!(zone_of("web { exec-start = x; }"), ConfZone::Key);
    }

    #[test]
    fn test_value_zone_errors() {
        assert_eq!(zone_of("web { a = ; }"), ConfZone::Value);
        assert_eq!(zone_of("web { a = \"\"; }"), ConfZone::Value);
        assert_eq!(zone_of("web { a = \"open; }"), ConfZone::Value);
        assert_eq!(zone_of("web { a = b }"), ConfZone::Value);
        assert_eq!(zone_of("web { a ="), ConfZone::Value);
    }

    #[test]
    fn test_write_quoting() {
        let mut conf = JailConf::new("web");
        conf.set("persist", "true");
        conf.set("exec.start", "/bin/sh /etc/rc");
        conf.set("path", "/jails/web");

        assert_eq!(
            conf.to_string(),
            "web {\n  exec.start = \"/bin/sh /etc/rc\";\n  path = /jails/web;\n  persist;\n}\n"
        );
    }

    #[test]
    fn test_round_trip_key_set() {
        let first = JailConf::parse(WEB).unwrap();
        let second = JailConf::parse(&first.to_string()).unwrap();
        assert_eq!(first, second);

        let mut odd = JailConf::new("odd");
        odd.set("exec.prestart", "echo a;b");
        odd.set("osrelease", "13.2-RELEASE");
        assert_eq!(JailConf::parse(&odd.to_string()).unwrap(), odd);
    }

    #[test]
    fn test_parse_json_file() {
        let conf = JailConf::parse_json(
            r#"{"version": "1", "jail": {"name": "api", "host.hostname": "api.local"}}"#,
        )
        .unwrap();
        assert_eq!(conf.name, "api");
        assert_eq!(conf.get("host.hostname"), Some("api.local"));
        assert!(!conf.config.contains_key("name"));

        assert!(JailConf::parse_json(r#"{"jail": {"host.hostname": "x"}}"#).is_err());
        assert!(JailConf::parse_json(r#"{"jail": {"name": "api", "Bad": "x"}}"#).is_err());
    }

    #[test]
    fn test_parse_json_rejects_unwritable_values() {
        let zone = |text: &str| match JailConf::parse_json(text) {
            Err(Error::ConfBlock { zone, .. }) => zone,
            other => panic!("expected a block error, got {:?}", other),
        };
        assert_eq!(
            zone(r#"{"jail": {"name": "api", "exec.clean": ""}}"#),
            ConfZone::Value
        );
        assert_eq!(
            zone(r#"{"jail": {"name": "api", "exec.start": "sh -c \"echo hi\""}}"#),
            ConfZone::Value
        );

        let conf = JailConf::parse_json(
            r#"{"jail": {"name": "api", "exec.start": "sh -c 'echo hi; true'", "persist": "true"}}"#,
        )
        .unwrap();
        assert_eq!(JailConf::parse(&conf.to_string()).unwrap(), conf);
    }

    #[test]
    fn test_validate_path_requires_exec() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = JailConf::new("web");
        conf.set("path", &dir.path().display().to_string());
        conf.set("exec.stop", "/bin/sh /etc/rc.shutdown");

        match conf.validate() {
            Err(Error::MissingKey(key)) => assert_eq!(key, "exec.start"),
            other => panic!("expected missing exec.start, got {:?}", other),
        }

        conf.set("exec.start", "/bin/sh /etc/rc");
        conf.validate().unwrap();
    }

    #[test]
    fn test_validate_without_path() {
        let mut conf = JailConf::new("web");
        conf.set("host.hostname", "web.local");
        conf.validate().unwrap();

        conf.set("path", "/nonexistent/jailguard/web");
        assert!(matches!(conf.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_apply_defaults() {
        let mut conf = JailConf::new("web");
        conf.set("exec.start", "/usr/local/bin/start");
        conf.apply_defaults();

        assert_eq!(conf.get("host.hostname"), Some("web"));
        assert_eq!(conf.get("exec.start"), Some("/usr/local/bin/start"));
        assert_eq!(conf.get("exec.stop"), Some(DEFAULT_EXEC_STOP));
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs/web.jail");

        let mut conf = JailConf::parse(WEB).unwrap();
        conf.write(&path).unwrap();
        assert_eq!(conf.filepath.as_deref(), Some(path.as_path()));

        let read = JailConf::from_file(&path).unwrap();
        assert_eq!(read.config, conf.config);

        conf.remove().unwrap();
        assert!(!path.exists());
        conf.remove().unwrap();

        assert!(matches!(
            JailConf::from_file(&path),
            Err(Error::NotFound { .. })
        ));
    }
}
