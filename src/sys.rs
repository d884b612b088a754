//! Host commands and release detection
//!
//! Every interaction with the base system (`jail`, `jls`, `ifconfig`, `pfctl`,
//! `tar`, `fetch`, `chflags`, `uname`) goes through a [`CommandRunner`], so the
//! rest of the crate only deals with "run this, give me stdout".

use crate::error::{Error, Result};
use std::fmt;
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs external programs on behalf of descriptors and the orchestrator
pub trait CommandRunner {
    /// Run a program and return its stdout. A non-zero exit is an error.
    fn output(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Run a program when only the exit status matters
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.output(program, args).map(|_| ())
    }
}

/// Runner backed by `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<String> {
        let line = command_line(program, args);
        debug!(command = %line, "running");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::CommandSpawn {
                command: line.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command: line,
                message: match stderr.trim() {
                    "" => format!("exited with {}", output.status),
                    msg => msg.to_string(),
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render a program and its arguments the way a shell user would type them
pub fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Check a jail or interface name: a lowercase letter followed by 1 to 31
/// lowercase letters, digits, `_` or `-`, with no `--` anywhere
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && (2..=32).contains(&name.len())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && !name.contains("--");

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// FreeBSD release type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseType {
    Current,
    Stable,
    Release,
    Beta(u8),
    Rc(u8),
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseType::Current => write!(f, "CURRENT"),
            ReleaseType::Stable => write!(f, "STABLE"),
            ReleaseType::Release => write!(f, "RELEASE"),
            ReleaseType::Beta(n) => write!(f, "BETA{}", n),
            ReleaseType::Rc(n) => write!(f, "RC{}", n),
        }
    }
}

/// A FreeBSD release identifier such as `13.2-RELEASE` or `14.1-RELEASE-p3`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub major: u8,
    pub minor: u8,
    /// Patch level (from -pX suffix)
    pub patch: Option<u8>,
    pub release_type: ReleaseType,
}

impl OsRelease {
    /// Parse a FreeBSD release string
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('-').collect();

        if parts.len() < 2 || parts.len() > 3 {
            return Err(Error::InvalidVersion(s.to_string()));
        }

        let (major, minor) = parts[0]
            .split_once('.')
            .ok_or_else(|| Error::InvalidVersion(format!("Invalid version number: {}", parts[0])))?;

        let major = major
            .parse::<u8>()
            .map_err(|_| Error::InvalidVersion(format!("Invalid major version: {}", major)))?;
        let minor = minor
            .parse::<u8>()
            .map_err(|_| Error::InvalidVersion(format!("Invalid minor version: {}", minor)))?;

        let numbered = |prefix: &str, tag: &str| -> Result<u8> {
            let n = tag.strip_prefix(prefix).unwrap_or_default();
            if n.is_empty() {
                return Ok(1);
            }
            n.parse::<u8>()
                .map_err(|_| Error::InvalidVersion(format!("Unknown release type: {}", tag)))
        };

        let release_type = match parts[1] {
            "CURRENT" => ReleaseType::Current,
            "STABLE" => ReleaseType::Stable,
            "RELEASE" => ReleaseType::Release,
            tag if tag.starts_with("BETA") => ReleaseType::Beta(numbered("BETA", tag)?),
            tag if tag.starts_with("RC") => ReleaseType::Rc(numbered("RC", tag)?),
            tag => {
                return Err(Error::InvalidVersion(format!(
                    "Unknown release type: {}",
                    tag
                )));
            }
        };

        let patch = match parts.get(2) {
            Some(p) => Some(
                p.strip_prefix('p')
                    .and_then(|n| n.parse::<u8>().ok())
                    .ok_or_else(|| Error::InvalidVersion(format!("Invalid patch level: {}", p)))?,
            ),
            None => None,
        };

        Ok(OsRelease {
            major,
            minor,
            patch,
            release_type,
        })
    }

    /// The same release without its patch level, as published on the mirrors
    pub fn without_patch(&self) -> Self {
        OsRelease {
            patch: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}-{}", self.major, self.minor, self.release_type)?;
        if let Some(patch) = self.patch {
            write!(f, "-p{}", patch)?;
        }
        Ok(())
    }
}

/// Release and machine of the running host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub release: OsRelease,
    pub machine: String,
}

impl HostInfo {
    /// Ask `uname -m -r` for the host release and hardware platform
    pub fn detect(sys: &dyn CommandRunner) -> Result<Self> {
        let out = sys.output("uname", &["-m", "-r"])?;
        Self::parse(&out)
    }

    fn parse(out: &str) -> Result<Self> {
        let mut tokens = out.split_whitespace();
        let release = tokens
            .next()
            .ok_or_else(|| Error::InvalidVersion("empty uname output".to_string()))?;
        let machine = tokens.next().unwrap_or("amd64");

        Ok(HostInfo {
            release: OsRelease::parse(release)?,
            machine: machine.to_string(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;

    #[test]
    fn test_parse_release() {
        let rel = OsRelease::parse("13.2-RELEASE").unwrap();
        assert_eq!(rel.major, 13);
        assert_eq!(rel.minor, 2);
        assert_eq!(rel.patch, None);
        assert_eq!(rel.release_type, ReleaseType::Release);
    }

    #[test]
    fn test_parse_release_with_patch() {
        let rel = OsRelease::parse("14.1-RELEASE-p3").unwrap();
        assert_eq!(rel.patch, Some(3));
        assert_eq!(rel.without_patch().to_string(), "14.1-RELEASE");
        assert_eq!(rel.to_string(), "14.1-RELEASE-p3");
    }

    #[test]
    fn test_parse_prerelease() {
        assert_eq!(
            OsRelease::parse("15.0-BETA2").unwrap().release_type,
            ReleaseType::Beta(2)
        );
        assert_eq!(
            OsRelease::parse("15.0-RC1").unwrap().release_type,
            ReleaseType::Rc(1)
        );
        assert_eq!(
            OsRelease::parse("16.0-CURRENT").unwrap().release_type,
            ReleaseType::Current
        );
    }

    #[test]
    fn test_parse_invalid_release() {
        assert!(OsRelease::parse("").is_err());
        assert!(OsRelease::parse("13-RELEASE").is_err());
        assert!(OsRelease::parse("13.2-FOO").is_err());
        assert!(OsRelease::parse("13.2-RELEASE-x1").is_err());
        assert!(OsRelease::parse("../13.2-RELEASE").is_err());
    }

    #[test]
    fn test_host_info_from_uname() {
        let sys = FakeRunner::new(|program, args| {
            assert_eq!(program, "uname");
            assert_eq!(args, ["-m", "-r"]);
            Ok("14.1-RELEASE-p5 amd64\n".to_string())
        });

        let host = HostInfo::detect(&sys).unwrap();
        assert_eq!(host.release.without_patch().to_string(), "14.1-RELEASE");
        assert_eq!(host.machine, "amd64");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("myjail").is_ok());
        assert!(validate_name("web_01-a").is_ok());
        assert!(validate_name("a").is_err());
        assert!(validate_name("1jail").is_err());
        assert!(validate_name("My").is_err());
        assert!(validate_name("bad--name").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(33)).is_err());
        assert!(validate_name(&"a".repeat(32)).is_ok());
    }

    #[test]
    fn test_fake_runner_records_calls() {
        let sys = FakeRunner::new(|program, _| match program {
            "false" => Err("boom".to_string()),
            _ => Ok("out".to_string()),
        });

        assert_eq!(sys.output("echo", &["hi"]).unwrap(), "out");
        assert!(matches!(
            sys.run("false", &[]),
            Err(Error::CommandFailed { .. })
        ));
        assert_eq!(sys.calls(), vec!["echo hi", "false"]);
    }
}
