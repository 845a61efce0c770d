//! Forwarding Rules
//!
//! A rule file holds one rule per line in the form
//! `sourcePort,targetIP,targetPort`. Lines that do not split into three
//! fields are rejected one by one; the rest of the file is still used.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{RuleParseError, StartError};
use crate::Result;

/// A forwarding rule exactly as written in the rule file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub source_port: String,
    pub target_host: String,
    pub target_port: String,
}

/// A rule whose fields have been validated and whose target is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRule {
    pub listen_port: u16,
    pub target: SocketAddr,
}

/// A rejected line of the rule file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    pub line: usize,
    pub content: String,
    pub error: RuleParseError,
}

/// Outcome of reading a rule file
#[derive(Debug, Default, Clone)]
pub struct ParsedRules {
    pub rules: Vec<ForwardRule>,
    pub rejected: Vec<RejectedLine>,
}

impl ForwardRule {
    /// Build a rule from typed values
    pub fn new(source_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            source_port: source_port.to_string(),
            target_host: target_host.into(),
            target_port: target_port.to_string(),
        }
    }

    /// Parse a single `sourcePort,targetIP,targetPort` line
    pub fn parse_line(line_no: usize, line: &str) -> std::result::Result<Self, RuleParseError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(RuleParseError::FieldCount {
                line: line_no,
                found: fields.len(),
            });
        }

        for (value, field) in fields.iter().zip(["sourcePort", "targetIP", "targetPort"]) {
            if value.is_empty() {
                return Err(RuleParseError::EmptyField { line: line_no, field });
            }
        }

        Ok(Self {
            source_port: fields[0].to_string(),
            target_host: fields[1].to_string(),
            target_port: fields[2].to_string(),
        })
    }

    /// Validate the fields and resolve the target.
    ///
    /// Fields are checked in file order: source port, target address,
    /// target port. Host names are resolved within `resolve_timeout`.
    pub async fn resolve(&self, resolve_timeout: Duration) -> std::result::Result<ResolvedRule, StartError> {
        self.resolve_until(Instant::now() + resolve_timeout).await
    }

    /// Same as [`ForwardRule::resolve`], with host name resolution bounded
    /// by an absolute deadline the caller can keep using afterwards
    pub async fn resolve_until(&self, deadline: Instant) -> std::result::Result<ResolvedRule, StartError> {
        let listen_port = parse_port(&self.source_port)
            .ok_or_else(|| StartError::InvalidSourcePort(self.source_port.clone()))?;

        let literal = self.target_host.parse::<IpAddr>().ok();
        if literal.is_none() && !is_valid_hostname(&self.target_host) {
            return Err(StartError::InvalidTargetAddress(self.target_host.clone()));
        }

        let target_port = parse_port(&self.target_port)
            .ok_or_else(|| StartError::InvalidTargetPort(self.target_port.clone()))?;

        let target = match literal {
            Some(ip) => SocketAddr::new(ip, target_port),
            None => resolve_host(&self.target_host, target_port, deadline).await?,
        };

        Ok(ResolvedRule { listen_port, target })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.source_port, self.target_host, self.target_port)
    }
}

impl ParsedRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parse the contents of a rule file.
///
/// Blank lines and `#` comments are ignored; every other malformed line is
/// recorded in `rejected` and skipped.
pub fn parse_rules(content: &str) -> ParsedRules {
    let mut parsed = ParsedRules::default();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match ForwardRule::parse_line(line_no, raw) {
            Ok(rule) => {
                debug!(line = line_no, rule = %rule, "Parsed forwarding rule");
                parsed.rules.push(rule);
            }
            Err(error) => {
                warn!(line = line_no, content = %raw, error = %error, "Skipping malformed rule");
                parsed.rejected.push(RejectedLine {
                    line: line_no,
                    content: raw.to_string(),
                    error,
                });
            }
        }
    }

    parsed
}

/// Read and parse a rule file
pub fn load_rules(path: &Path) -> Result<ParsedRules> {
    tracing::info!("Loading forwarding rules from: {}", path.display());
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rule file: {}", path.display()))?;

    let parsed = parse_rules(&content);
    tracing::info!(
        "Loaded {} forwarding rule(s), rejected {} line(s)",
        parsed.rules.len(),
        parsed.rejected.len()
    );
    Ok(parsed)
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }

    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

async fn resolve_host(host: &str, port: u16, deadline: Instant) -> std::result::Result<SocketAddr, StartError> {
    debug!("Resolving target host: {}:{}", host, port);

    match timeout_at(deadline, lookup_host((host, port))).await {
        Ok(Ok(mut addrs)) => addrs
            .next()
            .ok_or_else(|| StartError::InvalidTargetAddress(format!("{} (no addresses)", host))),
        Ok(Err(e)) => Err(StartError::InvalidTargetAddress(format!("{} ({})", host, e))),
        Err(_) => Err(StartError::InvalidTargetAddress(format!(
            "{} (resolution timed out)",
            host
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_millis(500);

    #[test]
    fn test_parse_valid_line() {
        let rule = ForwardRule::parse_line(1, "9000,127.0.0.1,9001").unwrap();
        assert_eq!(rule.source_port, "9000");
        assert_eq!(rule.target_host, "127.0.0.1");
        assert_eq!(rule.target_port, "9001");
        assert_eq!(rule.to_string(), "9000,127.0.0.1,9001");
    }

    #[test]
    fn test_parse_trims_fields() {
        let rule = ForwardRule::parse_line(1, " 9000 , 10.0.0.1 ,9001\r").unwrap();
        assert_eq!(rule, ForwardRule::new(9000, "10.0.0.1", 9001));
    }

    #[test]
    fn test_parse_wrong_field_count() {
        assert_eq!(
            ForwardRule::parse_line(3, "abc"),
            Err(RuleParseError::FieldCount { line: 3, found: 1 })
        );
        assert_eq!(
            ForwardRule::parse_line(4, "1,2"),
            Err(RuleParseError::FieldCount { line: 4, found: 2 })
        );
        assert_eq!(
            ForwardRule::parse_line(5, "1,2,3,4"),
            Err(RuleParseError::FieldCount { line: 5, found: 4 })
        );
    }

    #[test]
    fn test_parse_empty_field() {
        assert_eq!(
            ForwardRule::parse_line(2, "9000,,9001"),
            Err(RuleParseError::EmptyField { line: 2, field: "targetIP" })
        );
    }

    #[test]
    fn test_malformed_lines_do_not_stop_parsing() {
        let content = "abc\n9000,127.0.0.1,9001\n1,2\n\n# comment\n9002,127.0.0.1,9003\n";
        let parsed = parse_rules(content);

        assert_eq!(parsed.rules.len(), 2);
        assert_eq!(parsed.rules[0], ForwardRule::new(9000, "127.0.0.1", 9001));
        assert_eq!(parsed.rules[1], ForwardRule::new(9002, "127.0.0.1", 9003));

        let lines: Vec<usize> = parsed.rejected.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![1, 3]);
        assert_eq!(parsed.rejected[0].content, "abc");
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let resolved = ForwardRule::new(9000, "127.0.0.1", 9001).resolve(LIMIT).await.unwrap();
        assert_eq!(resolved.listen_port, 9000);
        assert_eq!(resolved.target, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());

        let v6 = ForwardRule::new(9000, "::1", 22).resolve(LIMIT).await.unwrap();
        assert_eq!(v6.target, "[::1]:22".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_fields() {
        let rule = ForwardRule::parse_line(1, "http,127.0.0.1,9001").unwrap();
        assert!(matches!(rule.resolve(LIMIT).await, Err(StartError::InvalidSourcePort(_))));

        let rule = ForwardRule::parse_line(1, "0,127.0.0.1,9001").unwrap();
        assert!(matches!(rule.resolve(LIMIT).await, Err(StartError::InvalidSourcePort(_))));

        let rule = ForwardRule::parse_line(1, "70000,127.0.0.1,9001").unwrap();
        assert!(matches!(rule.resolve(LIMIT).await, Err(StartError::InvalidSourcePort(_))));

        let rule = ForwardRule::parse_line(1, "9000,not an ip!,9001").unwrap();
        assert!(matches!(rule.resolve(LIMIT).await, Err(StartError::InvalidTargetAddress(_))));

        let rule = ForwardRule::parse_line(1, "9000,127.0.0.1,-1").unwrap();
        assert!(matches!(rule.resolve(LIMIT).await, Err(StartError::InvalidTargetPort(_))));
    }

    #[tokio::test]
    async fn test_resolve_until_elapsed_deadline() {
        let deadline = Instant::now() - Duration::from_millis(1);

        // Literals never wait on the deadline
        let literal = ForwardRule::new(9000, "127.0.0.1", 9001).resolve_until(deadline).await;
        assert!(literal.is_ok());

        let host = ForwardRule::new(9000, "localhost", 9001).resolve_until(deadline).await;
        assert!(matches!(host, Err(StartError::InvalidTargetAddress(_))));
    }

    #[test]
    fn test_hostname_syntax() {
        assert!(is_valid_hostname("localhost"));
        assert!(is_valid_hostname("relay-1.example.com"));
        assert!(is_valid_hostname("example.com."));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-bad.example"));
        assert!(!is_valid_hostname("a..b"));
        assert!(!is_valid_hostname("under_score"));
    }

    #[test]
    fn test_load_rules_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Settings.xml");
        std::fs::write(&path, "9000,127.0.0.1,9001\nbroken\n").unwrap();

        let parsed = load_rules(&path).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rejected.len(), 1);

        assert!(load_rules(&dir.path().join("missing.txt")).is_err());
    }
}
