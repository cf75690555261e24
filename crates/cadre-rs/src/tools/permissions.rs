//! Tool permissions, set per team or per session.
//!
//! Patterns are globs over tool names, optionally followed by argument
//! conditions: `shell:cmd=ls*` matches calls to `shell` whose `cmd`
//! argument starts with `ls`, and `shell:cmd=git *:cwd=/repo/*` requires both
//! conditions. Tool names may themselves contain colons (`remote:search`);
//! the first `key=value` segment starts the argument conditions. Matching is
//! case-insensitive.
//!
//! Deny patterns are checked first, then allow patterns. Anything else falls
//! through to the normal confirmation policy.

use crate::error::TeamError;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Allow/deny pattern lists as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl PermissionsConfig {
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allow.push(pattern.into());
        self
    }

    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.deny.push(pattern.into());
        self
    }
}

/// Outcome of checking a call against the permission patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Run without confirmation.
    Allow,
    /// Refuse the call.
    Deny,
    /// No pattern matched; the tool's own confirmation policy applies.
    Ask,
}

impl fmt::Display for PermissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionDecision::Allow => "allow",
            PermissionDecision::Deny => "deny",
            PermissionDecision::Ask => "ask",
        })
    }
}

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    tool: GlobMatcher,
    args: Vec<(String, GlobMatcher)>,
}

impl Rule {
    fn compile(pattern: &str) -> Result<Self, TeamError> {
        let mut parts = pattern.split(':');
        let mut tool_parts: Vec<&str> = parts.next().into_iter().collect();
        let mut args = Vec::new();
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    args.push((key.to_string(), glob(pattern, value)?));
                }
                // Segments without `=` after the first condition are ignored.
                _ if args.is_empty() => tool_parts.push(part),
                _ => {}
            }
        }
        Ok(Self {
            source: pattern.to_string(),
            tool: glob(pattern, &tool_parts.join(":"))?,
            args,
        })
    }

    fn matches(&self, tool: &str, args: Option<&serde_json::Value>) -> bool {
        if !self.tool.is_match(tool) {
            return false;
        }
        if self.args.is_empty() {
            return true;
        }
        let Some(args) = args.and_then(|a| a.as_object()) else {
            return false;
        };
        self.args.iter().all(|(key, matcher)| {
            args.get(key)
                .is_some_and(|value| matcher.is_match(arg_to_string(value)))
        })
    }
}

fn glob(pattern: &str, expr: &str) -> Result<GlobMatcher, TeamError> {
    GlobBuilder::new(expr)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|source| TeamError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn arg_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compiled permission patterns.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    allow: Vec<Rule>,
    deny: Vec<Rule>,
}

impl Permissions {
    pub fn compile(config: &PermissionsConfig) -> Result<Self, TeamError> {
        let compile_all = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| Rule::compile(p))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: compile_all(&config.allow)?,
            deny: compile_all(&config.deny)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Check a call. `args` is the parsed arguments object, if any.
    pub fn check(&self, tool: &str, args: Option<&serde_json::Value>) -> PermissionDecision {
        if let Some(rule) = self.deny.iter().find(|r| r.matches(tool, args)) {
            tracing::debug!("Tool {tool} denied by pattern '{}'", rule.source);
            return PermissionDecision::Deny;
        }
        if let Some(rule) = self.allow.iter().find(|r| r.matches(tool, args)) {
            tracing::debug!("Tool {tool} allowed by pattern '{}'", rule.source);
            return PermissionDecision::Allow;
        }
        PermissionDecision::Ask
    }

    /// Convenience for a raw JSON argument string.
    pub fn check_call(&self, tool: &str, arguments: &str) -> PermissionDecision {
        let args = serde_json::from_str::<serde_json::Value>(arguments).ok();
        self.check(tool, args.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn perms(allow: &[&str], deny: &[&str]) -> Permissions {
        let mut config = PermissionsConfig::default();
        for p in allow {
            config = config.allow(*p);
        }
        for p in deny {
            config = config.deny(*p);
        }
        Permissions::compile(&config).unwrap()
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = perms(&["*"], &["shell"]);
        assert_eq!(p.check("shell", None), PermissionDecision::Deny);
        assert_eq!(p.check("read_file", None), PermissionDecision::Allow);
    }

    #[test]
    fn no_match_asks() {
        let p = perms(&["read_*"], &[]);
        assert_eq!(p.check("write_file", None), PermissionDecision::Ask);
        assert!(Permissions::default().is_empty());
        assert_eq!(Permissions::default().check("x", None), PermissionDecision::Ask);
    }

    #[test]
    fn argument_conditions() {
        let p = perms(&["shell:cmd=ls*"], &["shell:cmd=sudo *"]);
        assert_eq!(
            p.check("shell", Some(&json!({"cmd": "ls -la /tmp"}))),
            PermissionDecision::Allow
        );
        assert_eq!(
            p.check("shell", Some(&json!({"cmd": "sudo rm -rf /"}))),
            PermissionDecision::Deny
        );
        assert_eq!(p.check("shell", Some(&json!({"cmd": "cat x"}))), PermissionDecision::Ask);
        // Conditions need arguments.
        assert_eq!(p.check("shell", None), PermissionDecision::Ask);
    }

    #[test]
    fn multiple_conditions_and_non_string_values() {
        let p = perms(&["fetch:retries=3:host=*.example.com"], &[]);
        assert_eq!(
            p.check_call("fetch", r#"{"retries": 3, "host": "api.example.com"}"#),
            PermissionDecision::Allow
        );
        assert_eq!(
            p.check_call("fetch", r#"{"retries": 3, "host": "evil.org"}"#),
            PermissionDecision::Ask
        );
    }

    #[test]
    fn colons_in_tool_names() {
        let p = perms(&["remote:github:*"], &[]);
        assert_eq!(p.check("remote:github:create_issue", None), PermissionDecision::Allow);
        assert_eq!(p.check("remote:gitlab:x", None), PermissionDecision::Ask);
    }

    #[test]
    fn case_insensitive() {
        let p = perms(&[], &["Shell"]);
        assert_eq!(p.check("SHELL", None), PermissionDecision::Deny);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let config = PermissionsConfig::default().deny("[unclosed");
        let err = Permissions::compile(&config).unwrap_err();
        assert!(matches!(err, TeamError::InvalidPattern { .. }));
    }

    #[test]
    fn config_deserializes() {
        let config: PermissionsConfig = serde_json::from_str(r#"{"deny": ["shell"]}"#).unwrap();
        assert!(config.allow.is_empty());
        assert_eq!(config.deny, vec!["shell"]);
    }
}
