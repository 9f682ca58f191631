//! Pattern-based static risk scoring for shell command strings.
//!
//! Patterns are compiled case-insensitively, so `RM -RF /` and `rm -rf /`
//! hit the same rule. The command text itself is matched raw: no
//! whitespace rewriting, rules use `\s+` where spacing varies. Every rule is
//! evaluated (no short-circuit) so callers see the full risk picture.

use regex::Regex;
use toolgate_state::{RiskLevel, Violation};

use crate::config::{compile_pattern, CommandRule, ConfigResult, SecurityConfig};

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: CommandRule,
    regex: Regex,
}

/// Outcome of analyzing one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAssessment {
    /// Every violation, in rule order.
    pub violations: Vec<Violation>,
    /// Whether no violation reached the block threshold.
    pub safe: bool,
    /// `"description (risk); ..."` over the blocking violations, empty when safe.
    pub reason: String,
}

impl CommandAssessment {
    /// Violations at or above `threshold`.
    pub fn at_least(&self, threshold: RiskLevel) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(move |v| v.risk_level.at_least(threshold))
    }

    /// Highest risk found, if any.
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.violations.iter().map(|v| v.risk_level).max()
    }
}

#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    blacklist: Vec<CompiledRule>,
    whitelist: Vec<Regex>,
    threshold: RiskLevel,
}

impl CommandAnalyzer {
    pub fn new(
        blacklist: &[CommandRule],
        whitelist: &[String],
        threshold: RiskLevel,
    ) -> ConfigResult<Self> {
        let blacklist = blacklist
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: compile_pattern(&rule.pattern)?,
                    rule: rule.clone(),
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        let whitelist = whitelist
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            blacklist,
            whitelist,
            threshold,
        })
    }

    pub fn from_config(config: &SecurityConfig) -> ConfigResult<Self> {
        Self::new(
            &config.command_blacklist,
            &config.command_whitelist,
            config.block_threshold,
        )
    }

    pub fn threshold(&self) -> RiskLevel {
        self.threshold
    }

    pub fn has_blacklist(&self) -> bool {
        !self.blacklist.is_empty()
    }

    pub fn has_whitelist(&self) -> bool {
        !self.whitelist.is_empty()
    }

    /// Whether `command` matches any whitelist pattern.
    pub fn is_whitelisted(&self, command: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(command))
    }

    /// One violation per matching blacklist rule, in configuration order.
    ///
    /// `matched_text` is the first non-empty match of the rule; a rule that
    /// only matches the empty string does not fire.
    pub fn analyze(&self, command: &str) -> Vec<Violation> {
        if command.trim().is_empty() {
            return Vec::new();
        }

        self.blacklist
            .iter()
            .filter_map(|compiled| {
                let hit = compiled
                    .regex
                    .find_iter(command)
                    .find(|m| !m.as_str().is_empty())?;
                Some(Violation::new(
                    compiled.rule.category.clone(),
                    compiled.rule.pattern.clone(),
                    compiled.rule.description.clone(),
                    compiled.rule.risk_level,
                    hit.as_str(),
                ))
            })
            .collect()
    }

    /// Analyze and decide against the configured threshold.
    pub fn assess(&self, command: &str) -> CommandAssessment {
        let violations = self.analyze(command);
        let reason = violations
            .iter()
            .filter(|v| v.risk_level.at_least(self.threshold))
            .map(|v| format!("{} ({})", v.description, v.risk_level))
            .collect::<Vec<_>>()
            .join("; ");

        CommandAssessment {
            safe: reason.is_empty(),
            violations,
            reason,
        }
    }

    /// `(true, "")` when safe, otherwise `(false, reason)`.
    pub fn is_safe(&self, command: &str) -> (bool, String) {
        let assessment = self.assess(command);
        (assessment.safe, assessment.reason)
    }
}
