//! Built-in dangerous-command catalog, the default `command_blacklist`.

use toolgate_state::RiskLevel::{self, Critical, High, Low, Medium};

use crate::config::CommandRule;

/// (category, pattern, description, risk)
const RULES: &[(&str, &str, &str, RiskLevel)] = &[
    // filesystem destruction
    (
        "filesystem_destruction",
        r"rm\s+-rf\s+/",
        "Recursive deletion from the filesystem root",
        Critical,
    ),
    (
        "filesystem_destruction",
        r"rm\s+-rf\s+~",
        "Recursive deletion of the home directory",
        High,
    ),
    ("filesystem_destruction", r"mkfs\.", "Filesystem formatting", Critical),
    (
        "filesystem_destruction",
        r"dd\s+if=/dev/(zero|random|urandom)\s+of=/dev/[sh]d",
        "Raw disk overwrite",
        Critical,
    ),
    // system destruction
    (
        "system_destruction",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "Fork bomb",
        Critical,
    ),
    (
        "system_destruction",
        r">\s*/dev/[sh]d[a-z]",
        "Write to a raw disk device",
        Critical,
    ),
    (
        "system_destruction",
        r"chmod\s+-R\s+777\s+/",
        "Recursive world-writable permissions",
        High,
    ),
    (
        "system_destruction",
        r"chmod\s+777\s+/etc",
        "World-writable system configuration",
        High,
    ),
    (
        "system_destruction",
        r">\s*/etc/",
        "Redirect into system configuration",
        High,
    ),
    // privilege escalation
    ("privilege_escalation", r"\bsudo\b", "Uses sudo", High),
    ("privilege_escalation", r"\bsu\s+-", "Switches user", High),
    (
        "privilege_escalation",
        r"chmod\s+([ugoa]*\+[rwx]*s|[2-7][0-7]{3}\b)",
        "Sets the SUID/SGID bit",
        High,
    ),
    // remote code execution
    (
        "remote_code_execution",
        r"curl.*\|\s*(ba)?sh",
        "Pipes a downloaded script into a shell (curl)",
        Critical,
    ),
    (
        "remote_code_execution",
        r"wget.*\|\s*(ba)?sh",
        "Pipes a downloaded script into a shell (wget)",
        Critical,
    ),
    (
        "remote_code_execution",
        r"curl.*-o\s*/tmp.*&&.*sh",
        "Downloads then executes a script",
        High,
    ),
    (
        "remote_code_execution",
        r#"python3?\s+-c\s+['"]import\s+urllib"#,
        "Inline Python download",
        Medium,
    ),
    // network attacks
    ("network_attacks", r"\bnc\s+-l", "Opens a network listener", High),
    ("network_attacks", r"\bnmap\s+", "Network scan", Medium),
    ("network_attacks", r"\btcpdump\s+", "Packet capture", Medium),
    // information disclosure
    (
        "information_disclosure",
        r"cat\s+/etc/passwd",
        "Reads the user list",
        Low,
    ),
    (
        "information_disclosure",
        r"cat\s+/etc/shadow",
        "Reads password hashes",
        High,
    ),
    (
        "information_disclosure",
        r"cat\s+~/\.ssh/",
        "Reads SSH keys",
        High,
    ),
    (
        "information_disclosure",
        r"cat\s+.*\.env\b",
        "Reads an environment file",
        Medium,
    ),
    (
        "information_disclosure",
        r"\bprintenv\b|^\s*env\s*$",
        "Prints the environment",
        Low,
    ),
    // resource exhaustion
    (
        "resource_exhaustion",
        r"while\s+true.*do",
        "Unbounded loop",
        Medium,
    ),
    (
        "resource_exhaustion",
        r"for\s*\(\s*;\s*;\s*\)",
        "Unbounded loop",
        Medium,
    ),
    (
        "resource_exhaustion",
        r"dd\s+if=/dev/zero",
        "Disk filling",
        High,
    ),
    ("resource_exhaustion", r"\byes(\s|$)", "Unbounded output", Medium),
];

/// The default blacklist, in evaluation order.
pub fn default_blacklist() -> Vec<CommandRule> {
    RULES
        .iter()
        .map(|(category, pattern, description, risk)| {
            CommandRule::categorized(category, pattern, description, *risk)
        })
        .collect()
}

/// Category names present in the catalog.
pub fn categories() -> Vec<&'static str> {
    let mut out: Vec<&'static str> = RULES.iter().map(|r| r.0).collect();
    out.dedup();
    out
}
