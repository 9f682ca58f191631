//! Lexical path checks for file tools.
//!
//! Paths are resolved against the sandbox working directory without touching
//! any filesystem: `~` expands to the configured home, `.` and `..` collapse,
//! and prefixes are compared component-wise so `/etcetera` is not `/etc`.

/// Paths that must not be read or written.
const SENSITIVE_PATHS: [&str; 8] = [
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/root",
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
    "~/.config",
];

/// Directory names that hold credentials wherever they appear.
const SENSITIVE_COMPONENTS: [&str; 3] = [".ssh", ".gnupg", ".aws"];

/// System directories that must not be written.
const READONLY_PATHS: [&str; 10] = [
    "/etc", "/usr", "/bin", "/sbin", "/lib", "/lib64", "/boot", "/sys", "/proc", "/dev",
];

#[derive(Debug, Clone)]
pub struct PathGuard {
    working_directory: String,
    home_directory: String,
    sensitive: Vec<String>,
}

impl PathGuard {
    pub fn new(working_directory: impl Into<String>, home_directory: impl Into<String>) -> Self {
        let working_directory = normalize_absolute(&working_directory.into());
        let home_directory = normalize_absolute(&home_directory.into());
        let sensitive = SENSITIVE_PATHS
            .iter()
            .map(|p| expand_home(p, &home_directory))
            .collect();
        Self {
            working_directory,
            home_directory,
            sensitive,
        }
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    /// Resolve `path` to an absolute, lexically normalized form.
    pub fn normalize(&self, path: &str) -> String {
        let path = path.trim();
        if path.is_empty() {
            return self.working_directory.clone();
        }
        let expanded = expand_home(path, &self.home_directory);
        if expanded.starts_with('/') {
            normalize_absolute(&expanded)
        } else {
            normalize_absolute(&format!("{}/{}", self.working_directory, expanded))
        }
    }

    /// `Err(reason)` when reading `path` is forbidden.
    pub fn check_read(&self, path: &str) -> Result<(), String> {
        let normalized = self.normalize(path);
        match self.sensitive_match(&normalized) {
            Some(hit) => Err(format!("read of sensitive path {hit} ({normalized})")),
            None => Ok(()),
        }
    }

    /// `Err(reason)` when writing `path` is forbidden.
    pub fn check_write(&self, path: &str) -> Result<(), String> {
        let normalized = self.normalize(path);
        if normalized == "/" || parent_of(&normalized) == "/" {
            return Err(format!("write into the filesystem root ({normalized})"));
        }
        if let Some(dir) = READONLY_PATHS.iter().find(|p| is_under(&normalized, p)) {
            return Err(format!("write to system path {dir} ({normalized})"));
        }
        match self.sensitive_match(&normalized) {
            Some(hit) => Err(format!("write to sensitive path {hit} ({normalized})")),
            None => Ok(()),
        }
    }

    fn sensitive_match(&self, normalized: &str) -> Option<String> {
        if let Some(hit) = self.sensitive.iter().find(|p| is_under(normalized, p)) {
            return Some(hit.clone());
        }
        normalized
            .split('/')
            .find(|c| SENSITIVE_COMPONENTS.contains(c))
            .map(|c| c.to_string())
    }
}

fn expand_home(path: &str, home: &str) -> String {
    if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

/// Collapse `.`, `..` and repeated separators in an absolute path.
fn normalize_absolute(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Component-wise prefix test.
fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
