//! In-process sandbox backend.
//!
//! Keeps one file map per session and interprets a handful of shell
//! commands (`echo`, `cat`, `ls`, `pwd`, `find ... -name`, `sleep`, `exit`,
//! `true`, `false`). Anything else exits 127 unless a scripted response
//! matches. Fault injection hooks let tests drive connect failures,
//! transport errors and slow operations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;

use super::backend::{
    BackendError, BackendResult, CommandOutput, SandboxBackend, SearchMatch, SessionHandle,
    SessionSpec,
};

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    seed: BTreeMap<String, String>,
    sessions: HashMap<String, BTreeMap<String, String>>,
    scripted: Vec<(String, CommandOutput)>,
    commands: Vec<String>,
    fail_connects: u32,
    fail_operations: u32,
    delay: Option<Duration>,
    connects: u64,
    closes: u64,
}

#[derive(Debug, Default)]
pub struct MemorySandbox {
    state: Mutex<State>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// A file present in every session created afterwards.
    pub fn with_file(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.lock().seed.insert(path.into(), content.into());
        self
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn script(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.lock().scripted.push((prefix.into(), output));
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    /// The next `n` operations fail with a transport error.
    pub fn fail_next_operations(&self, n: u32) {
        self.lock().fail_operations = n;
    }

    /// Extra latency before every operation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Forget a sandbox as if the provider had reclaimed it.
    pub fn expire(&self, sandbox_id: &str) {
        self.lock().sessions.remove(sandbox_id);
    }

    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub fn closes(&self) -> u64 {
        self.lock().closes
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<String> {
        self.lock()
            .sessions
            .get(sandbox_id)
            .and_then(|files| files.get(path).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply injected faults and latency for one operation.
    async fn enter(&self, handle: &SessionHandle) -> BackendResult<()> {
        let delay = {
            let mut state = self.lock();
            if state.fail_operations > 0 {
                state.fail_operations -= 1;
                return Err(BackendError::Transport("connection reset".into()));
            }
            if !state.sessions.contains_key(&handle.id) {
                return Err(BackendError::Transport(format!(
                    "sandbox {} not found",
                    handle.id
                )));
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn with_files<T>(
        &self,
        handle: &SessionHandle,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> BackendResult<T> {
        let mut state = self.lock();
        let files = state
            .sessions
            .get_mut(&handle.id)
            .ok_or_else(|| BackendError::Transport(format!("sandbox {} not found", handle.id)))?;
        Ok(f(files))
    }
}

#[async_trait]
impl SandboxBackend for MemorySandbox {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, _spec: &SessionSpec) -> BackendResult<SessionHandle> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BackendError::Transport("sandbox provider unavailable".into()));
        }
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let seed = state.seed.clone();
        state.sessions.insert(id.clone(), seed);
        Ok(SessionHandle::new(id))
    }

    async fn execute_command(
        &self,
        handle: &SessionHandle,
        command: &str,
        cwd: &str,
        _timeout: Duration,
    ) -> BackendResult<CommandOutput> {
        self.enter(handle).await?;
        let started = Instant::now();
        self.lock().commands.push(command.to_string());

        let scripted = self
            .lock()
            .scripted
            .iter()
            .find(|(prefix, _)| command.trim_start().starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone());
        if let Some(out) = scripted {
            return Ok(out);
        }

        let words = match shell_words::split(command) {
            Ok(words) => words,
            Err(e) => {
                return Ok(CommandOutput {
                    stderr: format!("sh: {e}\n"),
                    exit_code: 2,
                    ..CommandOutput::default()
                });
            }
        };
        let mut out = match words.first().map(String::as_str) {
            None | Some("true") => exit(0),
            Some("false") => exit(1),
            Some("pwd") => stdout(format!("{cwd}\n")),
            Some("echo") => stdout(format!("{}\n", words[1..].join(" "))),
            Some("exit") => exit(words.get(1).and_then(|c| c.parse().ok()).unwrap_or(0)),
            Some("sleep") => {
                let arg = words.get(1).map_or("0", String::as_str);
                let interval = arg
                    .parse::<f64>()
                    .ok()
                    .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok());
                match interval {
                    Some(interval) => {
                        tokio::time::sleep(interval).await;
                        exit(0)
                    }
                    None => CommandOutput {
                        stderr: format!("sleep: invalid time interval '{arg}'\n"),
                        exit_code: 1,
                        ..CommandOutput::default()
                    },
                }
            }
            Some("cat") => {
                let paths: Vec<String> = words[1..].iter().map(|p| resolve(cwd, p)).collect();
                self.with_files(handle, |files| cat(files, &paths))?
            }
            Some("ls") => {
                let dir = resolve(cwd, words.get(1).map_or(".", String::as_str));
                self.with_files(handle, |files| stdout(list_dir(files, &dir)))?
            }
            Some("find") => {
                let root = resolve(cwd, words.get(1).map_or(".", String::as_str));
                let pattern = words
                    .iter()
                    .position(|w| w == "-name")
                    .and_then(|i| words.get(i + 1))
                    .cloned()
                    .unwrap_or_else(|| "*".to_string());
                match glob::Pattern::new(&pattern) {
                    Ok(pattern) => {
                        self.with_files(handle, |files| stdout(find(files, &root, &pattern)))?
                    }
                    Err(e) => CommandOutput {
                        stderr: format!("find: bad -name pattern '{pattern}': {e}\n"),
                        exit_code: 1,
                        ..CommandOutput::default()
                    },
                }
            }
            Some(other) => CommandOutput {
                stderr: format!("sh: {other}: command not found\n"),
                exit_code: 127,
                ..CommandOutput::default()
            },
        };
        out.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(out)
    }

    async fn read_file(&self, handle: &SessionHandle, path: &str) -> BackendResult<String> {
        self.enter(handle).await?;
        self.with_files(handle, |files| files.get(path).cloned())?
            .ok_or_else(|| BackendError::Operation(format!("no such file: {path}")))
    }

    async fn write_file(
        &self,
        handle: &SessionHandle,
        path: &str,
        content: &str,
    ) -> BackendResult<()> {
        self.enter(handle).await?;
        self.with_files(handle, |files| {
            files.insert(path.to_string(), content.to_string());
        })
    }

    async fn search_files(
        &self,
        handle: &SessionHandle,
        query: &str,
        root: &str,
    ) -> BackendResult<Vec<SearchMatch>> {
        self.enter(handle).await?;
        let re = Regex::new(query)
            .map_err(|e| BackendError::Operation(format!("invalid search pattern: {e}")))?;
        self.with_files(handle, |files| {
            files
                .iter()
                .filter(|(path, _)| is_under(path, root))
                .flat_map(|(path, content)| {
                    content
                        .lines()
                        .enumerate()
                        .filter(|(_, line)| re.is_match(line))
                        .map(|(i, line)| SearchMatch {
                            path: path.clone(),
                            line: i as u64 + 1,
                            text: line.to_string(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        })
    }

    async fn close(&self, handle: &SessionHandle) -> BackendResult<()> {
        let mut state = self.lock();
        state.closes += 1;
        state.sessions.remove(&handle.id);
        Ok(())
    }
}

fn exit(code: i32) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        ..CommandOutput::default()
    }
}

fn stdout(text: String) -> CommandOutput {
    CommandOutput {
        stdout: text,
        ..CommandOutput::default()
    }
}

fn cat(files: &BTreeMap<String, String>, paths: &[String]) -> CommandOutput {
    let mut out = CommandOutput::default();
    for path in paths {
        match files.get(path) {
            Some(content) => out.stdout.push_str(content),
            None => {
                out.stderr
                    .push_str(&format!("cat: {path}: No such file or directory\n"));
                out.exit_code = 1;
            }
        }
    }
    out
}

fn list_dir(files: &BTreeMap<String, String>, dir: &str) -> String {
    let mut names: Vec<&str> = files
        .keys()
        .filter_map(|path| {
            let rest = path.strip_prefix(dir)?.strip_prefix('/')?;
            rest.split('/').next()
        })
        .collect();
    names.dedup();
    names.iter().map(|n| format!("{n}\n")).collect()
}

fn find(files: &BTreeMap<String, String>, root: &str, pattern: &glob::Pattern) -> String {
    files
        .keys()
        .filter(|path| is_under(path, root))
        .filter(|path| pattern.matches(path.rsplit('/').next().unwrap_or(path)))
        .map(|path| format!("{path}\n"))
        .collect()
}

fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    root.is_empty()
        || path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn resolve(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}
