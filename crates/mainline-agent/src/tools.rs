use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

/// Output cap for any single tool result handed back to the model.
const MAX_TOOL_OUTPUT: usize = 16_000;
/// Hit cap for glob.
const MAX_GLOB_HITS: usize = 500;
/// Match cap for grep.
const MAX_GREP_MATCHES: usize = 200;
const DEFAULT_BASH_TIMEOUT_S: u64 = 60;
const MAX_BASH_TIMEOUT_S: u64 = 600;

/// The closed tool set quality agents may call, rooted in one worktree.
///
/// Paths are confined to the root: absolute paths and `..` components are
/// rejected before any filesystem access. The browser tool exists only when
/// the role declares it and an `app_url` is published.
pub struct ToolSandbox {
    root: PathBuf,
    app_url: Option<String>,
}

impl ToolSandbox {
    pub fn new(root: impl Into<PathBuf>, app_url: Option<String>) -> Self {
        Self { root: root.into(), app_url }
    }

    /// Execute one tool call. Tool failures are reported to the model as
    /// text, never as errors that abort the agent loop.
    pub async fn execute(&self, name: &str, args: &Value, cancel: &CancellationToken) -> String {
        let result = match name {
            "bash" => self.bash(args, cancel).await,
            "read" => self.read(args),
            "edit" => self.edit(args),
            "glob" => self.glob(args),
            "grep" => self.grep(args).await,
            "browser" => self.browser(args).await,
            other => Err(anyhow::anyhow!("unknown tool '{other}'")),
        };
        match result {
            Ok(output) => truncate(&output, MAX_TOOL_OUTPUT),
            Err(e) => format!("tool error: {e:#}"),
        }
    }

    // ── bash ──────────────────────────────────────────────────────────────

    async fn bash(&self, args: &Value, cancel: &CancellationToken) -> Result<String> {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            bail!("bash requires a command");
        };
        let timeout_s = args
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_BASH_TIMEOUT_S)
            .min(MAX_BASH_TIMEOUT_S);

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(timeout_s), child) => match result {
                Ok(output) => output?,
                Err(_elapsed) => bail!("command timed out after {timeout_s}s"),
            },
            _ = cancel.cancelled() => bail!("cancelled"),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let code = output.status.code().unwrap_or(1);
        if code != 0 {
            text.push_str(&format!("\n[exit code {code}]"));
        }
        Ok(text)
    }

    // ── read ──────────────────────────────────────────────────────────────

    fn read(&self, args: &Value) -> Result<String> {
        let path = self.resolve(args.get("path").and_then(Value::as_str))?;
        let contents = std::fs::read_to_string(&path)?;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(2_000) as usize;
        Ok(contents.lines().skip(offset).take(limit).collect::<Vec<_>>().join("\n"))
    }

    // ── edit ──────────────────────────────────────────────────────────────

    /// Exact-match single replacement; a miss leaves the file unchanged.
    fn edit(&self, args: &Value) -> Result<String> {
        let path = self.resolve(args.get("path").and_then(Value::as_str))?;
        let Some(old_text) = args.get("old_text").and_then(Value::as_str) else {
            bail!("edit requires old_text");
        };
        let Some(new_text) = args.get("new_text").and_then(Value::as_str) else {
            bail!("edit requires new_text");
        };
        let contents = std::fs::read_to_string(&path)?;
        if !contents.contains(old_text) {
            return Ok("old_text not found; file unchanged".into());
        }
        let updated = contents.replacen(old_text, new_text, 1);
        std::fs::write(&path, updated)?;
        Ok(format!("edited {}", path.display()))
    }

    // ── glob ──────────────────────────────────────────────────────────────

    fn glob(&self, args: &Value) -> Result<String> {
        let Some(pattern) = args.get("pattern").and_then(Value::as_str) else {
            bail!("glob requires a pattern");
        };
        let matcher = glob_regex(pattern)?;
        let mut hits = Vec::new();
        for dirent in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .filter_map(|e| e.ok())
        {
            if !dirent.file_type().is_file() {
                continue;
            }
            let Ok(rel) = dirent.path().strip_prefix(&self.root) else { continue };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if matcher.is_match(&rel) {
                hits.push(rel);
                if hits.len() >= MAX_GLOB_HITS {
                    hits.push(format!("... capped at {MAX_GLOB_HITS} hits"));
                    break;
                }
            }
        }
        if hits.is_empty() {
            return Ok("no matches".into());
        }
        Ok(hits.join("\n"))
    }

    // ── grep ──────────────────────────────────────────────────────────────

    /// Ripgrep when available, with a portable walk-and-match fallback.
    async fn grep(&self, args: &Value) -> Result<String> {
        let Some(pattern) = args.get("pattern").and_then(Value::as_str) else {
            bail!("grep requires a pattern");
        };
        let path = args.get("path").and_then(Value::as_str);
        let file_glob = args.get("file_glob").and_then(Value::as_str);

        let mut cmd = tokio::process::Command::new("rg");
        cmd.arg("--line-number")
            .arg("--no-heading")
            .arg("--max-count")
            .arg("50")
            .current_dir(&self.root)
            .kill_on_drop(true);
        if let Some(glob) = file_glob {
            cmd.arg("--glob").arg(glob);
        }
        cmd.arg("--").arg(pattern);
        if let Some(p) = path {
            cmd.arg(p);
        }

        match cmd.output().await {
            Ok(output) if output.status.code() == Some(0) || output.status.code() == Some(1) => {
                let text = String::from_utf8_lossy(&output.stdout).into_owned();
                if text.trim().is_empty() {
                    Ok("no matches".into())
                } else {
                    Ok(text)
                }
            }
            Ok(output) => {
                bail!("rg failed: {}", String::from_utf8_lossy(&output.stderr))
            }
            Err(_) => self.grep_fallback(pattern, path, file_glob),
        }
    }

    fn grep_fallback(
        &self,
        pattern: &str,
        path: Option<&str>,
        file_glob: Option<&str>,
    ) -> Result<String> {
        let re = regex::Regex::new(pattern)?;
        let glob_re = file_glob.map(glob_regex).transpose()?;
        let base = match path {
            Some(p) => self.resolve(Some(p))?,
            None => self.root.clone(),
        };
        let mut matches = Vec::new();
        'files: for dirent in WalkDir::new(&base)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .filter_map(|e| e.ok())
        {
            if !dirent.file_type().is_file() {
                continue;
            }
            let Ok(rel) = dirent.path().strip_prefix(&self.root) else { continue };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if let Some(g) = &glob_re {
                if !g.is_match(&rel) {
                    continue;
                }
            }
            // Binary and unreadable files are silently skipped.
            let Ok(contents) = std::fs::read_to_string(dirent.path()) else { continue };
            for (idx, line) in contents.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{rel}:{}:{line}", idx + 1));
                    if matches.len() >= MAX_GREP_MATCHES {
                        matches.push(format!("... capped at {MAX_GREP_MATCHES} matches"));
                        break 'files;
                    }
                }
            }
        }
        if matches.is_empty() {
            return Ok("no matches".into());
        }
        Ok(matches.join("\n"))
    }

    // ── browser ───────────────────────────────────────────────────────────

    async fn browser(&self, args: &Value) -> Result<String> {
        let Some(app_url) = &self.app_url else {
            bail!("browser tool is not enabled (no app_url published)");
        };
        let op = args.get("op").and_then(Value::as_str).unwrap_or("navigate");
        let url = match args.get("url").and_then(Value::as_str) {
            Some(u) if u.starts_with("http://") || u.starts_with("https://") => u.to_string(),
            Some(rel) => format!("{}/{}", app_url.trim_end_matches('/'), rel.trim_start_matches('/')),
            None => app_url.clone(),
        };
        let Some(chrome) = find_chrome() else {
            bail!("no headless chrome binary found");
        };

        match op {
            "navigate" | "query" => {
                let output = tokio::process::Command::new(&chrome)
                    .args(["--headless=new", "--disable-gpu", "--no-sandbox", "--dump-dom"])
                    .arg(&url)
                    .kill_on_drop(true)
                    .output()
                    .await?;
                if !output.status.success() {
                    bail!("chrome exited {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
                }
                let dom = String::from_utf8_lossy(&output.stdout).into_owned();
                if op == "navigate" {
                    return Ok(dom);
                }
                let Some(selector) = args.get("selector").and_then(Value::as_str) else {
                    bail!("query requires a selector");
                };
                Ok(query_dom(&dom, selector))
            }
            "screenshot" => {
                let shot = std::env::temp_dir().join(format!("mainline-shot-{}.png", std::process::id()));
                let output = tokio::process::Command::new(&chrome)
                    .args(["--headless=new", "--disable-gpu", "--no-sandbox", "--window-size=1280,720"])
                    .arg(format!("--screenshot={}", shot.display()))
                    .arg(&url)
                    .kill_on_drop(true)
                    .output()
                    .await?;
                if !output.status.success() {
                    bail!("chrome exited {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
                }
                Ok(format!("screenshot of {url} written to {}", shot.display()))
            }
            other => bail!("unknown browser op '{other}'"),
        }
    }

    // ── Path containment ──────────────────────────────────────────────────

    /// Join a relative path onto the sandbox root, rejecting traversal.
    fn resolve(&self, path: Option<&str>) -> Result<PathBuf> {
        let Some(path) = path else { bail!("missing path") };
        if path.is_empty() {
            bail!("empty path");
        }
        for comp in Path::new(path).components() {
            match comp {
                Component::ParentDir => bail!("path traversal not allowed: {path}"),
                Component::RootDir | Component::Prefix(_) => {
                    bail!("absolute path not allowed: {path}")
                }
                _ => {}
            }
        }
        Ok(self.root.join(path))
    }
}

// ── Tool schemas ─────────────────────────────────────────────────────────

/// OpenAI-style function schemas for the subset of tools a role declares.
/// `browser` is included only when the environment enables it.
pub fn schemas(tools: &[String], browser_enabled: bool) -> Vec<Value> {
    let mut out = Vec::new();
    for tool in tools {
        let schema = match tool.as_str() {
            "bash" => Some(function_schema(
                "bash",
                "Run a shell command in the worktree and return its output.",
                json!({
                    "command": {"type": "string", "description": "Shell command to run"},
                    "timeout": {"type": "integer", "description": "Timeout in seconds"},
                }),
                &["command"],
            )),
            "read" => Some(function_schema(
                "read",
                "Read a file from the worktree.",
                json!({
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "description": "First line to return (0-based)"},
                    "limit": {"type": "integer", "description": "Maximum lines to return"},
                }),
                &["path"],
            )),
            "edit" => Some(function_schema(
                "edit",
                "Replace an exact text match in a file. No-op when the text is not found.",
                json!({
                    "path": {"type": "string"},
                    "old_text": {"type": "string"},
                    "new_text": {"type": "string"},
                }),
                &["path", "old_text", "new_text"],
            )),
            "glob" => Some(function_schema(
                "glob",
                "List files matching a glob pattern, capped at 500 hits.",
                json!({"pattern": {"type": "string"}}),
                &["pattern"],
            )),
            "grep" => Some(function_schema(
                "grep",
                "Search file contents by regex.",
                json!({
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Directory or file to search"},
                    "file_glob": {"type": "string", "description": "Restrict to matching files"},
                }),
                &["pattern"],
            )),
            "browser" if browser_enabled => Some(function_schema(
                "browser",
                "Drive a headless browser against the running app: navigate, screenshot, or query the DOM.",
                json!({
                    "op": {"type": "string", "enum": ["navigate", "screenshot", "query"]},
                    "url": {"type": "string", "description": "Absolute URL or path relative to the app"},
                    "selector": {"type": "string", "description": "Substring or id to locate in the DOM (query op)"},
                }),
                &["op"],
            )),
            "browser" => None,
            other => {
                warn!("role declares unknown tool '{other}'");
                None
            }
        };
        if let Some(schema) = schema {
            out.push(schema);
        }
    }
    out
}

fn function_schema(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        },
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Translate a glob pattern into an anchored regex over '/'-separated
/// relative paths: `**` crosses separators, `*` and `?` do not.
fn glob_regex(pattern: &str) -> Result<regex::Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so `**/x` also matches `x`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Ok(regex::Regex::new(&re)?)
}

fn find_chrome() -> Option<String> {
    const NAMES: [&str; 4] =
        ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"];
    for dir in ["/usr/bin", "/usr/local/bin", "/snap/bin"] {
        for name in NAMES {
            let candidate = format!("{dir}/{name}");
            if Path::new(&candidate).exists() {
                return Some(candidate);
            }
        }
    }
    None
}

fn query_dom(dom: &str, selector: &str) -> String {
    let needle = selector.trim_start_matches(['#', '.']);
    let mut windows = Vec::new();
    let mut start = 0;
    while let Some(pos) = dom[start..].find(needle) {
        let at = start + pos;
        let lo = at.saturating_sub(120);
        let hi = (at + needle.len() + 280).min(dom.len());
        windows.push(snap_to_char_boundaries(dom, lo, hi));
        start = at + needle.len();
        if windows.len() >= 10 {
            break;
        }
    }
    if windows.is_empty() {
        return format!("selector '{selector}' not found in DOM");
    }
    windows.join("\n---\n")
}

fn snap_to_char_boundaries(s: &str, mut lo: usize, mut hi: usize) -> String {
    while lo > 0 && !s.is_char_boundary(lo) {
        lo -= 1;
    }
    while hi < s.len() && !s.is_char_boundary(hi) {
        hi += 1;
    }
    s[lo..hi].to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated]", &s[..cut])
}
