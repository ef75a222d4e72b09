use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const NETWORK_PREFIXES: [&str; 2] = ["http://", "https://"];
const PACKAGE_RUNNERS: [(&str, &str); 2] = [("npx:", "npx"), ("uvx:", "uvx")];
const SCOPED_PACKAGE_MARKER: char = '@';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    LocalProcess,
    PackageLaunched,
    Networked,
}

impl EndpointKind {
    /// Kind implied by the shape of the path alone.
    pub fn infer(path: &str) -> Self {
        let trimmed = path.trim();
        if NETWORK_PREFIXES
            .iter()
            .any(|prefix| starts_with_ignore_case(trimmed, prefix))
        {
            EndpointKind::Networked
        } else if trimmed.starts_with(SCOPED_PACKAGE_MARKER)
            || PACKAGE_RUNNERS
                .iter()
                .any(|(prefix, _)| trimmed.starts_with(prefix))
        {
            EndpointKind::PackageLaunched
        } else {
            EndpointKind::LocalProcess
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::LocalProcess => "local-process",
            EndpointKind::PackageLaunched => "package-launched",
            EndpointKind::Networked => "networked",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointParseError {
    #[error("endpoint specification is empty")]
    Empty,
    #[error("endpoint specification '{spec}' has no path")]
    MissingPath { spec: String },
    #[error("environment entry '{entry}' is not of the form KEY=value")]
    InvalidEnvEntry { entry: String },
    #[error("unbalanced brackets in '{segment}'")]
    UnbalancedBrackets { segment: String },
}

/// Caller-supplied description of one provider endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EndpointKind>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl EndpointSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: EndpointKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Parses `path[:arg1,arg2,...][^ENV1=val1,ENV2=val2,...]`.
    pub fn parse(spec: &str) -> Result<Self, EndpointParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(EndpointParseError::Empty);
        }

        let (head, env_part) = match spec.split_once('^') {
            Some((head, env)) => (head, Some(env)),
            None => (spec, None),
        };

        let (path, args_part) = split_path_and_args(head);
        let path = path.trim();
        if path.is_empty() {
            return Err(EndpointParseError::MissingPath {
                spec: head.to_string(),
            });
        }

        let args = args_part
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|arg| !arg.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut env = HashMap::new();
        if let Some(raw) = env_part {
            for entry in split_top_level(raw)? {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    EndpointParseError::InvalidEnvEntry {
                        entry: entry.to_string(),
                    }
                })?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(EndpointParseError::InvalidEnvEntry {
                        entry: entry.to_string(),
                    });
                }
                env.insert(key.to_string(), value.trim().to_string());
            }
        }

        Ok(Self {
            path: path.to_string(),
            kind: None,
            args,
            env,
        })
    }

    /// Effective kind. Networked and package shapes always beat an explicit
    /// override; the override only applies to paths shaped like local files.
    pub fn effective_kind(&self) -> EndpointKind {
        match EndpointKind::infer(&self.path) {
            EndpointKind::LocalProcess => self.kind.unwrap_or(EndpointKind::LocalProcess),
            shaped => shaped,
        }
    }

    pub fn resolve(&self, project_root: &Path) -> ResolvedEndpoint {
        let kind = self.effective_kind();
        let path = self.path.trim();
        let launch = match kind {
            EndpointKind::Networked => Launch::Url(path.to_string()),
            EndpointKind::PackageLaunched => {
                let (runner, package) = PACKAGE_RUNNERS
                    .iter()
                    .find_map(|(prefix, runner)| {
                        path.strip_prefix(prefix).map(|rest| (*runner, rest.trim()))
                    })
                    .unwrap_or(("npx", path));
                let mut args = Vec::with_capacity(self.args.len() + 2);
                if runner == "npx" {
                    args.push("-y".to_string());
                }
                args.push(package.to_string());
                args.extend(self.args.iter().cloned());
                Launch::Process {
                    program: PathBuf::from(runner),
                    args,
                    workdir: Some(project_root.to_path_buf()),
                }
            }
            EndpointKind::LocalProcess => {
                let expanded = expand(path);
                let candidate = PathBuf::from(&expanded);
                let script = if candidate.is_absolute() {
                    candidate
                } else {
                    project_root.join(candidate)
                };
                let workdir = script.parent().map(Path::to_path_buf);
                let (program, mut args) = match interpreter_for(&script) {
                    Some(interpreter) => (
                        PathBuf::from(interpreter),
                        vec![script.to_string_lossy().into_owned()],
                    ),
                    None => (script, Vec::new()),
                };
                args.extend(self.args.iter().cloned());
                Launch::Process {
                    program,
                    args,
                    workdir,
                }
            }
        };

        ResolvedEndpoint {
            label: self.label(),
            kind,
            launch,
            env: self
                .env
                .iter()
                .map(|(key, value)| (key.clone(), expand(value)))
                .collect(),
        }
    }
}

impl EndpointSpec {
    /// Display form for logs and catalogs, with env values masked.
    pub fn label(&self) -> String {
        let mut label = self.path.trim().to_string();
        if !self.args.is_empty() {
            label.push(':');
            label.push_str(&self.args.join(","));
        }
        if !self.env.is_empty() {
            let mut keys: Vec<&str> = self.env.keys().map(String::as_str).collect();
            keys.sort_unstable();
            let masked: Vec<String> = keys.iter().map(|key| format!("{key}=***")).collect();
            label.push('^');
            label.push_str(&masked.join(","));
        }
        label
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if !self.args.is_empty() {
            write!(f, ":{}", self.args.join(","))?;
        }
        if !self.env.is_empty() {
            let mut keys: Vec<&String> = self.env.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{key}={}", self.env[key]))
                .collect();
            write!(f, "^{}", entries.join(","))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for EndpointSpec {
    type Err = EndpointParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// How a connector reaches a provider once an endpoint is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    Process {
        program: PathBuf,
        args: Vec<String>,
        workdir: Option<PathBuf>,
    },
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub label: String,
    pub kind: EndpointKind,
    pub launch: Launch,
    pub env: HashMap<String, String>,
}

fn split_path_and_args(head: &str) -> (&str, Option<&str>) {
    if EndpointKind::infer(head) == EndpointKind::Networked {
        return (head, None);
    }

    let protected = PACKAGE_RUNNERS
        .iter()
        .find(|(prefix, _)| head.starts_with(prefix))
        .map(|(prefix, _)| prefix.len())
        .or_else(|| has_drive_letter(head).then_some(2))
        .unwrap_or(0);

    match head[protected..].find(':') {
        Some(offset) => {
            let split = protected + offset;
            (&head[..split], Some(&head[split + 1..]))
        }
        None => (head, None),
    }
}

/// Splits on commas that are not nested inside `()`, `[]` or `{}`.
fn split_top_level(raw: &str) -> Result<Vec<String>, EndpointParseError> {
    let unbalanced = || EndpointParseError::UnbalancedBrackets {
        segment: raw.to_string(),
    };
    let mut parts = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '(' | '[' | '{' => {
                stack.push(ch);
                current.push(ch);
            }
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(unbalanced());
                }
                current.push(ch);
            }
            ',' if stack.is_empty() => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }

    if !stack.is_empty() {
        return Err(unbalanced());
    }
    parts.push(current);
    Ok(parts)
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn interpreter_for(script: &Path) -> Option<&'static str> {
    match script.extension().and_then(|ext| ext.to_str()) {
        Some("py") => Some("python3"),
        Some("js") | Some("mjs") | Some("cjs") => Some("node"),
        _ => None,
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
