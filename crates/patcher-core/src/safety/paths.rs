//! Path risk tiers and blocked-path globs.
//!
//! Matching works on lowercase path segments and on the alphanumeric tokens
//! of each segment, never on raw substrings: `src/configuration.py` is not a
//! build config, but `Deploy/K8S-prod.YAML` is a Kubernetes manifest.

use regex::{Regex, RegexBuilder};

use crate::domain::{PatcherError, Result, RiskLevel};

/// Tier a single path was placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathClassification {
    pub level: RiskLevel,
    /// Rule identifier, absent for baseline paths.
    pub rule: Option<&'static str>,
}

impl PathClassification {
    fn new(level: RiskLevel, rule: &'static str) -> Self {
        Self {
            level,
            rule: Some(rule),
        }
    }

    fn baseline() -> Self {
        Self {
            level: RiskLevel::Minimal,
            rule: None,
        }
    }
}

/// Lowercase, `/`-separated, without a leading `./`.
pub fn normalize_path(path: &str) -> String {
    let lowered = path.trim().replace('\\', "/").to_lowercase();
    let mut rest = lowered.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.trim_start_matches('/').to_string()
}

struct PathParts<'a> {
    segments: Vec<&'a str>,
    file_name: &'a str,
    extension: &'a str,
    /// Alphanumeric tokens across every segment.
    tokens: Vec<&'a str>,
    /// Alphanumeric tokens of the file name only.
    name_tokens: Vec<&'a str>,
}

impl<'a> PathParts<'a> {
    fn new(normalized: &'a str) -> Self {
        let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        let file_name = segments.last().copied().unwrap_or("");
        let extension = match file_name.rfind('.') {
            Some(idx) if idx > 0 => &file_name[idx + 1..],
            _ => "",
        };
        let tokens = segments.iter().flat_map(|s| tokenize(s)).collect();
        let name_tokens = tokenize(file_name).collect();
        Self {
            segments,
            file_name,
            extension,
            tokens,
            name_tokens,
        }
    }

    fn has_segment(&self, segment: &str) -> bool {
        self.segments.iter().any(|s| *s == segment)
    }

    fn has_token(&self, candidates: &[&str]) -> bool {
        self.tokens.iter().any(|t| candidates.contains(t))
    }

    fn name_has_token(&self, candidates: &[&str]) -> bool {
        self.name_tokens.iter().any(|t| candidates.contains(t))
    }

    fn is_yaml(&self) -> bool {
        matches!(self.extension, "yml" | "yaml")
    }
}

fn tokenize(segment: &str) -> impl Iterator<Item = &str> {
    segment
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
}

const CI_FILES: &[&str] = &[
    ".gitlab-ci.yml",
    ".travis.yml",
    "jenkinsfile",
    "azure-pipelines.yml",
    "bitbucket-pipelines.yml",
];

const COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

const KEY_EXTENSIONS: &[&str] = &["pem", "key", "p12", "pfx", "jks", "keystore"];

const CREDENTIAL_FILES: &[&str] = &[
    "id_rsa",
    "id_ecdsa",
    "id_ed25519",
    ".netrc",
    ".pypirc",
    ".npmrc",
];

const DEPENDENCY_MANIFESTS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "pipfile",
    "pipfile.lock",
    "poetry.lock",
    "go.mod",
    "go.sum",
    "cargo.toml",
    "cargo.lock",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "settings.gradle",
    "gemfile",
    "gemfile.lock",
];

const BUILD_FILES: &[&str] = &["makefile", "cmakelists.txt", "build.rs", "tsconfig.json"];

const CONFIG_EXTENSIONS: &[&str] = &[
    "yml", "yaml", "json", "toml", "ini", "cfg", "js", "cjs", "mjs", "ts",
];

const SCRIPT_EXTENSIONS: &[&str] = &["sh", "bash", "zsh", "ps1", "bat", "cmd"];

/// Place a repository-relative path into a risk tier.
pub fn classify_path(path: &str) -> PathClassification {
    let normalized = normalize_path(path);
    let p = PathParts::new(&normalized);

    // Critical tier.
    let workflows = p
        .segments
        .windows(2)
        .any(|w| w[0] == ".github" && w[1] == "workflows");
    if workflows
        || CI_FILES.contains(&p.file_name)
        || p.has_segment(".circleci")
        || p.has_segment(".buildkite")
    {
        return PathClassification::new(RiskLevel::Critical, "ci_workflow");
    }
    if p.has_segment(".git") {
        return PathClassification::new(RiskLevel::Critical, "git_internals");
    }
    if p.file_name == "dockerfile"
        || p.file_name.starts_with("dockerfile.")
        || p.extension == "dockerfile"
        || COMPOSE_FILES.contains(&p.file_name)
        || (p.file_name.starts_with("docker-compose.") && p.is_yaml())
    {
        return PathClassification::new(RiskLevel::Critical, "container_build");
    }
    if p.file_name == ".env" || p.file_name.starts_with(".env.") || p.extension == "env" {
        return PathClassification::new(RiskLevel::Critical, "env_file");
    }
    if KEY_EXTENSIONS.contains(&p.extension)
        || CREDENTIAL_FILES.contains(&p.file_name)
        || p.name_has_token(&["secret", "secrets", "credentials"])
    {
        return PathClassification::new(RiskLevel::Critical, "secret_material");
    }
    if p.is_yaml() && p.has_token(&["k8s", "kubernetes", "kube", "helm", "kustomization"]) {
        return PathClassification::new(RiskLevel::Critical, "kubernetes_manifest");
    }

    // Sensitive tier.
    if DEPENDENCY_MANIFESTS.contains(&p.file_name)
        || (p.file_name.starts_with("requirements") && p.extension == "txt")
    {
        return PathClassification::new(RiskLevel::High, "dependency_manifest");
    }
    if BUILD_FILES.contains(&p.file_name)
        || (p.name_has_token(&["config"]) && CONFIG_EXTENSIONS.contains(&p.extension))
    {
        return PathClassification::new(RiskLevel::High, "build_config");
    }
    if matches!(p.extension, "tf" | "tfvars")
        || (p.is_yaml() && p.has_token(&["ansible", "playbook", "terraform"]))
    {
        return PathClassification::new(RiskLevel::High, "infrastructure");
    }

    // Baseline tiers.
    if SCRIPT_EXTENSIONS.contains(&p.extension) {
        return PathClassification::new(RiskLevel::Medium, "script");
    }
    if p.has_token(&["test", "tests", "spec", "specs"]) {
        return PathClassification::new(RiskLevel::Low, "test_file");
    }
    PathClassification::baseline()
}

/// Compiled blocked-path globs.
#[derive(Debug, Clone, Default)]
pub struct BlockedPaths {
    patterns: Vec<(String, Regex)>,
}

impl BlockedPaths {
    pub fn new(globs: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(globs.len());
        for glob in globs {
            let regex = RegexBuilder::new(&glob_to_regex(glob))
                .case_insensitive(true)
                .build()
                .map_err(|e| PatcherError::Config(format!("invalid blocked path {glob:?}: {e}")))?;
            patterns.push((glob.clone(), regex));
        }
        Ok(Self { patterns })
    }

    /// First glob matching `path`.
    pub fn matching(&self, path: &str) -> Option<&str> {
        let normalized = normalize_path(path);
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(&normalized))
            .map(|(glob, _)| glob.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Translate a glob to an anchored regex. Globs without a leading `/` match
/// at any segment boundary.
fn glob_to_regex(glob: &str) -> String {
    let rooted = glob.trim().starts_with('/');
    let glob = normalize_path(glob);
    let chars: Vec<char> = glob.chars().collect();
    let mut body = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    body.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    body.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => body.push_str("[^/]*"),
            '?' => body.push_str("[^/]"),
            c => body.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    if rooted {
        format!("^{body}$")
    } else {
        format!("^(?:.*/)?{body}$")
    }
}
