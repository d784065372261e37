//! Model of the workflow analyzer's JSON output and the ingest helpers
//! that turn raw findings into stored rows.

use std::path::{Component, Path};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::domain::Severity;

/// One entry of the analyzer's JSON array. The payload is duck-typed;
/// every field tolerates absence so an unknown analyzer version never
/// fails ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub line: Option<i32>,
    #[serde(default)]
    pub column: Option<i32>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub end_column: Option<i32>,
}

impl RawFinding {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("unknown")
    }

    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .unwrap_or("Security vulnerability detected")
    }
}

/// Parse analyzer stdout as a findings array. Anything unparseable is
/// treated as an empty result; the analyzer exits non-zero even on
/// successful runs with findings.
pub fn parse_analyzer_output(stdout: &str) -> Vec<RawFinding> {
    if stdout.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<RawFinding>>(stdout) {
        Ok(findings) => findings,
        Err(e) => {
            warn!("Failed to parse analyzer JSON output: {}", e);
            Vec::new()
        }
    }
}

/// Map an analyzer rule kind to a severity. Unknown kinds land on
/// `medium` rather than failing ingest.
pub fn map_severity(kind: &str) -> Severity {
    match kind {
        "expression-injection" => Severity::Critical,
        "credentials" => Severity::Critical,
        "dangerous-checkout" => Severity::High,
        "dangerous-action" => Severity::High,
        "dangerous-write" => Severity::High,
        "repo-jacking" => Severity::High,
        "unsecure-commands" => Severity::High,
        "known-vulnerability" => Severity::High,
        "dangerous-artefact" => Severity::Medium,
        "runner-label" => Severity::Medium,
        "bot-check" => Severity::Medium,
        "local-action" => Severity::Low,
        "shellcheck" => Severity::Low,
        "oidc-action" => Severity::Info,
        _ => Severity::Medium,
    }
}

/// Fixed remediation text per rule kind.
pub fn recommendation_for(kind: &str) -> &'static str {
    match kind {
        "expression-injection" => {
            "Sanitize untrusted input before use in expressions. Use intermediate environment variables."
        }
        "dangerous-checkout" => {
            "Avoid checking out untrusted code in privileged contexts like workflow_run or pull_request_target."
        }
        "dangerous-action" => {
            "Treat artifact data as untrusted. Validate and sanitize before use."
        }
        "dangerous-write" => {
            "Sanitize inputs before writing to GITHUB_ENV or GITHUB_OUTPUT to prevent command injection."
        }
        "repo-jacking" => {
            "Verify that referenced GitHub actions point to valid organizations/users."
        }
        "unsecure-commands" => {
            "Remove ACTIONS_ALLOW_UNSECURE_COMMANDS environment variable."
        }
        "known-vulnerability" => "Update the action to a patched version.",
        "dangerous-artefact" => {
            "Avoid uploading sensitive files like .git/config in artifacts."
        }
        "credentials" => "Avoid hardcoding credentials. Use GitHub secrets instead.",
        "runner-label" => {
            "Use ephemeral self-hosted runners or GitHub-hosted runners for untrusted code."
        }
        "bot-check" => {
            "Use more robust checks than github.actor for bot identity verification."
        }
        "local-action" => "Review local action for potential vulnerabilities.",
        "oidc-action" => "Review OIDC action for proper security configuration.",
        "shellcheck" => "Fix shell script issues identified by shellcheck.",
        _ => "Review and fix the identified security issue.",
    }
}

/// Reduce an analyzer output path to the repository-relative form starting
/// at `.github`. Paths without a `.github` component pass through
/// unchanged.
///
/// `out/owner/repo/main/.github/workflows/ci.yml` → `.github/workflows/ci.yml`
pub fn clean_file_path(file_path: &str) -> String {
    let components: Vec<&str> = Path::new(file_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    for (i, part) in components.iter().enumerate() {
        if *part == ".github" {
            return components[i..].join("/");
        }
    }

    file_path.to_string()
}

/// Extract the branch name from an analyzer output path of the shape
/// `out/owner/repo/branch/.github/workflows/file.yml`: the component just
/// before `.github`. Falls back to `main`.
pub fn extract_branch(file_path: &str) -> String {
    let components: Vec<&str> = Path::new(file_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();

    for (i, part) in components.iter().enumerate() {
        if *part == ".github" && i > 0 {
            return components[i - 1].to_string();
        }
    }

    "main".to_string()
}

/// SHA-256 of the file contents, read in 4 KiB blocks. A file that cannot
/// be read hashes to the empty string so ingest can still proceed.
pub async fn hash_file(path: &Path) -> String {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Error hashing file {}: {}", path.display(), e);
            return String::new();
        }
    };

    let mut hasher = Sha256::new();
    let mut block = [0u8; 4096];
    loop {
        match file.read(&mut block).await {
            Ok(0) => break,
            Ok(n) => hasher.update(&block[..n]),
            Err(e) => {
                warn!("Error hashing file {}: {}", path.display(), e);
                return String::new();
            }
        }
    }

    hex::encode(hasher.finalize())
}

/// Title derivation: the analyzer message truncated to the title column
/// width, on a character boundary.
pub fn derive_title(message: &str) -> String {
    message.chars().take(512).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn severity_map_matches_rule_kinds() {
        assert_eq!(map_severity("expression-injection"), Severity::Critical);
        assert_eq!(map_severity("credentials"), Severity::Critical);
        assert_eq!(map_severity("dangerous-checkout"), Severity::High);
        assert_eq!(map_severity("repo-jacking"), Severity::High);
        assert_eq!(map_severity("runner-label"), Severity::Medium);
        assert_eq!(map_severity("bot-check"), Severity::Medium);
        assert_eq!(map_severity("local-action"), Severity::Low);
        assert_eq!(map_severity("shellcheck"), Severity::Low);
        assert_eq!(map_severity("oidc-action"), Severity::Info);
        assert_eq!(map_severity("unknown-thing"), Severity::Medium);
    }

    #[test]
    fn unknown_kind_gets_the_generic_recommendation() {
        assert_eq!(
            recommendation_for("never-heard-of-it"),
            "Review and fix the identified security issue."
        );
        assert_eq!(
            recommendation_for("known-vulnerability"),
            "Update the action to a patched version."
        );
    }

    #[test]
    fn file_path_is_reduced_to_the_workflow_root() {
        assert_eq!(
            clean_file_path("out/own/repo/main/.github/workflows/ci.yml"),
            ".github/workflows/ci.yml"
        );
        assert_eq!(
            clean_file_path("src/main.rs"),
            "src/main.rs"
        );
    }

    #[test]
    fn branch_is_the_component_before_the_workflow_root() {
        assert_eq!(
            extract_branch("out/own/repo/release-1/.github/workflows/x.yml"),
            "release-1"
        );
        assert_eq!(extract_branch("no/workflow/dir/here.yml"), "main");
        // A path that starts at .github has no branch component to take.
        assert_eq!(extract_branch(".github/workflows/ci.yml"), "main");
    }

    #[test]
    fn analyzer_output_parses_and_tolerates_garbage() {
        let raw = r#"[{"message":"Expression injection","filepath":"out/o/r/main/.github/workflows/ci.yml","line":14,"kind":"expression-injection","snippet":"  ref: ${{ github.head_ref }}","end_column":34,"extra_field":true}]"#;
        let findings = parse_analyzer_output(raw);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind(), "expression-injection");
        assert_eq!(findings[0].line, Some(14));

        assert!(parse_analyzer_output("not json").is_empty());
        assert!(parse_analyzer_output("").is_empty());
        assert!(parse_analyzer_output("{\"an\":\"object\"}").is_empty());
    }

    #[test]
    fn title_is_bounded() {
        let long = "x".repeat(600);
        assert_eq!(derive_title(&long).len(), 512);
        assert_eq!(derive_title("short"), "short");
    }

    #[tokio::test]
    async fn hashing_reads_the_file_and_survives_absence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let digest = hash_file(file.path()).await;
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let missing = hash_file(Path::new("/nonexistent/definitely/not/here")).await;
        assert!(missing.is_empty());
    }
}
