//! Decides whether an rsync run actually succeeded.
//!
//! rsync can exit 0 after skipping files it could not read, so the exit code
//! alone is not trusted: diagnostic lines in the output are also matched
//! against a bank of known error signatures and any hit fails the job.
//!
//! With `-v` the output also carries the transferred file list, so only lines
//! shaped like an rsync or ssh diagnostic are matched. A file called
//! `opendir.c` or `broken pipe.txt` is not an error.

use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// rsync's own summary line, e.g. `rsync error: some files/attrs were not transferred`.
pub static GENERIC_ERROR_BANNER: &str = "rsync error:";

/// Line starts (lowercase) that mark a message from rsync or ssh rather than
/// a file list entry.
static DIAGNOSTIC_PREFIXES: &[&str] = &[
    "rsync:",
    "rsync error:",
    "rsync warning:",
    "ssh:",
    "[sender]",
    "[receiver]",
    "[generator]",
    "client_loop:",
    "packet_write_wait:",
    "read from remote host",
    "connection to ",
    "ssh_exchange_identification:",
    "kex_exchange_identification:",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorSignature {
    pub label: &'static str,
    /// Lowercase substrings, any of which identifies the signature.
    pub patterns: &'static [&'static str],
}

pub static ERROR_SIGNATURES: &[ErrorSignature] = &[
    ErrorSignature {
        label: "permission denied",
        patterns: &["permission denied"],
    },
    ErrorSignature {
        label: "i/o error",
        patterns: &["input/output error", "i/o error"],
    },
    ErrorSignature {
        label: "directory open failure",
        patterns: &["opendir \"", "opendir(", "failed to open directory"],
    },
    ErrorSignature {
        label: "attribute transfer failure",
        patterns: &[
            "set_acl:",
            "rsync_xal_set:",
            "lsetxattr(",
            "failed to set times",
            "failed to set permissions",
        ],
    },
    ErrorSignature {
        label: "connection reset",
        patterns: &["connection reset by peer"],
    },
    ErrorSignature {
        label: "broken pipe",
        patterns: &["broken pipe"],
    },
    ErrorSignature {
        label: "unexpected remote error",
        patterns: &["connection unexpectedly closed", "unexpected remote", "error in rsync protocol data stream"],
    },
    ErrorSignature {
        label: "rsync error",
        patterns: &[GENERIC_ERROR_BANNER],
    },
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureMatch {
    pub label: &'static str,
    pub line: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub exit_code: Option<i32>,
    /// Every signature hit, in output order.
    pub matches: Vec<SignatureMatch>,
    /// One representative line for reports, present whenever the verdict is `Failed`.
    pub detail: Option<String>,
}

impl Classification {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    /// Distinct signature labels, in first-seen order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.matches.iter().map(|m| m.label).unique().collect()
    }
}

impl Display for Classification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.verdict, &self.detail) {
            (Verdict::Success, _) => f.write_str("ok"),
            (Verdict::Failed, detail) => {
                let labels = self.labels();
                if !labels.is_empty() {
                    write!(f, "[{}] ", labels.join(", "))?;
                }
                f.write_str(detail.as_deref().unwrap_or("failed"))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OutcomeClassifier;

impl OutcomeClassifier {
    pub fn classify(&self, exit_code: Option<i32>, output: &str) -> Classification {
        let matches = output
            .lines()
            .map(str::trim)
            .filter_map(|line| {
                let lower = line.to_lowercase();
                is_diagnostic(&lower).then_some((line, lower))
            })
            .flat_map(|(line, lower)| {
                ERROR_SIGNATURES
                    .iter()
                    .filter(move |sig| sig.patterns.iter().any(|p| lower.contains(*p)))
                    .map(move |sig| SignatureMatch {
                        label: sig.label,
                        line: line.to_string(),
                    })
            })
            .collect_vec();

        let verdict = if exit_code == Some(0) && matches.is_empty() {
            Verdict::Success
        } else {
            Verdict::Failed
        };

        let detail = match verdict {
            Verdict::Success => None,
            Verdict::Failed => Some(Self::detail(exit_code, output, &matches)),
        };

        Classification {
            verdict,
            exit_code,
            matches,
            detail,
        }
    }

    fn detail(exit_code: Option<i32>, output: &str, matches: &[SignatureMatch]) -> String {
        let is_banner = |line: &str| line.to_lowercase().contains(GENERIC_ERROR_BANNER);

        if let Some(specific) = matches.iter().find(|m| !is_banner(&m.line)) {
            return specific.line.clone();
        }

        let candidates = || {
            output
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !is_banner(line))
        };
        candidates()
            .find(|line| is_diagnostic(&line.to_lowercase()))
            .or_else(|| candidates().next())
            .map(str::to_string)
            .unwrap_or_else(|| match exit_code {
                Some(code) => format!("No specific error message (exit code {code})"),
                None => "No specific error message (terminated by signal)".to_string(),
            })
    }
}

/// A message from rsync or ssh: a known prefix, or an errno-tagged failure
/// such as `... failed: No such file or directory (2)`.
fn is_diagnostic(lower: &str) -> bool {
    DIAGNOSTIC_PREFIXES.iter().any(|p| lower.starts_with(p)) || is_errno_failure(lower)
}

fn is_errno_failure(lower: &str) -> bool {
    let Some((head, tail)) = lower.rsplit_once(" (") else {
        return false;
    };
    let Some(code) = tail.strip_suffix(')') else {
        return false;
    };
    !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()) && head.contains("failed: ")
}
