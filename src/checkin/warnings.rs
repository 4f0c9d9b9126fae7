//! Content warning pipeline (§4.4.3.1): an interactive abort/continue/convert prompt replaced
//! by a caller-supplied `WarningPolicy` trait, following the same trait-at-the-seam idiom as
//! `ObjectTrait`. Binary/BOM detection uses `encoding_rs` BOM sniffing plus a NUL-byte scan
//! (`memchr`).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentWarning {
    Binary,
    MixedLineEndings,
    NonUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningDecision {
    Abort,
    Continue,
    Convert,
}

pub trait WarningPolicy: Send + Sync {
    fn decide(&self, warning: ContentWarning) -> WarningDecision;
}

/// The default policy for non-TTY embeddings and tests: continues through every warning
/// except binary content outside a configured binary glob when "no warnings" was not passed,
/// which aborts — a warn-then-prompt idiom re-expressed as a returned decision instead of a
/// blocking stdin read (§9).
pub struct NonInteractivePolicy {
    pub no_warnings: bool,
    pub path_matches_binary_glob: bool,
}

impl NonInteractivePolicy {
    /// Build for a specific file path, evaluating `binary_glob` (§4.4.3) against it.
    pub fn for_path(cfg: &crate::config::CheckinConfig, binary_glob: &[String], path: &str) -> Self {
        NonInteractivePolicy {
            no_warnings: cfg.allow_warnings,
            path_matches_binary_glob: path_matches_any(binary_glob, path),
        }
    }
}

/// Fossil glob syntax reduced to `*` (any run of characters) and `?` (any single character);
/// matched case-sensitively against the whole path.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let mut dp = vec![vec![false; t.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=p.len() {
        for j in 1..=t.len() {
            dp[i][j] = match p[i - 1] {
                '*' => dp[i - 1][j] || dp[i][j - 1],
                '?' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == t[j - 1],
            };
        }
    }
    dp[p.len()][t.len()]
}

pub fn path_matches_any(globs: &[String], path: &str) -> bool {
    globs.iter().any(|g| glob_match(g, path))
}

impl WarningPolicy for NonInteractivePolicy {
    fn decide(&self, warning: ContentWarning) -> WarningDecision {
        if warning == ContentWarning::Binary
            && !self.no_warnings
            && !self.path_matches_binary_glob
        {
            return WarningDecision::Abort;
        }
        WarningDecision::Continue
    }
}

/// NUL-byte scan for non-BOM binary detection, plus a UTF-16 BOM sniff via `encoding_rs`.
pub fn looks_binary(bytes: &[u8]) -> bool {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(bytes) {
        if encoding != encoding_rs::UTF_8 && bom_len > 0 {
            return true;
        }
    }
    memchr::memchr(0, bytes).is_some()
}

/// Mixed or bare-CR line endings: any `\r` not immediately followed by `\n`, or any `\r\n`
/// pair when bare `\n` also appears elsewhere in the same buffer.
pub fn has_mixed_line_endings(bytes: &[u8]) -> bool {
    let mut saw_crlf = false;
    let mut saw_bare_lf = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' {
            if bytes.get(i + 1) == Some(&b'\n') {
                saw_crlf = true;
                i += 2;
                continue;
            }
            return true;
        }
        if bytes[i] == b'\n' {
            saw_bare_lf = true;
        }
        i += 1;
    }
    saw_crlf && saw_bare_lf
}

pub fn is_non_utf8(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_err()
}

/// Convert content to UTF-8 with LF endings for the `Convert` decision. Lossy: bytes that
/// cannot be interpreted as UTF-8 are replaced, matching a best-effort text conversion.
pub fn convert_to_utf8_lf(bytes: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(bytes);
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    normalized.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_byte_is_binary() {
        assert!(looks_binary(b"hello\0world"));
        assert!(!looks_binary(b"hello world"));
    }

    #[test]
    fn mixed_endings_detected() {
        assert!(has_mixed_line_endings(b"a\r\nb\nc"));
        assert!(!has_mixed_line_endings(b"a\r\nb\r\nc"));
        assert!(!has_mixed_line_endings(b"a\nb\nc"));
    }

    #[test]
    fn bare_cr_is_mixed() {
        assert!(has_mixed_line_endings(b"a\rb"));
    }

    #[test]
    fn non_interactive_policy_aborts_on_unexpected_binary() {
        let policy = NonInteractivePolicy {
            no_warnings: false,
            path_matches_binary_glob: false,
        };
        assert_eq!(
            policy.decide(ContentWarning::Binary),
            WarningDecision::Abort
        );
        assert_eq!(
            policy.decide(ContentWarning::MixedLineEndings),
            WarningDecision::Continue
        );
    }

    #[test]
    fn no_warnings_flag_suppresses_binary_abort() {
        let policy = NonInteractivePolicy {
            no_warnings: true,
            path_matches_binary_glob: false,
        };
        assert_eq!(
            policy.decide(ContentWarning::Binary),
            WarningDecision::Continue
        );
    }

    #[test]
    fn glob_match_supports_star_and_question_mark() {
        assert!(glob_match("*.png", "icons/logo.png"));
        assert!(!glob_match("*.png", "icons/logo.jpg"));
        assert!(glob_match("img?.png", "img1.png"));
        assert!(!glob_match("img?.png", "img10.png"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn for_path_suppresses_binary_abort_when_glob_matches() {
        let cfg = crate::config::CheckinConfig::default();
        let globs = vec!["*.bin".to_string()];
        let matched = NonInteractivePolicy::for_path(&cfg, &globs, "data/payload.bin");
        assert_eq!(
            matched.decide(ContentWarning::Binary),
            WarningDecision::Continue
        );
        let unmatched = NonInteractivePolicy::for_path(&cfg, &globs, "src/main.rs");
        assert_eq!(
            unmatched.decide(ContentWarning::Binary),
            WarningDecision::Abort
        );
    }
}
