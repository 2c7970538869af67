//! The three supported CLI variants and how an inbound request is attributed to one.

use std::fmt;

/// Which coding-assistant CLI issued a request.
///
/// Attribution is a pure function of the inbound `User-Agent` header (see
/// [`CliVariant::detect`]); there is no authentication involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CliVariant {
    /// Claude-style CLI. Anthropic-compatible wire format.
    A,
    /// Codex-style CLI. OpenAI-responses-compatible wire format.
    B,
    /// Gemini-style CLI. Google-compatible wire format, model in the URL path.
    C,
}

impl CliVariant {
    /// Detect the CLI variant from a `User-Agent` header value.
    ///
    /// Case-insensitive substring match: `"codex"` → B, `"claude"` → A,
    /// `"gemini"` → C. An unrecognized or missing header defaults to A —
    /// this default must be preserved, existing CLI A clients rely on it.
    pub fn detect(user_agent: Option<&str>) -> Self {
        let ua = user_agent.unwrap_or_default().to_lowercase();
        if ua.contains("codex") {
            CliVariant::B
        } else if ua.contains("claude") {
            CliVariant::A
        } else if ua.contains("gemini") {
            CliVariant::C
        } else {
            CliVariant::A
        }
    }

    /// Stable short code used as the `cli_type` column value.
    pub fn as_str(self) -> &'static str {
        match self {
            CliVariant::A => "claude_code",
            CliVariant::B => "codex",
            CliVariant::C => "gemini",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "claude_code" => Some(CliVariant::A),
            "codex" => Some(CliVariant::B),
            "gemini" => Some(CliVariant::C),
            _ => None,
        }
    }
}

impl fmt::Display for CliVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_codex_case_insensitively() {
        assert_eq!(CliVariant::detect(Some("Codex-CLI/0.9")), CliVariant::B);
    }

    #[test]
    fn detects_claude() {
        assert_eq!(CliVariant::detect(Some("claude-cli/1.0")), CliVariant::A);
    }

    #[test]
    fn detects_gemini() {
        assert_eq!(CliVariant::detect(Some("gemini-cli/2.0")), CliVariant::C);
    }

    #[test]
    fn unknown_user_agent_defaults_to_a() {
        assert_eq!(CliVariant::detect(Some("curl/8.0")), CliVariant::A);
        assert_eq!(CliVariant::detect(None), CliVariant::A);
    }
}
