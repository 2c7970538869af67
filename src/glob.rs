//! `fnmatch`-style glob matching for [`ModelMap`](crate::store::config_store::ModelMap)
//! source patterns: `*` matches any run of characters, `?` matches exactly
//! one character, matching is case-insensitive and anchored to the whole
//! string (no partial/substring matches).

/// Match `text` against `pattern`, case-insensitively, anchored.
pub fn fnmatch(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    matches(&text, &pattern)
}

fn matches(text: &[char], pattern: &[char]) -> bool {
    // Standard glob DP: dp[i][j] = text[i..] matches pattern[j..]
    let (tl, pl) = (text.len(), pattern.len());
    let mut dp = vec![vec![false; pl + 1]; tl + 1];
    dp[tl][pl] = true;
    for j in (0..pl).rev() {
        if pattern[j] == '*' {
            dp[tl][j] = dp[tl][j + 1];
        }
    }
    for i in (0..tl).rev() {
        for j in (0..pl).rev() {
            dp[i][j] = match pattern[j] {
                '*' => dp[i + 1][j] || dp[i][j + 1],
                '?' => dp[i + 1][j + 1],
                c => c == text[i] && dp[i + 1][j + 1],
            };
        }
    }
    dp[0][0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(fnmatch("gpt-4", "gpt-4"));
        assert!(!fnmatch("gpt-4", "gpt-5"));
    }

    #[test]
    fn case_insensitive() {
        assert!(fnmatch("GPT-4", "gpt-4"));
    }

    #[test]
    fn star_matches_run() {
        assert!(fnmatch("gemini-2.5-flash", "gemini-2.5-*"));
        assert!(fnmatch("gemini-2.5-", "gemini-2.5-*"));
        assert!(!fnmatch("gemini-2.0-flash", "gemini-2.5-*"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(fnmatch("gpt-4a", "gpt-4?"));
        assert!(!fnmatch("gpt-4", "gpt-4?"));
        assert!(!fnmatch("gpt-4ab", "gpt-4?"));
    }

    #[test]
    fn anchored_not_substring() {
        assert!(!fnmatch("prefix-gpt-4-suffix", "gpt-4"));
    }

    #[test]
    fn multiple_wildcards() {
        assert!(fnmatch("claude-3-5-sonnet-20241022", "claude-*-sonnet-*"));
    }
}
