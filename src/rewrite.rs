//! C5 — the rewriter: auth header injection, hop-by-hop stripping, and
//! per-provider model-name substitution (body for CLI A/B, URL path for
//! CLI C).

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use std::sync::OnceLock;

use crate::cli::CliVariant;
use crate::glob::fnmatch;
use crate::store::config_store::ModelMap;

/// Header names stripped from both the forwarded request and the returned
/// response (case-insensitive), including `content-length` — the body is
/// rebuilt on both sides (rewritten request, re-streamed response), so any
/// length the peer sent is already stale; reqwest/hyper recompute it.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// Result of a model-mapping attempt.
pub struct ModelRewrite {
    /// `None` if no enabled rule matched — original model is used unchanged.
    pub original_model: Option<String>,
    /// The model actually sent upstream (post-substitution, or the original).
    pub final_model: Option<String>,
}

/// Strip hop-by-hop headers and the inbound `authorization`, then inject the
/// provider's credential under the scheme appropriate for `cli_type`
/// (SPEC_FULL §4.3).
pub fn build_forward_headers(inbound: &HeaderMap, cli_type: CliVariant, api_key: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "authorization" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    match cli_type {
        CliVariant::A | CliVariant::B => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                out.insert(HeaderName::from_static("authorization"), value);
            }
        }
        CliVariant::C => {
            if let Ok(value) = HeaderValue::from_str(api_key) {
                out.insert(HeaderName::from_static("x-goog-api-key"), value);
            }
        }
    }

    out
}

/// Strip hop-by-hop headers (plus `content-encoding`, since the HTTP client
/// already decompressed the body) from an upstream response before handing
/// it back to the CLI, and add the `X-CCG-Provider` observability header.
pub fn filter_response_headers(upstream: &HeaderMap, provider_name: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "content-encoding" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(provider_name)) {
        out.insert(HeaderName::from_static("x-ccg-provider"), value);
    }
    out
}

/// Apply the first matching enabled `ModelMap` (declaration order) to the
/// `"model"` field of a JSON request body (CLI A/B). Returns the
/// (possibly unchanged) body bytes plus the rewrite bookkeeping.
pub fn rewrite_model_in_body(body: &[u8], maps: &[ModelMap]) -> (Vec<u8>, ModelRewrite) {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (body.to_vec(), ModelRewrite { original_model: None, final_model: None });
    };
    let Some(model) = value.get("model").and_then(|m| m.as_str()).map(str::to_string) else {
        return (body.to_vec(), ModelRewrite { original_model: None, final_model: None });
    };

    for map in maps {
        if fnmatch(&model, &map.source_model) {
            value["model"] = serde_json::Value::String(map.target_model.clone());
            let rewritten = serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec());
            return (
                rewritten,
                ModelRewrite {
                    original_model: Some(model),
                    final_model: Some(map.target_model.clone()),
                },
            );
        }
    }

    (
        body.to_vec(),
        ModelRewrite {
            original_model: None,
            final_model: Some(model),
        },
    )
}

fn gemini_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*v1beta/models/)([^:/]+)(:.+)$").unwrap())
}

/// Apply the first matching enabled `ModelMap` to the `<model>` segment of a
/// Gemini-style URL path `.../v1beta/models/<model>:<action>` (CLI C).
pub fn rewrite_model_in_path(path: &str, maps: &[ModelMap]) -> (String, ModelRewrite) {
    let Some(captures) = gemini_path_regex().captures(path) else {
        return (
            path.to_string(),
            ModelRewrite { original_model: None, final_model: None },
        );
    };
    let prefix = &captures[1];
    let model = &captures[2];
    let suffix = &captures[3];

    for map in maps {
        if fnmatch(model, &map.source_model) {
            let rewritten = format!("{prefix}{}{suffix}", map.target_model);
            return (
                rewritten,
                ModelRewrite {
                    original_model: Some(model.to_string()),
                    final_model: Some(map.target_model.clone()),
                },
            );
        }
    }

    (
        path.to_string(),
        ModelRewrite {
            original_model: None,
            final_model: Some(model.to_string()),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn model_map(id: i64, source: &str, target: &str) -> ModelMap {
        ModelMap {
            id,
            provider_id: 1,
            source_model: source.to_string(),
            target_model: target.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn forward_headers_strip_hop_by_hop_and_inject_bearer() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("example.com"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer old-token"));
        inbound.insert("x-custom", HeaderValue::from_static("keep-me"));

        let out = build_forward_headers(&inbound, CliVariant::A, "K");
        assert!(!out.contains_key("host"));
        assert!(!out.contains_key("connection"));
        assert_eq!(out.get("authorization").unwrap(), "Bearer K");
        assert_eq!(out.get("x-custom").unwrap(), "keep-me");
    }

    #[test]
    fn forward_headers_use_goog_api_key_for_cli_c() {
        let inbound = HeaderMap::new();
        let out = build_forward_headers(&inbound, CliVariant::C, "K");
        assert!(!out.contains_key("authorization"));
        assert_eq!(out.get("x-goog-api-key").unwrap(), "K");
    }

    #[test]
    fn response_headers_strip_content_encoding_and_add_provider_header() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-encoding", HeaderValue::from_static("gzip"));
        upstream.insert("content-type", HeaderValue::from_static("application/json"));

        let out = filter_response_headers(&upstream, "My Provider");
        assert!(!out.contains_key("content-encoding"));
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-ccg-provider").unwrap(), "My%20Provider");
    }

    #[test]
    fn body_model_rewrite_first_match_wins() {
        let maps = vec![
            model_map(1, "claude-3-*", "claude-3-opus"),
            model_map(2, "claude-*", "claude-fallback"),
        ];
        let body = br#"{"model":"claude-3-sonnet","stream":false}"#;
        let (rewritten, info) = rewrite_model_in_body(body, &maps);
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "claude-3-opus");
        assert_eq!(info.original_model.as_deref(), Some("claude-3-sonnet"));
        assert_eq!(info.final_model.as_deref(), Some("claude-3-opus"));
    }

    #[test]
    fn body_model_rewrite_passthrough_when_no_match() {
        let maps = vec![model_map(1, "gpt-*", "gpt-4")];
        let body = br#"{"model":"claude-3","stream":false}"#;
        let (rewritten, info) = rewrite_model_in_body(body, &maps);
        assert_eq!(rewritten, body);
        assert_eq!(info.original_model, None);
        assert_eq!(info.final_model.as_deref(), Some("claude-3"));
    }

    #[test]
    fn body_model_rewrite_passthrough_on_non_json() {
        let maps = vec![model_map(1, "*", "x")];
        let body = b"not json";
        let (rewritten, info) = rewrite_model_in_body(body, &maps);
        assert_eq!(rewritten, body);
        assert_eq!(info.final_model, None);
    }

    #[test]
    fn path_model_rewrite_matches_gemini_pattern() {
        let maps = vec![model_map(1, "gemini-2.5-*", "gemini-2.5-pro")];
        let (rewritten, info) =
            rewrite_model_in_path("v1beta/models/gemini-2.5-flash:streamGenerateContent", &maps);
        assert_eq!(rewritten, "v1beta/models/gemini-2.5-pro:streamGenerateContent");
        assert_eq!(info.final_model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn path_model_rewrite_passthrough_on_non_matching_path() {
        let maps = vec![model_map(1, "*", "x")];
        let (rewritten, info) = rewrite_model_in_path("v1/chat/completions", &maps);
        assert_eq!(rewritten, "v1/chat/completions");
        assert_eq!(info.final_model, None);
    }
}
