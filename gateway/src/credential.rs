//! The OAuth credential record. Only `access_token` and `refresh_token` are
//! required; everything else is optional pass-through from the upstream
//! token endpoint, per the semi-opaque-JSON modeling this system uses for
//! anything that isn't a touchpoint the dispatcher actually reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_unix_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Credential {
    /// `expiryUnixMs` is treated as absent if zero.
    pub fn expiry(&self) -> Option<i64> {
        self.expiry_unix_ms.filter(|&ms| ms != 0)
    }

    /// True when `now` is within the 5-minute safety window of expiry (or past it).
    pub fn needs_refresh(&self, now_unix_ms: i64) -> bool {
        match self.expiry() {
            Some(expiry) => now_unix_ms >= expiry - 300_000,
            None => false,
        }
    }

    /// Normalize `resourceUrl` (bare host or full URL) to `https://<host>/v1`.
    pub fn normalized_base_url(&self, default_base: &str) -> String {
        let raw = self.resource_url.as_deref().unwrap_or(default_base);
        normalize_base_url(raw)
    }
}

pub fn normalize_base_url(raw: &str) -> String {
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let trimmed = with_scheme.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

/// Canonical KV key for an account, e.g. `qwen_creds_1a2b3c4d.json`. Strips a
/// legacy `./` prefix, which this struct never produces but may receive from
/// `listPrefix` during a full scan.
pub fn canonicalize_key(raw_key: &str) -> String {
    raw_key.strip_prefix("./").unwrap_or(raw_key).to_string()
}

pub fn legacy_key(canonical_key: &str) -> String {
    format!("./{canonical_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_is_byte_identical() {
        let cred = Credential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: Some("Bearer".into()),
            scope: None,
            resource_url: Some("dashscope.example.com".into()),
            expiry_unix_ms: Some(1_700_000_000_000),
            alias: Some("alice".into()),
        };
        let encoded = serde_json::to_string(&cred).unwrap();
        let decoded: Credential = serde_json::from_str(&encoded).unwrap();
        assert_eq!(cred, decoded);
    }

    #[test]
    fn zero_expiry_is_treated_as_absent() {
        let cred = Credential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: None,
            scope: None,
            resource_url: None,
            expiry_unix_ms: Some(0),
            alias: None,
        };
        assert_eq!(cred.expiry(), None);
        assert!(!cred.needs_refresh(9_999_999_999_999));
    }

    #[test]
    fn expiry_exactly_at_boundary_triggers_refresh() {
        let cred = Credential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            token_type: None,
            scope: None,
            resource_url: None,
            expiry_unix_ms: Some(1_000_000_000),
            alias: None,
        };
        assert!(cred.needs_refresh(1_000_000_000 - 300_000));
        assert!(!cred.needs_refresh(1_000_000_000 - 300_001));
    }

    #[test]
    fn base_url_normalization_variants() {
        assert_eq!(
            normalize_base_url("dashscope.example.com"),
            "https://dashscope.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://dashscope.example.com/"),
            "https://dashscope.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://dashscope.example.com/v1"),
            "https://dashscope.example.com/v1"
        );
    }

    #[test]
    fn canonicalize_strips_legacy_prefix() {
        assert_eq!(
            canonicalize_key("./qwen_creds_aaaaaaaa.json"),
            "qwen_creds_aaaaaaaa.json"
        );
        assert_eq!(
            canonicalize_key("qwen_creds_aaaaaaaa.json"),
            "qwen_creds_aaaaaaaa.json"
        );
    }
}
