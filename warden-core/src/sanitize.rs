//! Redaction of sensitive request material before it reaches logs.
//!
//! Pure helpers: the logger decides *whether* to log, these decide *what*
//! survives. Matching is case-insensitive on header/param/field names.

use http::HeaderMap;
use serde_json::Value;

/// What gets redacted, and with what.
#[derive(Clone, Debug)]
pub struct SanitizeOptions {
    /// Header names whose values are replaced.
    pub sensitive_headers: Vec<String>,
    /// Query parameter names whose values are replaced.
    pub sensitive_params: Vec<String>,
    /// JSON body field names whose values are replaced, at any depth.
    pub sensitive_fields: Vec<String>,
    /// Character the replacement mask is built from.
    pub redaction: char,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            sensitive_headers: vec![
                "authorization".into(),
                "proxy-authorization".into(),
                "cookie".into(),
                "set-cookie".into(),
                "x-api-key".into(),
            ],
            sensitive_params: vec![
                "token".into(),
                "key".into(),
                "api_key".into(),
                "secret".into(),
                "password".into(),
            ],
            sensitive_fields: vec![
                "password".into(),
                "secret".into(),
                "token".into(),
                "access_token".into(),
                "refresh_token".into(),
                "api_key".into(),
            ],
            redaction: '*',
        }
    }
}

impl SanitizeOptions {
    /// The mask substituted for redacted values.
    pub fn mask(&self) -> String {
        std::iter::repeat(self.redaction).take(8).collect()
    }

    fn is_sensitive(names: &[String], candidate: &str) -> bool {
        names.iter().any(|n| n.eq_ignore_ascii_case(candidate))
    }

    /// Headers as loggable `(name, value)` pairs with sensitive values masked.
    /// Values that are not valid UTF-8 are masked unconditionally.
    pub fn sanitize_headers(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                let rendered = if Self::is_sensitive(&self.sensitive_headers, name.as_str()) {
                    self.mask()
                } else {
                    value.to_str().map(str::to_owned).unwrap_or_else(|_| self.mask())
                };
                (name.as_str().to_owned(), rendered)
            })
            .collect()
    }

    /// Query parameters with sensitive values masked.
    pub fn sanitize_params(&self, params: &[(String, String)]) -> Vec<(String, String)> {
        params
            .iter()
            .map(|(name, value)| {
                let rendered = if Self::is_sensitive(&self.sensitive_params, name) {
                    self.mask()
                } else {
                    value.clone()
                };
                (name.clone(), rendered)
            })
            .collect()
    }

    /// A copy of a JSON body with sensitive fields masked at any depth.
    pub fn sanitize_json(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if Self::is_sensitive(&self.sensitive_fields, k) {
                            (k.clone(), Value::String(self.mask()))
                        } else {
                            (k.clone(), self.sanitize_json(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize_json(v)).collect()),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn masks_authorization_header_case_insensitively() {
        let opts = SanitizeOptions::default();
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer hunter2".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        let out = opts.sanitize_headers(&headers);
        assert!(out.contains(&("authorization".into(), "********".into())));
        assert!(out.contains(&("accept".into(), "application/json".into())));
    }

    #[test]
    fn masks_params() {
        let opts = SanitizeOptions::default();
        let out = opts.sanitize_params(&[
            ("page".into(), "2".into()),
            ("API_KEY".into(), "abc".into()),
        ]);
        assert_eq!(out[0].1, "2");
        assert_eq!(out[1].1, "********");
    }

    #[test]
    fn masks_nested_json_fields() {
        let opts = SanitizeOptions::default();
        let body = json!({
            "user": {"name": "jo", "password": "hunter2"},
            "tokens": [{"access_token": "abc"}],
            "note": "ok"
        });
        assert_json_eq!(
            opts.sanitize_json(&body),
            json!({
                "user": {"name": "jo", "password": "********"},
                "tokens": [{"access_token": "********"}],
                "note": "ok"
            })
        );
    }

    #[test]
    fn custom_redaction_character() {
        let opts = SanitizeOptions {
            redaction: '#',
            ..Default::default()
        };
        assert_eq!(opts.mask(), "########");
    }
}
