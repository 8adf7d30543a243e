//! Wire records exchanged with the parent build tool

use serde::{Deserialize, Serialize};

use super::RequestError;

/// One build request. Immutable after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildRequest {
    /// Correlation key echoed in the response
    pub rule: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub temp_dir: String,
    #[serde(default, rename = "srcs")]
    pub sources: Vec<String>,
    /// `name=value` entries; values may be quoted.
    #[serde(default, rename = "opts")]
    pub options: Vec<String>,
    #[serde(default)]
    pub test: bool,
}

impl BuildRequest {
    /// Value of option `name` with one layer of surrounding quotes removed.
    pub fn option(&self, name: &str) -> Result<String, RequestError> {
        self.options
            .iter()
            .filter_map(|opt| opt.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| unquote(value).to_string())
            .ok_or_else(|| RequestError::MissingOption {
                name: name.to_string(),
                available: self.options.clone(),
            })
    }
}

fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

/// Exactly one per accepted request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildResponse {
    pub rule: String,
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl BuildResponse {
    pub fn success(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            success: true,
            messages: Vec::new(),
            build_file: None,
            command: None,
        }
    }

    pub fn failure(rule: impl Into<String>, messages: Vec<String>) -> Self {
        Self {
            rule: rule.into(),
            success: false,
            messages,
            build_file: None,
            command: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opts: &[&str]) -> BuildRequest {
        BuildRequest {
            rule: "//foo:bar".to_string(),
            labels: Vec::new(),
            temp_dir: "/tmp/x".to_string(),
            sources: Vec::new(),
            options: opts.iter().map(|s| s.to_string()).collect(),
            test: false,
        }
    }

    #[test]
    fn decodes_wire_names() {
        let line = r#"{"rule":"//foo:bar","labels":["docker"],"temp_dir":"/tmp/x","srcs":["Dockerfile"],"opts":["--image_out=\"img.tar\""],"test":false}"#;
        let req: BuildRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.rule, "//foo:bar");
        assert_eq!(req.sources, vec!["Dockerfile"]);
        assert_eq!(req.option("--image_out").unwrap(), "img.tar");
    }

    #[test]
    fn list_fields_default_to_empty() {
        let req: BuildRequest =
            serde_json::from_str(r#"{"rule":"r","temp_dir":"/tmp"}"#).unwrap();
        assert!(req.labels.is_empty());
        assert!(req.sources.is_empty());
        assert!(req.options.is_empty());
        assert!(!req.test);
    }

    #[test]
    fn rule_is_required() {
        assert!(serde_json::from_str::<BuildRequest>(r#"{"temp_dir":"/tmp"}"#).is_err());
    }

    #[test]
    fn option_splits_on_first_equals() {
        let req = request(&["--build_arg=A=B", "--dockerfile=Dockerfile", "bare"]);
        assert_eq!(req.option("--build_arg").unwrap(), "A=B");
        assert_eq!(req.option("--dockerfile").unwrap(), "Dockerfile");
    }

    #[test]
    fn missing_option_names_it() {
        let err = request(&["--dockerfile=Dockerfile"])
            .option("--image_out")
            .unwrap_err();
        assert!(err.to_string().contains("--image_out"));
    }

    #[test]
    fn response_omits_empty_overrides() {
        let json = serde_json::to_string(&BuildResponse::success("A")).unwrap();
        assert_eq!(json, r#"{"rule":"A","success":true,"messages":[]}"#);
    }
}
