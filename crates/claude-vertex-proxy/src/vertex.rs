//! Vertex AI endpoint URLs for Anthropic publisher models.

use crate::config::RouteConfig;

const GLOBAL_REGION: &str = "global";

/// Which publisher-model method to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexMethod {
    RawPredict,
    StreamRawPredict,
    CountTokens,
}

impl VertexMethod {
    pub fn for_stream(stream: bool) -> Self {
        if stream {
            Self::StreamRawPredict
        } else {
            Self::RawPredict
        }
    }
}

/// `{base}/v1/projects/{project}/locations/{region}/publishers/anthropic/models/...`
#[derive(Debug, Clone)]
pub struct VertexEndpoint {
    models_base: String,
}

impl VertexEndpoint {
    /// `base_override` replaces the scheme and host, mainly for tests.
    pub fn new(routes: &RouteConfig, base_override: Option<&str>) -> Self {
        let region = routes.region();
        let base = match base_override {
            Some(base) => base.trim_end_matches('/').to_string(),
            None if region == GLOBAL_REGION => "https://aiplatform.googleapis.com".to_string(),
            None => format!("https://{region}-aiplatform.googleapis.com"),
        };

        Self {
            models_base: format!(
                "{base}/v1/projects/{}/locations/{region}/publishers/anthropic/models",
                routes.project_id()
            ),
        }
    }

    pub fn url(&self, vertex_model: &str, method: VertexMethod) -> String {
        match method {
            VertexMethod::RawPredict => format!("{}/{vertex_model}:rawPredict", self.models_base),
            VertexMethod::StreamRawPredict => {
                format!("{}/{vertex_model}:streamRawPredict", self.models_base)
            }
            VertexMethod::CountTokens => format!("{}/count-tokens:rawPredict", self.models_base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(region: &str) -> RouteConfig {
        RouteConfig::new("my-proj", region, [("haiku", "claude-3-5-haiku@20241022")]).unwrap()
    }

    #[test]
    fn test_regional_urls() {
        let endpoint = VertexEndpoint::new(&routes("us-east5"), None);

        assert_eq!(
            endpoint.url("claude-3-5-haiku@20241022", VertexMethod::RawPredict),
            "https://us-east5-aiplatform.googleapis.com/v1/projects/my-proj/locations/us-east5/publishers/anthropic/models/claude-3-5-haiku@20241022:rawPredict"
        );
        assert_eq!(
            endpoint.url("claude-3-5-haiku@20241022", VertexMethod::for_stream(true)),
            "https://us-east5-aiplatform.googleapis.com/v1/projects/my-proj/locations/us-east5/publishers/anthropic/models/claude-3-5-haiku@20241022:streamRawPredict"
        );
        assert_eq!(
            endpoint.url("claude-3-5-haiku@20241022", VertexMethod::CountTokens),
            "https://us-east5-aiplatform.googleapis.com/v1/projects/my-proj/locations/us-east5/publishers/anthropic/models/count-tokens:rawPredict"
        );
    }

    #[test]
    fn test_global_region_host() {
        let endpoint = VertexEndpoint::new(&routes("global"), None);
        assert!(endpoint
            .url("m", VertexMethod::RawPredict)
            .starts_with("https://aiplatform.googleapis.com/v1/projects/my-proj/locations/global/"));
    }

    #[test]
    fn test_base_override() {
        let endpoint = VertexEndpoint::new(&routes("europe-west1"), Some("http://127.0.0.1:8080/"));
        assert_eq!(
            endpoint.url("m", VertexMethod::RawPredict),
            "http://127.0.0.1:8080/v1/projects/my-proj/locations/europe-west1/publishers/anthropic/models/m:rawPredict"
        );
    }
}
