use async_trait::async_trait;
use reqwest::Method;

use crate::bridge::ScenarioContext;
use crate::engine::executor::Scenario;
use crate::error::{ConfigError, ScenarioError};

/// Scenario the binary runs when no custom one is linked in: one request to
/// `target` per iteration. With a dataset, the VU's record is sent as the
/// JSON body.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    target: String,
    method: Method,
}

impl HttpProbe {
    pub fn new(target: impl Into<String>, method: Option<&str>) -> Result<Self, ConfigError> {
        let target = target.into();
        if !(target.starts_with("http://") || target.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "target '{}' must be an http:// or https:// URL",
                target
            )));
        }
        let method = match method {
            Some(m) => Method::from_bytes(m.trim().to_uppercase().as_bytes())
                .map_err(|_| ConfigError::Invalid(format!("invalid HTTP method '{}'", m)))?,
            None => Method::GET,
        };
        Ok(Self { target, method })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl Scenario for HttpProbe {
    fn name(&self) -> &str {
        "http-probe"
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        let http = ctx.http();
        let mut request = http.request(self.method.clone(), &self.target);
        if let Some(record) = ctx.dataset_record() {
            request = request.json(record);
        }
        let response = http.send(request).await?;
        ctx.check("status is 2xx", response.status().is_success());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_validation() {
        let probe = HttpProbe::new("http://localhost:8065/api/v4/users/login", Some("post")).unwrap();
        assert_eq!(probe.method(), &Method::POST);
        assert_eq!(HttpProbe::new("https://example.com", None).unwrap().method(), &Method::GET);

        assert!(matches!(HttpProbe::new("localhost:8065", None), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            HttpProbe::new("http://localhost", Some("NOT A METHOD")),
            Err(ConfigError::Invalid(_))
        ));
    }
}
