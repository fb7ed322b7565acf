//! Destination of the metrics documents.

use crate::config::Config;

/// Database URL, device location and token, fixed once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    database_url: String,
    location: Option<String>,
    token: Option<String>,
}

impl Endpoint {
    /// Resolve an endpoint, falling back to the configured defaults for any
    /// field that is `None`.
    pub fn resolve(
        database_url: Option<&str>,
        location: Option<&str>,
        token: Option<&str>,
        config: &Config,
    ) -> Self {
        let database_url = database_url
            .unwrap_or(config.database_url.as_str())
            .trim_end_matches('/')
            .to_string();

        let location = location
            .map(str::to_string)
            .or_else(|| Some(config.device_location.clone()))
            .filter(|l| !l.is_empty());

        let token = token
            .map(str::to_string)
            .or_else(|| config.token.clone())
            .filter(|t| !t.is_empty());

        Self {
            database_url,
            location,
            token,
        }
    }

    /// Endpoint built only from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::resolve(None, None, None, config)
    }

    /// URL documents are posted to: `<database_url>/<location>`.
    pub fn target_url(&self) -> String {
        match &self.location {
            Some(location) => format!(
                "{}/{}",
                self.database_url,
                location.trim_matches('/')
            ),
            None => self.database_url.clone(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_config() {
        let config = Config::default();
        let endpoint = Endpoint::from_config(&config);
        assert_eq!(endpoint.database_url(), "http://localhost:8086/metrics");
        assert_eq!(endpoint.location(), Some("default-location"));
        assert_eq!(endpoint.token(), None);
        assert_eq!(
            endpoint.target_url(),
            "http://localhost:8086/metrics/default-location"
        );
    }

    #[test]
    fn test_explicit_values_override_config() {
        let config = Config {
            token: Some("cfg-token".to_string()),
            ..Config::default()
        };
        let endpoint = Endpoint::resolve(
            Some("https://example.com/db/"),
            Some("TestLocation"),
            Some("tok"),
            &config,
        );
        assert_eq!(endpoint.target_url(), "https://example.com/db/TestLocation");
        assert_eq!(endpoint.token(), Some("tok"));

        let endpoint = Endpoint::resolve(None, None, None, &config);
        assert_eq!(endpoint.token(), Some("cfg-token"));
    }

    #[test]
    fn test_empty_location_uses_bare_url() {
        let config = Config::default();
        let endpoint = Endpoint::resolve(Some("http://db"), Some(""), None, &config);
        assert_eq!(endpoint.location(), None);
        assert_eq!(endpoint.target_url(), "http://db");
    }
}
