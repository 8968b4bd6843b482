//! Configuration validation logic.

use std::collections::HashSet;

use http::Uri;

use crate::config::schema::ProxyConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut targets: Vec<(&str, &str)> = Vec::new();
    if let Some(target) = &config.upstream {
        targets.push(("default", target.as_str()));
    }
    let mut names = HashSet::new();
    for u in &config.upstreams {
        let name = u.name.as_deref().or(u.prefix.as_deref()).unwrap_or("/");
        if !names.insert(name) {
            errors.push(ValidationError(format!("duplicate upstream name {name:?}")));
        }
        targets.push((name, u.target.as_str()));
    }

    for (name, target) in targets {
        match target.parse::<Uri>() {
            Ok(uri) => {
                if uri.scheme().is_none() || uri.authority().is_none() {
                    errors.push(ValidationError(format!(
                        "upstream {name:?} target {target:?} must be an absolute URL"
                    )));
                }
            }
            Err(e) => {
                errors.push(ValidationError(format!(
                    "upstream {name:?} target {target:?} is not a valid URL: {e}"
                )));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::UpstreamConfig;

    #[test]
    fn valid_config_passes() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[upstreams]]
            name = "api"
            prefix = "/api"
            target = "http://localhost:8081"
            "#,
        )
        .unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn relative_target_is_rejected() {
        let mut config = ProxyConfig::default();
        config.upstreams.push(UpstreamConfig {
            name: Some("api".to_string()),
            prefix: Some("/api".to_string()),
            target: "/just/a/path".to_string(),
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("absolute URL"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut config = ProxyConfig::default();
        for _ in 0..2 {
            config.upstreams.push(UpstreamConfig {
                name: Some("api".to_string()),
                prefix: Some("/api".to_string()),
                target: "http://localhost:8081".to_string(),
            });
        }

        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].0.contains("duplicate"));
    }
}
