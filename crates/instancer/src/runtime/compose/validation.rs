// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::runtime::DriverError;

macro_rules! ensure_option_none {
    ($field:expr) => {
        if $field.is_some() {
            return Err(DriverError::SpecValidationError(format!(
                "Property not supported: {}",
                stringify!($field)
            )));
        }
    };
}

macro_rules! ensure_map_empty {
    ($field:expr) => {
        if !$field.is_empty() {
            return Err(DriverError::SpecValidationError(format!(
                "Property not supported: {}",
                stringify!($field)
            )));
        }
    };
}

macro_rules! ensure_false {
    ($field:expr) => {
        if $field {
            return Err(DriverError::SpecValidationError(format!(
                "Property not supported: {}",
                stringify!($field)
            )));
        }
    };
}

/// Rejects service options an instance cannot honor. Networks are managed
/// per instance, so services may not bring their own.
pub fn ensure_only_supported(svc: &compose_spec::Service) -> Result<(), DriverError> {
    ensure_option_none!(svc.build);
    ensure_option_none!(svc.network_config);
    ensure_option_none!(svc.pid);
    ensure_option_none!(svc.platform);
    ensure_false!(svc.privileged);
    ensure_map_empty!(svc.cap_add);
    ensure_map_empty!(svc.security_opt);
    ensure_map_empty!(svc.sysctls);
    Ok(())
}

pub fn validate(compose: &compose_spec::Compose) -> Result<(), DriverError> {
    if compose.services.is_empty() {
        return Err(DriverError::SpecValidationError(
            "Composition defines no services".to_string(),
        ));
    }
    for (name, svc) in &compose.services {
        ensure_only_supported(svc).map_err(|e| match e {
            DriverError::SpecValidationError(msg) => {
                DriverError::SpecValidationError(format!("service {}: {}", name, msg))
            }
            e => e,
        })?;
        if svc.image.is_none() {
            return Err(DriverError::SpecValidationError(format!(
                "service {} has no image",
                name
            )));
        }
        if compose_spec::service::ports::into_long_iter(svc.ports.clone())
            .any(|port| port.host_ip.is_some())
        {
            return Err(DriverError::SpecValidationError(format!(
                "service {}: ports with a host IP are not supported",
                name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(document: &str) -> compose_spec::Compose {
        serde_yaml::from_str(document).unwrap()
    }

    #[test]
    fn test_accepts_plain_services() {
        let compose = parse(
            r#"
services:
  web:
    image: nginx
    ports:
      - "10000:80"
  db:
    image: postgres
    environment:
      POSTGRES_PASSWORD: secret
"#,
        );
        assert!(validate(&compose).is_ok());
    }

    #[test]
    fn test_rejects_build_and_privileged() {
        let compose = parse(
            r#"
services:
  web:
    build: .
    image: web
"#,
        );
        assert!(matches!(
            validate(&compose),
            Err(DriverError::SpecValidationError(msg)) if msg.contains("svc.build")
        ));

        let compose = parse(
            r#"
services:
  web:
    image: nginx
    privileged: true
"#,
        );
        assert!(validate(&compose).is_err());
    }

    #[test]
    fn test_rejects_missing_image() {
        let parsed = serde_yaml::from_str::<compose_spec::Compose>(
            r#"
services:
  web:
    command: ["sleep", "1"]
"#,
        );
        // Either the parser or the validator has to refuse it.
        if let Ok(compose) = parsed {
            assert!(matches!(
                validate(&compose),
                Err(DriverError::SpecValidationError(msg)) if msg.contains("no image")
            ));
        }
    }
}
