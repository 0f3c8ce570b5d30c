// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::runtime::{DriverError, ProvisionRequest};

fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Renders the composition document with the instance's values.
///
/// Available variables: `container_name`, `instance_host`, `max_memory`,
/// `max_cpus`, `env` and, in direct mode, `instance_port`.
pub fn render(document: &str, request: &ProvisionRequest<'_>) -> Result<String, DriverError> {
    let mut tera = tera::Tera::default();

    let mut tera_ctx = tera::Context::new();
    tera_ctx.insert("container_name", &request.key.container_name());
    tera_ctx.insert("instance_host", request.host);
    tera_ctx.insert("max_memory", &request.memory_mb);
    tera_ctx.insert("max_cpus", &request.cpus);
    tera_ctx.insert("env", &request.challenge.envs);
    if let Some(port) = request.port {
        tera_ctx.insert("instance_port", &port);
    }

    tera.render_str(document, &tera_ctx)
        .map_err(|e| DriverError::SpecParseError(describe(&e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeSpec;
    use crate::instances::InstanceKey;

    fn request(challenge: &ChallengeSpec, port: Option<u16>) -> ProvisionRequest<'_> {
        ProvisionRequest {
            key: InstanceKey::new(2, 8),
            challenge,
            host: "ctf.test",
            port,
            route: None,
            memory_mb: 64,
            cpus: 0.25,
        }
    }

    #[test]
    fn test_render_substitutes_instance_values() {
        let mut challenge = ChallengeSpec::composition(2, "");
        challenge
            .envs
            .insert("FLAG".to_string(), "flag{tera}".to_string());
        let rendered = render(
            "name: {{ container_name }}\nport: {{ instance_port }}\nhost: {{ instance_host }}\nflag: {{ env.FLAG }}\ncpus: {{ max_cpus }}",
            &request(&challenge, Some(10042)),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "name: chall_2_8\nport: 10042\nhost: ctf.test\nflag: flag{tera}\ncpus: 0.25"
        );
    }

    #[test]
    fn test_render_errors_are_parse_errors() {
        let challenge = ChallengeSpec::composition(2, "");
        let result = render("{{ instance_port }}", &request(&challenge, None));
        assert!(matches!(result, Err(DriverError::SpecParseError(_))));
        let result = render("{% if %}", &request(&challenge, Some(1)));
        assert!(matches!(result, Err(DriverError::SpecParseError(_))));
    }
}
