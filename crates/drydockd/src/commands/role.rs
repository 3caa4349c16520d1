use std::path::Path;

use anyhow::Context;
use drydock_core::Role;
use drydock_state::NodeRepository;

use crate::app::App;
use crate::console::Console;

/// Parse a role definition.
///
/// ```toml
/// name = "cache"
/// services = ["redis-server"]
/// stateful = true
/// service_type = "redis"
/// required_capabilities = ["ssd"]
/// install_playbook = "playbooks/cache.yml"
///
/// [[health_checks]]
/// type = "tcp"
/// port = 6379
/// ```
pub fn parse_role(content: &str) -> anyhow::Result<Role> {
    let role: Role = toml::from_str(content)?;
    if role.name.trim().is_empty() {
        anyhow::bail!("role name must not be empty");
    }
    if role.stateful && role.service_type.is_none() {
        anyhow::bail!("stateful role {} needs a service_type", role.name);
    }
    Ok(role)
}

/// Read a role file on the operator's side; the daemon may not see the
/// same filesystem.
pub fn read_file(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

/// Register or replace the role defined by `content`; `source` names it in
/// errors.
pub fn add(app: &App, out: &Console, source: &str, content: &str) -> anyhow::Result<()> {
    let role = parse_role(content).with_context(|| format!("parsing {source}"))?;
    let replaced = app.store.get_role_by_name(&role.name)?.is_some();
    app.store.put_role(&role)?;

    let verb = if replaced { "Updated" } else { "Registered" };
    out.line(format!("✓ {verb} role {}", role.name));
    out.line(format!("  Services: {}", role.services.join(", ")));
    Ok(())
}

pub fn list(app: &App, out: &Console) -> anyhow::Result<()> {
    let roles = app.store.list_roles()?;
    if roles.is_empty() {
        out.line("No roles.");
        return Ok(());
    }
    for role in &roles {
        let kind = match &role.service_type {
            Some(service_type) if role.stateful => format!("stateful/{service_type}"),
            _ => "stateless".to_string(),
        };
        out.line(format!("{:<20} {:<18} {}", role.name, kind, role.services.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::HealthCheck;

    #[test]
    fn parses_full_role() {
        let role = parse_role(
            r#"
name = "cache"
services = ["redis-server"]
stateful = true
service_type = "redis"
required_capabilities = ["ssd"]
install_playbook = "playbooks/cache.yml"

[[health_checks]]
type = "tcp"
port = 6379

[[health_checks]]
type = "systemd"
service = "redis-server"
"#,
        )
        .unwrap();

        assert_eq!(role.name, "cache");
        assert!(role.required_capabilities.contains("ssd"));
        assert_eq!(
            role.health_checks,
            vec![
                HealthCheck::Tcp { port: 6379 },
                HealthCheck::Systemd {
                    service: "redis-server".into()
                },
            ]
        );
    }

    #[test]
    fn stateful_role_needs_service_type() {
        let err = parse_role("name = \"db\"\nservices = []\nstateful = true\n").unwrap_err();
        assert!(err.to_string().contains("service_type"));
    }
}
