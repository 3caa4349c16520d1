use drydock_core::{NewNode, Node, NodeState};
use drydock_state::NodeRepository;
use tracing::warn;

use crate::app::App;
use crate::console::Console;

pub fn add(
    app: &App,
    out: &Console,
    name: &str,
    address: &str,
    ssh_port: Option<u16>,
    ssh_user: Option<String>,
    capabilities: Vec<String>,
) -> anyhow::Result<()> {
    let mut new = NewNode::new(name, address);
    new.ssh_port = ssh_port.unwrap_or(app.config.ssh.port);
    new.ssh_user = ssh_user.unwrap_or_else(|| app.config.ssh.user.clone());
    for tag in &capabilities {
        new = new.with_capability(tag);
    }

    let node = app.store.create_node(new)?;
    out.line(format!("✓ Registered {} ({})", node.name, node.id));
    out.line(format!("  State: {}", node.state));
    Ok(())
}

pub fn list(app: &App, out: &Console, state: Option<&str>) -> anyhow::Result<()> {
    let filter = state.map(|s| s.parse::<NodeState>()).transpose()?;
    let nodes = app.store.get_all_nodes(filter)?;
    if nodes.is_empty() {
        out.line("No nodes.");
        return Ok(());
    }

    out.line(format!("{:<24} {:<20} {:<12} {:<16} ADDRESS", "NAME", "ID", "STATE", "ROLE"));
    for node in &nodes {
        out.line(format!(
            "{:<24} {:<20} {:<12} {:<16} {}",
            node.name,
            node.id,
            node.state.as_str(),
            node.role.as_deref().unwrap_or("-"),
            node.address
        ));
    }
    Ok(())
}

pub fn show(app: &App, out: &Console, key: &str, history: usize) -> anyhow::Result<()> {
    let node = app.resolve_node(key)?;
    print_node(out, &node);

    let transitions = app.store.get_state_transitions(&node.id, history)?;
    if !transitions.is_empty() {
        out.line("  Transitions (newest first):");
        for t in &transitions {
            out.line(format!("    {} {} -> {} ({})", t.timestamp_ms, t.from, t.to, t.trigger));
        }
    }
    Ok(())
}

pub fn set_state(
    app: &App,
    out: &Console,
    key: &str,
    state: &str,
    force: bool,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let node = app.resolve_node(key)?;
    let to: NodeState = state.parse()?;
    if force {
        warn!(node = %node.name, from = %node.state, %to, "forcing state change");
    }
    let details = reason.map(|r| serde_json::json!({ "reason": r }));
    let updated = app
        .store
        .update_node_state(&node.id, to, "operator", details, !force)?;
    out.line(format!("✓ {}: {} -> {}", updated.name, node.state, updated.state));
    Ok(())
}

pub fn delete(app: &App, out: &Console, key: &str) -> anyhow::Result<()> {
    let node = app.resolve_node(key)?;
    if app.store.delete_node(&node.id)? {
        out.line(format!("✓ Deleted {}", node.name));
    } else {
        out.line(format!("{} was already gone", node.name));
    }
    Ok(())
}

fn print_node(out: &Console, node: &Node) {
    out.line(format!("{} ({})", node.name, node.id));
    out.line(format!("  Address:      {}@{}:{}", node.ssh_user, node.address, node.ssh_port));
    out.line(format!("  State:        {}", node.state));
    out.line(format!("  Role:         {}", node.role.as_deref().unwrap_or("-")));
    if let Some(donor) = &node.borrowed_from {
        out.line(format!("  Borrowed from: {donor}"));
    }
    if !node.capabilities.is_empty() {
        let caps: Vec<&str> = node.capabilities.iter().map(String::as_str).collect();
        out.line(format!("  Capabilities: {}", caps.join(", ")));
    }
    match node.last_heartbeat {
        Some(hb) => out.line(format!("  Heartbeat:    {hb}")),
        None => out.line("  Heartbeat:    never"),
    }
    out.line(format!("  Failures:     {}", node.consecutive_failures));
}
