//! `previewd check`: validate the config and show what `serve` would do.

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::config::{HostConfig, ProjectEntry};
use crate::log;

pub fn check(config: &HostConfig) -> Result<()> {
    log!("serve"; "{} is valid", config.config_path.display());

    let runtime = &config.runtime;
    let ports = runtime.ports();
    let range = match (ports.first(), ports.last()) {
        (Some(first), Some(last)) => format!("{first}-{last}"),
        _ => "none".into(),
    };
    println!("runtime   {}", runtime.command.join(" "));
    println!("ports     {} ({} slots)", range, ports.len());
    println!("relay     {}", endpoint(config.relay.enable, config.relay.interface, config.relay.port));
    println!("admin     {}", endpoint(config.admin.enable, config.admin.interface, config.admin.port));

    if config.projects.is_empty() {
        println!("no projects configured");
        return Ok(());
    }

    println!();
    let mut lines = project_table(&config.projects).into_iter();
    if let Some(header) = lines.next() {
        println!("{}", header.bold());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn endpoint(enable: bool, interface: std::net::IpAddr, port: u16) -> String {
    if enable {
        format!("{interface}:{port}")
    } else {
        "disabled".into()
    }
}

/// One aligned row per project, header first. Missing roots are flagged.
fn project_table(projects: &[ProjectEntry]) -> Vec<String> {
    let width = projects
        .iter()
        .map(|p| p.id.as_str().len())
        .max()
        .unwrap_or(0)
        .max("ID".len());

    let mut lines = Vec::with_capacity(projects.len() + 1);
    lines.push(format!("{:<width$}  {:<5}  {}", "ID", "START", "ROOT"));
    for project in projects {
        let start = if project.autostart { "yes" } else { "no" };
        let missing = if project.root.is_dir() { "" } else { " (missing)" };
        lines.push(format!(
            "{:<width$}  {:<5}  {}{}",
            project.id.as_str(),
            start,
            project.root.display(),
            missing
        ));
    }
    lines
}
