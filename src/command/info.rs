use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::config::{self, Config};
use crate::logger;
use crate::sandbox::BuildTool;

#[derive(Tabled)]
struct SystemRow {
    #[tabled(rename = "SYSTEM")]
    name: String,
    #[tabled(rename = "BASE IMAGE")]
    base_image: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
}

fn system_rows(config: &Config) -> Vec<SystemRow> {
    config
        .systems
        .iter()
        .map(|(name, system)| SystemRow {
            name: name.clone(),
            base_image: system.base_image.clone(),
            description: system.description.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

fn render_systems(config: &Config) -> Option<String> {
    let rows = system_rows(config);
    if rows.is_empty() {
        return None;
    }
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..3), Padding::new(0, 1, 0, 0));
    Some(table.to_string())
}

pub fn run() -> Result<()> {
    let config = Config::load()?;

    let config_path = config::config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    let binary = BuildTool::discover(config.build_binary.as_deref())
        .map(|tool| tool.binary().display().to_string())
        .unwrap_or_else(|_| "not found".to_string());
    let log = logger::log_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "-".to_string());

    println!("Config:       {config_path}");
    println!("Build binary: {binary}");
    println!("Log:          {log}");
    println!();

    match render_systems(&config) {
        Some(table) => println!("{table}"),
        None => println!("No systems configured"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    #[test]
    fn no_systems_renders_nothing() {
        assert!(render_systems(&Config::default()).is_none());
    }

    #[test]
    fn systems_table_lists_each_entry() {
        let mut config = Config::default();
        config.systems.insert(
            "hpc".to_string(),
            SystemConfig {
                base_image: "docker://rockylinux:9".to_string(),
                description: Some("Cluster nodes".to_string()),
            },
        );
        config.systems.insert(
            "edge".to_string(),
            SystemConfig {
                base_image: "docker://alpine:latest".to_string(),
                description: None,
            },
        );

        let table = render_systems(&config).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("SYSTEM") && lines[0].contains("BASE IMAGE"));
        assert!(lines[1].starts_with("edge") && lines[1].contains("docker://alpine:latest"));
        assert!(lines[2].starts_with("hpc") && lines[2].contains("Cluster nodes"));
    }
}
