//! Configuration command handlers

use crate::cli::{ConfigAction, ConfigArgs, ConfigFormat, ConfigInitArgs, ConfigShowArgs};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::OutputWriter;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Handle the config command
pub fn handle_config(args: ConfigArgs, config: &Config, output: &mut OutputWriter) -> Result<()> {
    match args.action {
        ConfigAction::Init(init_args) => handle_config_init(init_args, output),
        ConfigAction::Show(show_args) => handle_config_show(show_args, config, output),
        ConfigAction::Paths => handle_config_paths(output),
    }
}

fn handle_config_init(args: ConfigInitArgs, output: &mut OutputWriter) -> Result<()> {
    let path = if args.user {
        Config::user_config_path()
            .ok_or_else(|| Error::config("Unable to determine user config directory"))?
    } else {
        PathBuf::from(".cmarshal.yaml")
    };
    init_at(&path, args.force, output)
}

fn init_at(path: &Path, force: bool, output: &mut OutputWriter) -> Result<()> {
    if path.exists() && !force {
        output.warning(&format!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        ))?;
        return Ok(());
    }

    Config::default().save(path)?;
    output.success(&format!("✓ Created config at {}", path.display()))
}

fn handle_config_show(
    args: ConfigShowArgs,
    config: &Config,
    output: &mut OutputWriter,
) -> Result<()> {
    let content = match args.format {
        ConfigFormat::Toml => config.to_string_for(Path::new("config.toml"))?,
        ConfigFormat::Json => config.to_string_for(Path::new("config.json"))?,
        ConfigFormat::Yaml => config.to_string_for(Path::new("config.yaml"))?,
    };
    output.write(&content)?;
    if !content.ends_with('\n') {
        output.writeln("")?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SearchPath {
    path: PathBuf,
    exists: bool,
}

fn handle_config_paths(output: &mut OutputWriter) -> Result<()> {
    let paths: Vec<SearchPath> = Config::default_config_paths()
        .into_iter()
        .map(|path| SearchPath {
            exists: path.exists(),
            path,
        })
        .collect();

    if !output.is_human() {
        return output.data(&paths);
    }

    for entry in &paths {
        let marker = if entry.exists { "✓" } else { " " };
        output.writeln(&format!("{} {}", marker, entry.path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::OutputFormat;
    use crate::output::tests::writer;

    #[test]
    fn test_init_does_not_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cmarshal.yaml");
        std::fs::write(&path, "declarations: keep.yaml\n").unwrap();

        let (mut out, buffer) = writer(OutputFormat::Human);
        init_at(&path, false, &mut out).unwrap();
        assert!(buffer.contents().contains("already exists"));
        assert_eq!(
            Config::from_file(&path).unwrap().declarations,
            Some(PathBuf::from("keep.yaml"))
        );

        init_at(&path, true, &mut out).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_show_toml() {
        let mut config = Config::default();
        config.declarations = Some(PathBuf::from("demos/rosie.yaml"));
        let (mut out, buffer) = writer(OutputFormat::Human);
        handle_config_show(
            ConfigShowArgs {
                format: ConfigFormat::Toml,
            },
            &config,
            &mut out,
        )
        .unwrap();
        let text = buffer.contents();
        assert!(text.contains("declarations = \"demos/rosie.yaml\""));
        assert!(text.contains("[logging]"));
    }
}
