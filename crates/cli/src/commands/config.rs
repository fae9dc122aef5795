//! Configuration commands (show, init)

use std::path::Path;

use anyhow::{Result, bail};
use grainidx_core::Config;

/// Show the effective configuration and where it came from
pub fn cmd_config_show(cwd: &Path, explicit: Option<&Path>) -> Result<()> {
  let config = match explicit {
    Some(path) => {
      println!("Using config file: {:?}", path);
      Config::load_from(path)?
    }
    None => {
      let project_config = Config::project_config_path(cwd);
      let user_config = Config::user_config_path();
      if project_config.exists() {
        println!("Using project config: {:?}", project_config);
      } else if let Some(user_path) = user_config.filter(|p| p.exists()) {
        println!("Using user config: {:?}", user_path);
      } else {
        println!("Using default configuration (no config file found)");
      }
      Config::load_for_project(cwd)
    }
  };
  println!();
  println!("{}", config.to_toml()?);
  Ok(())
}

/// Write a commented default config to the project or user location
pub fn cmd_config_init(cwd: &Path, user: bool, force: bool) -> Result<()> {
  let config_path = if user {
    match Config::user_config_path() {
      Some(path) => path,
      None => bail!("Could not determine user config path"),
    }
  } else {
    Config::project_config_path(cwd)
  };

  if config_path.exists() && !force {
    bail!("Config file already exists: {:?} (use --force to overwrite)", config_path);
  }
  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&config_path, Config::generate_template())?;

  println!("Created config: {:?}", config_path);
  println!("Edit the file to customize settings.");
  Ok(())
}
