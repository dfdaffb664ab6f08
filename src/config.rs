use anyhow::{Context, Result, bail};
use chrono::Local;
use std::path::{Path, PathBuf};

use crate::chain_config::ChainConfig;
use crate::phase::{PhaseBook, RoleBook};

pub const CHAIN_CONFIG_FILE: &str = "ChatChainConfig.json";
pub const PHASE_CONFIG_FILE: &str = "PhaseConfig.json";
pub const ROLE_CONFIG_FILE: &str = "RoleConfig.json";
pub const MODEL_CATALOG_FILE: &str = "models.toml";
pub const DEFAULT_COMPANY: &str = "Default";

/// Paths of the three config files of a company.
///
/// Each file is looked up in `<root>/<company>/` first and falls back to
/// `<root>/Default/` independently, so a company may override only the files
/// it cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyConfig {
    pub company: String,
    pub chain_config: PathBuf,
    pub phase_config: PathBuf,
    pub role_config: PathBuf,
}

/// The parsed configuration of a company.
#[derive(Debug, Clone)]
pub struct LoadedCompany {
    pub chain: ChainConfig,
    pub phases: PhaseBook,
    pub roles: RoleBook,
}

impl CompanyConfig {
    pub fn resolve(root: &Path, company: &str) -> Result<Self> {
        let company_dir = root.join(company);
        let default_dir = root.join(DEFAULT_COMPANY);

        if !company_dir.is_dir() && !default_dir.is_dir() {
            bail!(
                "No config directory for company '{}' under {}",
                company,
                root.display()
            );
        }

        let pick = |file: &str| -> Result<PathBuf> {
            let own = company_dir.join(file);
            if own.is_file() {
                return Ok(own);
            }
            let fallback = default_dir.join(file);
            if fallback.is_file() {
                return Ok(fallback);
            }
            bail!(
                "{} not found in {} or {}",
                file,
                company_dir.display(),
                default_dir.display()
            )
        };

        Ok(Self {
            company: company.to_string(),
            chain_config: pick(CHAIN_CONFIG_FILE)?,
            phase_config: pick(PHASE_CONFIG_FILE)?,
            role_config: pick(ROLE_CONFIG_FILE)?,
        })
    }

    pub fn files(&self) -> [&Path; 3] {
        [&self.chain_config, &self.phase_config, &self.role_config]
    }

    pub fn load(&self) -> Result<LoadedCompany> {
        Ok(LoadedCompany {
            chain: ChainConfig::load(&self.chain_config)?,
            phases: PhaseBook::load(&self.phase_config)?,
            roles: RoleBook::load(&self.role_config)?,
        })
    }
}

/// Local timestamp used in artifact and log names.
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// `<project>_<org>_<timestamp>`
pub fn software_name(project: &str, org: &str, start_time: &str) -> String {
    format!("{}_{}_{}", project, org, start_time)
}

/// The run log lives next to the artifact directories until the run finishes.
pub fn log_file_path(warehouse: &Path, project: &str, org: &str, start_time: &str) -> PathBuf {
    warehouse.join(format!("{}.log", software_name(project, org, start_time)))
}

/// Make `path` absolute against the current directory.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}
