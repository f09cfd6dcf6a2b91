//! Daemon configuration, loaded from a YAML file with defaults for every
//! key.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use brine_data::MergerOptions;
use brine_events::parser::compile_anchored;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of reader tasks parsing raw events.
    pub readers_subprocesses: usize,
    /// Primary allowlist regex for event tags.
    pub events_regex_filter: String,
    /// Additional allowlist regexes.
    pub events_additional: Vec<String>,
    /// Directory holding the internal publisher socket.
    pub sock_dir: PathBuf,
    /// The master event bus socket to read events from.
    pub master_event_pub: PathBuf,
    /// Write buffer size hint for the publisher channel; 0 disables
    /// buffering.
    pub ipc_write_buffer: usize,
    pub rename_rules: RenameRules,
    pub merge_rules: MergeRules,
    /// Seconds between checks for timed-out jobs.
    pub job_timeout_check_interval: u64,
    /// Seconds after which a pending job is considered timed out.
    pub job_timeout: u64,
    /// Seconds between job gauge recomputations.
    pub job_metrics_update_interval: u64,
    /// Seconds after which completed jids are pruned.
    pub job_cleanup_after: u64,
    /// Label value substituted for empty mods in `salt_state_jobs`.
    pub set_highstate_mods_in_metrics: String,
    pub restapi: RestApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            readers_subprocesses: 3,
            events_regex_filter: r"salt/job/\d+/(new|ret/.+)".to_string(),
            events_additional: vec![
                r"salt/auth".to_string(),
                r"salt/key".to_string(),
                r"salt/batch/\d+/(start|done)".to_string(),
                r"salt/(run|wheel)/\d+/(new|ret)".to_string(),
            ],
            sock_dir: PathBuf::from("/run/brine"),
            master_event_pub: PathBuf::from("/var/run/salt/master/master_event_pub.ipc"),
            ipc_write_buffer: 0,
            rename_rules: RenameRules::default(),
            merge_rules: MergeRules::default(),
            job_timeout_check_interval: 120,
            job_timeout: 1200,
            job_metrics_update_interval: 3,
            job_cleanup_after: 1200,
            set_highstate_mods_in_metrics: String::new(),
            restapi: RestApiConfig::default(),
        }
    }
}

/// One label rename rule; rules apply first-match-wins in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct RenameRule {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenameRules {
    pub sls: Vec<RenameRule>,
    pub sid: Vec<RenameRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeRuleConfig {
    pub start_merging_on: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MergeRules {
    pub sls: MergeRuleConfig,
    pub sid: MergeRuleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestApiConfig {
    pub host: String,
    pub port: u16,
    pub disable_ssl: bool,
    pub ssl_crt: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_chain: Option<PathBuf>,
    /// Directory of static files to serve, if any.
    #[serde(rename = "static")]
    pub static_dir: Option<PathBuf>,
    /// URL prefix for the static directory.
    pub static_path: String,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8216,
            disable_ssl: false,
            ssl_crt: None,
            ssl_key: None,
            ssl_chain: None,
            static_dir: None,
            static_path: "/static".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("Could not parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Environment verification: every configured regex must compile, and
    /// SSL material must be present unless SSL is disabled.
    pub fn validate(&self) -> Result<()> {
        compile_anchored(&self.events_regex_filter)
            .with_context(|| format!("Invalid events_regex_filter: {}", self.events_regex_filter))?;
        for pattern in &self.events_additional {
            compile_anchored(pattern)
                .with_context(|| format!("Invalid events_additional pattern: {}", pattern))?;
        }
        for rule in self.rename_rules.sls.iter().chain(&self.rename_rules.sid) {
            compile_anchored(&rule.pattern)
                .with_context(|| format!("Invalid rename rule pattern: {}", rule.pattern))?;
        }

        if !self.restapi.disable_ssl {
            let (Some(crt), Some(key)) = (&self.restapi.ssl_crt, &self.restapi.ssl_key) else {
                bail!(
                    "Options 'ssl_crt' and 'ssl_key' are required if SSL is not disabled"
                );
            };
            for cert_file in [Some(crt), Some(key), self.restapi.ssl_chain.as_ref()]
                .into_iter()
                .flatten()
            {
                if !cert_file.exists() {
                    bail!("Could not find a certificate: {}", cert_file.display());
                }
            }
        }
        Ok(())
    }

    pub fn sls_rename_pairs(&self) -> Vec<(String, String)> {
        self.rename_rules
            .sls
            .iter()
            .map(|r| (r.pattern.clone(), r.replacement.clone()))
            .collect()
    }

    pub fn sid_rename_pairs(&self) -> Vec<(String, String)> {
        self.rename_rules
            .sid
            .iter()
            .map(|r| (r.pattern.clone(), r.replacement.clone()))
            .collect()
    }

    pub fn merger_options(&self) -> MergerOptions {
        MergerOptions {
            sls_start_merging_on: self.merge_rules.sls.start_merging_on.unwrap_or(70),
            sid_start_merging_on: self.merge_rules.sid.start_merging_on.unwrap_or(150),
            highstate_mods: self.set_highstate_mods_in_metrics.clone(),
            job_cleanup_after: self.job_cleanup_after as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.readers_subprocesses, 3);
        assert_eq!(config.events_regex_filter, r"salt/job/\d+/(new|ret/.+)");
        assert_eq!(config.events_additional.len(), 4);
        assert_eq!(config.job_timeout_check_interval, 120);
        assert_eq!(config.job_timeout, 1200);
        assert_eq!(config.job_metrics_update_interval, 3);
        assert_eq!(config.job_cleanup_after, 1200);
        assert_eq!(config.restapi.port, 8216);
        assert_eq!(config.restapi.host, "0.0.0.0");
        let opts = config.merger_options();
        assert_eq!(opts.sls_start_merging_on, 70);
        assert_eq!(opts.sid_start_merging_on, 150);
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let yaml = r#"
readers_subprocesses: 5
restapi:
  port: 9000
  disable_ssl: true
merge_rules:
  sls:
    start_merging_on: 40
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.readers_subprocesses, 5);
        assert_eq!(config.restapi.port, 9000);
        assert!(config.restapi.disable_ssl);
        // Untouched keys keep their defaults.
        assert_eq!(config.job_timeout, 1200);
        assert_eq!(config.merger_options().sls_start_merging_on, 40);
        assert_eq!(config.merger_options().sid_start_merging_on, 150);
    }

    #[test]
    fn rename_rules_parse_in_order() {
        let yaml = r#"
rename_rules:
  sls:
    - pattern: "env\\..*"
      replacement: "env"
    - pattern: ".*"
      replacement: "other"
restapi:
  disable_ssl: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let pairs = config.sls_rename_pairs();
        assert_eq!(pairs[0].1, "env");
        assert_eq!(pairs[1].1, "other");
        config.validate().unwrap();
    }

    #[test]
    fn invalid_regex_fails_validation() {
        let config = Config {
            events_regex_filter: "(".to_string(),
            restapi: RestApiConfig {
                disable_ssl: true,
                ..RestApiConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ssl_required_without_disable() {
        let config = Config::default();
        // No certificates configured and SSL not disabled.
        assert!(config.validate().is_err());
    }

    #[test]
    fn ssl_files_must_exist() {
        let config = Config {
            restapi: RestApiConfig {
                ssl_crt: Some(PathBuf::from("/nonexistent/server.crt")),
                ssl_key: Some(PathBuf::from("/nonexistent/server.key")),
                ..RestApiConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn static_dir_key_named_static() {
        let yaml = r#"
restapi:
  disable_ssl: true
  static: /srv/brine/static
  static_path: /assets
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.restapi.static_dir.as_deref(),
            Some(Path::new("/srv/brine/static"))
        );
        assert_eq!(config.restapi.static_path, "/assets");
    }
}
