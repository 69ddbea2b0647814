use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, ArgMatches};
use serde::Deserialize;

use crate::error::RegmanError;

pub const ENV_PREFIX: &str = "REGMAN_";
const CONFIG_FILE_NAME: &str = ".regman.yaml";

/// Settings as supplied by one source. Unset keys fall through to the next
/// source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub registry: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub insecure: Option<bool>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Settings {
    pub registry: Option<String>,
    pub user: String,
    pub pass: String,
    pub insecure: bool,
}

/// Flags shared by every subcommand.
pub fn global_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .long("config")
            .value_name("FILE")
            .help("Config file (default is $HOME/.regman.yaml)")
            .global(true),
        Arg::new("registry")
            .long("registry")
            .value_name("URL")
            .help("Registry URL (e.g., https://my-registry.com)")
            .global(true),
        Arg::new("user")
            .long("user")
            .value_name("USER")
            .help("Registry username")
            .global(true),
        Arg::new("pass")
            .long("pass")
            .value_name("PASSWORD")
            .help("Registry password")
            .global(true),
        Arg::new("insecure")
            .long("insecure")
            .help("Allow HTTP and skip TLS verification")
            .num_args(0..=1)
            .require_equals(true)
            .default_missing_value("true")
            .value_parser(clap::value_parser!(bool))
            .action(ArgAction::Set)
            .global(true),
    ]
}

impl SettingsLayer {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        SettingsLayer {
            registry: matches.get_one::<String>("registry").cloned(),
            user: matches.get_one::<String>("user").cloned(),
            pass: matches.get_one::<String>("pass").cloned(),
            insecure: matches.get_one::<bool>("insecure").copied(),
        }
    }

    /// Reads `REGMAN_*` variables. Empty values count as unset.
    pub fn from_env<I>(vars: I) -> Result<Self, RegmanError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layer = SettingsLayer::default();
        for (key, value) in vars {
            let Some(key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "REGISTRY" => layer.registry = Some(value),
                "USER" => layer.user = Some(value),
                "PASS" => layer.pass = Some(value),
                "INSECURE" => {
                    layer.insecure = Some(parse_bool(&value).ok_or_else(|| {
                        RegmanError::Configuration(format!(
                            "{ENV_PREFIX}INSECURE must be a boolean, got '{value}'"
                        ))
                    })?)
                }
                _ => {}
            }
        }
        Ok(layer)
    }

    pub fn from_file(path: &Path) -> Result<Self, RegmanError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegmanError::Configuration(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        if content.trim().is_empty() {
            return Ok(SettingsLayer::default());
        }
        serde_yaml::from_str(&content).map_err(|e| {
            RegmanError::Configuration(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl Settings {
    /// Merges layers ordered from highest to lowest priority; each key takes
    /// the first layer that sets it.
    pub fn resolve(layers: &[SettingsLayer]) -> Self {
        fn first<T: Clone>(
            layers: &[SettingsLayer],
            pick: impl Fn(&SettingsLayer) -> Option<&T>,
        ) -> Option<T> {
            layers.iter().find_map(|layer| pick(layer).cloned())
        }

        Settings {
            registry: first(layers, |l| l.registry.as_ref()),
            user: first(layers, |l| l.user.as_ref()).unwrap_or_default(),
            pass: first(layers, |l| l.pass.as_ref()).unwrap_or_default(),
            insecure: first(layers, |l| l.insecure.as_ref()).unwrap_or_default(),
        }
    }

    /// Flags, then `REGMAN_*` environment, then the config file.
    pub fn load(matches: &ArgMatches) -> Result<Self, RegmanError> {
        let explicit = matches.get_one::<String>("config").map(PathBuf::from);
        let file = match explicit {
            Some(path) => SettingsLayer::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => SettingsLayer::from_file(&path)?,
                _ => SettingsLayer::default(),
            },
        };

        let layers = [
            SettingsLayer::from_matches(matches),
            SettingsLayer::from_env(std::env::vars())?,
            file,
        ];
        let settings = Settings::resolve(&layers);
        log::debug!(
            "Using registry {:?} (insecure: {})",
            settings.registry,
            settings.insecure
        );
        Ok(settings)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn matches(args: &[&str]) -> ArgMatches {
        clap::Command::new("regman")
            .args(global_args())
            .subcommand(clap::Command::new("ls"))
            .try_get_matches_from(args)
            .unwrap()
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let flags = SettingsLayer {
            registry: Some("flag.test".to_string()),
            ..Default::default()
        };
        let env = SettingsLayer::from_env(env(&[
            ("REGMAN_REGISTRY", "env.test"),
            ("REGMAN_USER", "env-user"),
        ]))
        .unwrap();
        let file = SettingsLayer {
            registry: Some("file.test".to_string()),
            user: Some("file-user".to_string()),
            pass: Some("file-pass".to_string()),
            insecure: Some(true),
        };

        let settings = Settings::resolve(&[flags, env, file]);
        assert_eq!(settings.registry.as_deref(), Some("flag.test"));
        assert_eq!(settings.user, "env-user");
        assert_eq!(settings.pass, "file-pass");
        assert!(settings.insecure);
    }

    #[test]
    fn nothing_set_resolves_to_defaults() {
        let settings = Settings::resolve(&[SettingsLayer::default(), SettingsLayer::default()]);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn env_ignores_foreign_and_empty_vars() {
        let layer = SettingsLayer::from_env(env(&[
            ("HOME", "/root"),
            ("REGMAN_USER", ""),
            ("REGMAN_INSECURE", "T"),
        ]))
        .unwrap();
        assert_eq!(
            layer,
            SettingsLayer {
                insecure: Some(true),
                ..Default::default()
            }
        );
    }

    #[test]
    fn env_rejects_bad_boolean() {
        let err = SettingsLayer::from_env(env(&[("REGMAN_INSECURE", "yes")])).unwrap_err();
        assert!(matches!(err, RegmanError::Configuration(_)));
    }

    #[test]
    fn flags_after_subcommand_are_read() {
        let m = matches(&["regman", "ls", "--registry", "reg.test", "--insecure"]);
        let layer = SettingsLayer::from_matches(&m);
        assert_eq!(layer.registry.as_deref(), Some("reg.test"));
        assert_eq!(layer.insecure, Some(true));
    }

    #[test]
    fn absent_insecure_flag_falls_through() {
        let m = matches(&["regman", "ls"]);
        assert_eq!(SettingsLayer::from_matches(&m).insecure, None);

        let m = matches(&["regman", "--insecure=false", "ls"]);
        assert_eq!(SettingsLayer::from_matches(&m).insecure, Some(false));
    }

    #[test]
    fn reads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "registry: https://file.test\nuser: alice\ninsecure: true").unwrap();

        let layer = SettingsLayer::from_file(file.path()).unwrap();
        assert_eq!(layer.registry.as_deref(), Some("https://file.test"));
        assert_eq!(layer.user.as_deref(), Some("alice"));
        assert_eq!(layer.pass, None);
        assert_eq!(layer.insecure, Some(true));
    }

    #[test]
    fn unreadable_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SettingsLayer::from_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, RegmanError::Configuration(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "registry: [unterminated").unwrap();
        let err = SettingsLayer::from_file(file.path()).unwrap_err();
        assert!(matches!(err, RegmanError::Configuration(_)));
    }
}
