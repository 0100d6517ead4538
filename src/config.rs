use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::errors::ProcmonError;

/// One entry of the `processes` array. Unknown attributes are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSpec {
    pub id: String,
    pub exec: String,
    /// Settle delay after spawn, in seconds. Both `"wait": 5` and
    /// `"wait": "5"` are accepted.
    #[serde(default, deserialize_with = "int_or_numeric_string")]
    pub wait: u64,
    #[serde(default)]
    pub restart_delay: u64,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub restart_on_parent_death: bool,
    #[serde(default)]
    pub monitored: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub skip: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    processes: Vec<ProcessSpec>,
}

/// Load and validate the process configuration.
pub fn load(path: &Path) -> Result<Vec<ProcessSpec>, ProcmonError> {
    let content = fs::read_to_string(path)?;
    let config: ConfigFile = serde_json::from_str(&content)?;
    validate(&config.processes)?;
    Ok(config.processes)
}

fn validate(specs: &[ProcessSpec]) -> Result<(), ProcmonError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.id.is_empty() {
            return Err(ProcmonError::InvalidConfig(
                "process id must not be empty".to_string(),
            ));
        }
        if spec.exec.is_empty() {
            return Err(ProcmonError::InvalidConfig(format!(
                "process {} has an empty exec",
                spec.id
            )));
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(ProcmonError::DuplicateId(spec.id.clone()));
        }
    }
    Ok(())
}

fn int_or_numeric_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(u64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(value) => Ok(value),
        IntOrString::Str(value) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Well-known filesystem locations. The lockfile directory defaults to
/// `/tmp` and can be redirected through `PROCMON_LOCK_DIR`, which is also
/// what keeps the integration tests hermetic.
#[derive(Debug, Clone)]
pub struct Paths {
    pub lock_dir: PathBuf,
}

pub const LOCKFILE_PREFIX: &str = "procmon.";

impl Paths {
    pub fn load() -> Self {
        let lock_dir = env::var("PROCMON_LOCK_DIR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self { lock_dir }
    }

}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::load;

    fn temp_config(contents: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("procmon-config-{nonce}.json"));
        fs::write(&path, contents).expect("failed to write config fixture");
        path
    }

    #[test]
    fn parses_full_process_definition() {
        let path = temp_config(
            r#"{
                "processes": [
                    {
                        "id": "varserver",
                        "exec": "varserver -f vars.json",
                        "wait": "2",
                        "restart_delay": 1,
                        "monitored": true
                    },
                    {
                        "id": "corevars",
                        "exec": "corevars",
                        "depends": ["varserver"],
                        "restart_on_parent_death": true,
                        "future_attribute": {"ignored": true}
                    }
                ]
            }"#,
        );

        let specs = load(&path).expect("expected config to parse");
        let _ = fs::remove_file(&path);

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].id, "varserver");
        assert_eq!(specs[0].wait, 2);
        assert_eq!(specs[0].restart_delay, 1);
        assert!(specs[0].monitored);
        assert!(specs[0].depends.is_empty());
        assert_eq!(specs[1].depends, vec!["varserver".to_string()]);
        assert!(specs[1].restart_on_parent_death);
        assert!(!specs[1].monitored, "monitored should default to false");
        assert!(!specs[1].skip);
    }

    #[test]
    fn integer_wait_is_accepted() {
        let path = temp_config(r#"{"processes": [{"id": "a", "exec": "a", "wait": 7}]}"#);
        let specs = load(&path).expect("expected config to parse");
        let _ = fs::remove_file(&path);
        assert_eq!(specs[0].wait, 7);
    }

    #[test]
    fn non_numeric_wait_is_rejected() {
        let path = temp_config(r#"{"processes": [{"id": "a", "exec": "a", "wait": "soon"}]}"#);
        let result = load(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let path = temp_config(
            r#"{"processes": [
                {"id": "a", "exec": "a"},
                {"id": "a", "exec": "b"}
            ]}"#,
        );
        let result = load(&path);
        let _ = fs::remove_file(&path);
        assert!(matches!(
            result,
            Err(crate::errors::ProcmonError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn empty_id_is_rejected() {
        let path = temp_config(r#"{"processes": [{"id": "", "exec": "a"}]}"#);
        let result = load(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn lockfile_paths_are_keyed_by_id() {
        assert_eq!(
            crate::lockfile::path_for(std::path::Path::new("/tmp"), "varserver"),
            PathBuf::from("/tmp/procmon.varserver")
        );
    }

    #[test]
    fn missing_processes_array_yields_empty_list() {
        let path = temp_config("{}");
        let specs = load(&path).expect("expected config to parse");
        let _ = fs::remove_file(&path);
        assert!(specs.is_empty());
    }
}
