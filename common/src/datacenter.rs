// Cluster-wide and group-scoped configuration used for ${KEY} resolution

use crate::errors::{RuntimeError, StoreError, SubstitutionError};
use crate::models::{ConfigUnit, ConfigValue, Job};
use crate::repositories::{child_key, dir_prefix, list_json, put_json};
use crate::store::KvStore;
use crate::substitution::VariableSubstitutor;
use crate::watch::{Event, Watcher};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Shared configuration context
///
/// Global units are persisted under the config prefix and mirrored
/// locally; group contexts live only in this process.
pub struct DataCenterConfig {
    store: Arc<dyn KvStore>,
    prefix: String,
    units: RwLock<HashMap<String, ConfigUnit>>,
    groups: RwLock<HashMap<String, HashMap<String, String>>>,
    substitutor: VariableSubstitutor,
}

impl DataCenterConfig {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Result<Self, SubstitutionError> {
        Ok(Self {
            store,
            prefix: prefix.into(),
            units: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            substitutor: VariableSubstitutor::new()?,
        })
    }

    /// Replace the local mirror with what the store holds
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn load(&self) -> Result<usize, StoreError> {
        let units: Vec<ConfigUnit> = list_json(self.store.as_ref(), &dir_prefix(&self.prefix)).await?;
        let count = units.len();
        let mut cache = self.units.write().unwrap_or_else(PoisonError::into_inner);
        cache.clear();
        for unit in units {
            cache.insert(unit.name.clone(), unit);
        }
        info!(count, "Global configuration loaded");
        Ok(count)
    }

    pub fn get_config(&self, name: &str) -> Option<ConfigUnit> {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Store a unit; arrays merge into the existing value without duplicates
    #[instrument(skip(self, unit), fields(name = %unit.name))]
    pub async fn put_config(&self, mut unit: ConfigUnit) -> Result<(), StoreError> {
        if let ConfigValue::Array(values) = &unit.value {
            let mut merged = match self.get_config(&unit.name).map(|u| u.value) {
                Some(ConfigValue::String(old)) if !old.is_empty() => vec![old],
                Some(ConfigValue::Array(old)) => old,
                _ => Vec::new(),
            };
            merged.extend(values.iter().cloned());
            unit.value = ConfigValue::Array(dedup(merged));
            unit.value_type = "array".to_string();
        }

        put_json(self.store.as_ref(), &child_key(&self.prefix, &unit.name), &unit).await?;
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.name.clone(), unit);
        Ok(())
    }

    pub fn set_group_value(&self, group_id: &str, key: &str, value: &str) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn group_value(&self, group_id: &str, key: &str) -> Option<String> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .and_then(|ctx| ctx.get(key).cloned())
    }

    /// Value of `key` seen from `group_id`: group context first, then global
    pub fn lookup(&self, group_id: &str, key: &str) -> Option<String> {
        if !group_id.is_empty() {
            if let Some(value) = self.group_value(group_id, key) {
                return Some(value);
            }
        }
        self.get_config(key).map(|unit| unit.value.render())
    }

    pub fn resolve(&self, group_id: &str, template: &str) -> Result<String, SubstitutionError> {
        if !self.substitutor.has_variables(template) {
            return Ok(template.to_string());
        }
        self.substitutor
            .substitute(template, |key| self.lookup(group_id, key))
    }

    /// Resolve placeholders in the job's command, stdin and environment
    pub fn render_job(&self, group_id: &str, job: &mut Job) -> Result<(), SubstitutionError> {
        let command = self.resolve(group_id, &job.command)?;
        let stdin = self.resolve(group_id, &job.stdin)?;
        let envs = job
            .envs
            .iter()
            .map(|env| self.resolve(group_id, env))
            .collect::<Result<Vec<_>, _>>()?;
        job.command = command;
        job.stdin = stdin;
        job.envs = envs;
        Ok(())
    }

    fn apply(&self, event: Event<ConfigUnit>) {
        let mut cache = self.units.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            Event::Added { value, .. } | Event::Modified { value, .. } => {
                debug!(name = %value.name, "Global config updated");
                cache.insert(value.name.clone(), value);
            }
            Event::Deleted { key, prev } => {
                let name = prev
                    .map(|unit| unit.name)
                    .unwrap_or_else(|| key.rsplit('/').next().unwrap_or_default().to_string());
                cache.remove(&name);
            }
            Event::Error(_) => {}
        }
    }

    /// Keep the mirror current until cancelled
    pub async fn watch(&self, watcher: &Watcher, cancel: CancellationToken) -> Result<(), RuntimeError> {
        watcher
            .consume_json::<ConfigUnit, _, _>(&dir_prefix(&self.prefix), &cancel, |event| {
                self.apply(event);
                std::future::ready(())
            })
            .await
    }
}

/// Remove repeated values keeping the first occurrence
pub fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> (DataCenterConfig, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            DataCenterConfig::new(store.clone(), "/fleet/config/global").unwrap(),
            store,
        )
    }

    #[tokio::test]
    async fn test_array_values_merge_without_duplicates() {
        let (dc, _) = config();
        dc.put_config(ConfigUnit::string("HOSTS", "a")).await.unwrap();
        dc.put_config(ConfigUnit::array("HOSTS", vec!["b".into(), "a".into()]))
            .await
            .unwrap();
        dc.put_config(ConfigUnit::array("HOSTS", vec!["c".into(), "b".into()]))
            .await
            .unwrap();
        assert_eq!(
            dc.get_config("HOSTS").unwrap().value,
            ConfigValue::Array(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[tokio::test]
    async fn test_string_values_replace() {
        let (dc, _) = config();
        dc.put_config(ConfigUnit::array("PORT", vec!["1".into()]))
            .await
            .unwrap();
        dc.put_config(ConfigUnit::string("PORT", "2")).await.unwrap();
        assert_eq!(
            dc.get_config("PORT").unwrap().value,
            ConfigValue::String("2".into())
        );
    }

    #[tokio::test]
    async fn test_group_context_shadows_global() {
        let (dc, _) = config();
        dc.put_config(ConfigUnit::string("MASTER", "10.0.0.1"))
            .await
            .unwrap();
        dc.put_config(ConfigUnit::array("NODES", vec!["n1".into(), "n2".into()]))
            .await
            .unwrap();
        dc.set_group_value("g1", "MASTER", "192.168.0.1");

        assert_eq!(
            dc.resolve("g1", "join ${MASTER} ${NODES}").unwrap(),
            "join 192.168.0.1 n1,n2"
        );
        assert_eq!(dc.resolve("g2", "join ${MASTER}").unwrap(), "join 10.0.0.1");
        assert!(dc.resolve("g2", "${MISSING}").is_err());
    }

    #[tokio::test]
    async fn test_load_reads_persisted_units() {
        let (dc, store) = config();
        dc.put_config(ConfigUnit::string("A", "1")).await.unwrap();

        let fresh = DataCenterConfig::new(store, "/fleet/config/global").unwrap();
        assert_eq!(fresh.load().await.unwrap(), 1);
        assert_eq!(fresh.lookup("", "A").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_render_job_touches_command_stdin_and_envs() {
        use crate::job::create_job_from_task;
        use crate::models::{Shell, Task, TaskTemplate};

        let (dc, _) = config();
        dc.put_config(ConfigUnit::string("TARGET", "db-1")).await.unwrap();
        let task = Task::new(
            "t1",
            TaskTemplate {
                shell: Shell {
                    cmd: vec!["backup".into(), "${TARGET}".into()],
                },
                input: "host=${TARGET}".into(),
                envs: HashMap::from([("DEST".into(), "${TARGET}".into())]),
                ..Default::default()
            },
        );
        let mut job = create_job_from_task(&task, "n1").unwrap();
        dc.render_job("", &mut job).unwrap();
        assert_eq!(job.command, "backup db-1");
        assert_eq!(job.stdin, "host=db-1");
        assert_eq!(job.envs, vec!["DEST=db-1".to_string()]);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        assert_eq!(
            dedup(vec!["b".into(), "a".into(), "b".into()]),
            vec!["b".to_string(), "a".to_string()]
        );
    }
}
