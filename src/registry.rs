use crate::error::{ContainerError, ContainerResult, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

const ID_LEN: usize = 8;
const ID_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const UUID_VERSION_BYTE: usize = 6;
const UUID_VARIANT_BYTE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Running => f.write_str("running"),
            ContainerStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// On-disk record of one container, stored as `<id>.json`.
///
/// `pid` is only a hint: it names the process spawned last, and after that process exits
/// the kernel may hand the same number to something unrelated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Pid", default)]
    pub pid: i32,
    #[serde(rename = "Command")]
    pub command: Vec<String>,
    #[serde(rename = "Status")]
    pub status: ContainerStatus,
    #[serde(rename = "RootFs")]
    pub rootfs: PathBuf,
    // Records written before cgroup support have no such field.
    #[serde(rename = "Cgroup", default, skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<PathBuf>,
    #[serde(rename = "Hostname", default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(rename = "Network", default, skip_serializing_if = "is_false")]
    pub network: bool,
    #[serde(rename = "UserNamespace", default, skip_serializing_if = "is_false")]
    pub user_namespace: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Container {
    pub fn new(id: impl Into<String>, command: Vec<String>, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            pid: 0,
            command,
            status: ContainerStatus::Stopped,
            rootfs: rootfs.into(),
            cgroup: None,
            hostname: None,
            network: false,
            user_namespace: false,
        }
    }
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Eight characters from `[a-z0-9]`. Unique only with high probability; nothing checks for clashes.
pub fn generate_id() -> String {
    let mut id = String::with_capacity(ID_LEN);
    while id.len() < ID_LEN {
        for (index, byte) in uuid::Uuid::new_v4().into_bytes().into_iter().enumerate() {
            // Bytes 6 and 8 carry the v4 version and variant bits.
            if index == UUID_VERSION_BYTE || index == UUID_VARIANT_BYTE {
                continue;
            }
            // 252 is the largest multiple of 36 below 256.
            if byte >= 252 {
                continue;
            }
            id.push(ID_ALPHABET[usize::from(byte) % ID_ALPHABET.len()] as char);
            if id.len() == ID_LEN {
                break;
            }
        }
    }
    id
}

/// Containers known to this engine instance, backed by one JSON file per container.
///
/// The map is a cache for this process only. Other invocations see changes through the
/// files, and nothing locks them.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    containers: HashMap<String, Container>,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            containers: HashMap::new(),
        }
    }
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn put(&mut self, container: Container) {
        self.containers.insert(container.id.clone(), container);
    }
    pub fn get(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }
    pub fn delete(&mut self, id: &str) -> Option<Container> {
        self.containers.remove(id)
    }

    pub fn persist(&self, container: &Container) -> ContainerResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ContainerError::registry(format!("Failed to create {:?}: {}", self.dir, e))
        })?;
        let data = serde_json::to_vec_pretty(container)?;
        let path = self.record_path(&container.id);
        fs::write(&path, data)
            .map_err(|e| ContainerError::registry(format!("Failed to write {:?}: {}", path, e)))
            .context(format!("persisting container {}", container.id))?;
        log::debug!("Persisted container {} to {:?}", container.id, path);
        Ok(())
    }

    /// Deletes the persisted record. `Ok(false)` when there was nothing to delete.
    pub fn remove_record(&self, id: &str) -> ContainerResult<bool> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ContainerError::registry(format!(
                "Failed to remove {:?}: {}",
                path, e
            ))),
        }
    }

    /// Reads every `*.json` record in the state directory. Unreadable or corrupt files are
    /// skipped so one bad record cannot hide the rest.
    pub fn load_all(&self) -> ContainerResult<Vec<Container>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ContainerError::registry(format!(
                    "Failed to read {:?}: {}",
                    self.dir, e
                )));
            }
        };
        let mut containers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") || !path.is_file() {
                continue;
            }
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("Skipping unreadable record {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_slice::<Container>(&data) {
                Ok(container) => containers.push(container),
                Err(e) => log::debug!("Skipping corrupt record {:?}: {}", path, e),
            }
        }
        Ok(containers)
    }

    /// Memory first; on a miss, rescan the state directory and cache what matches.
    pub fn lookup(&mut self, id: &str) -> ContainerResult<Container> {
        if let Some(container) = self.get(id) {
            return Ok(container.clone());
        }
        log::debug!("Container {id} not in memory, scanning {:?}", self.dir);
        let container = self
            .load_all()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ContainerError::not_found(id))?;
        self.put(container.clone());
        Ok(container)
    }

    pub fn list(&self) -> ContainerResult<Vec<Container>> {
        let mut containers = self.load_all()?;
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample(id: &str) -> Container {
        let mut container = Container::new(
            id,
            vec!["/bin/echo".to_string(), "hi".to_string()],
            format!("/tmp/cellbox/{id}/rootfs"),
        );
        container.pid = 4321;
        container.status = ContainerStatus::Running;
        container.cgroup = Some(PathBuf::from(format!("/sys/fs/cgroup/cellbox/{id}")));
        container
    }

    #[test]
    fn ids_have_fixed_length_and_alphabet() {
        for _ in 0..1000 {
            let id = generate_id();
            assert_eq!(id.len(), 8);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)), "bad id {id}");
        }
    }

    #[test]
    fn ten_thousand_ids_do_not_collide() {
        // 36^8 possible ids; a clash here is astronomically unlikely, not impossible.
        let ids: HashSet<String> = (0..10_000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn every_position_draws_evenly_from_alphabet() {
        const DRAWS: usize = 36_000;
        let mut counts = [[0usize; 36]; ID_LEN];
        for _ in 0..DRAWS {
            for (pos, byte) in generate_id().bytes().enumerate() {
                let symbol = ID_ALPHABET.iter().position(|&b| b == byte).unwrap();
                counts[pos][symbol] += 1;
            }
        }
        // Expected 1000 per symbol, standard deviation about 31.
        for (pos, row) in counts.iter().enumerate() {
            for (symbol, &n) in row.iter().enumerate() {
                assert!(
                    (700..=1300).contains(&n),
                    "position {pos} symbol {} drawn {n} times",
                    ID_ALPHABET[symbol] as char
                );
            }
        }
    }

    #[test]
    fn persisted_record_round_trips_through_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut original = sample("ab12cd34");
        original.hostname = Some("web".to_string());
        original.network = true;
        registry.persist(&original).unwrap();

        let loaded = registry.load_all().unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[test]
    fn record_uses_documented_field_names() {
        let value = serde_json::to_value(sample("ab12cd34")).unwrap();
        let object = value.as_object().unwrap();
        for key in ["ID", "Pid", "Command", "Status", "RootFs", "Cgroup"] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object["Status"], "running");
        assert!(!object.contains_key("Network"));
    }

    #[test]
    fn records_without_cgroup_still_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("old00001.json"),
            r#"{"ID":"old00001","Pid":77,"Command":["/bin/sh"],"Status":"stopped","RootFs":"/tmp/cellbox/old00001/rootfs"}"#,
        )
        .unwrap();
        let loaded = Registry::new(dir.path()).load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].cgroup, None);
        assert_eq!(loaded[0].status, ContainerStatus::Stopped);
    }

    #[test]
    fn load_all_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.persist(&sample("aaaa1111")).unwrap();
        registry.persist(&sample("bbbb2222")).unwrap();
        fs::write(dir.path().join("cccc3333.json"), "{ not json").unwrap();
        fs::create_dir_all(dir.path().join("aaaa1111").join("rootfs")).unwrap();

        let mut ids: Vec<String> = registry.load_all().unwrap().into_iter().map(|c| c.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["aaaa1111", "bbbb2222"]);
    }

    #[test]
    fn load_all_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("never-created"));
        assert!(registry.load_all().unwrap().is_empty());
    }

    #[test]
    fn lookup_falls_back_to_disk_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        Registry::new(dir.path()).persist(&sample("ffff0000")).unwrap();

        let mut fresh = Registry::new(dir.path());
        assert!(fresh.get("ffff0000").is_none());
        let found = fresh.lookup("ffff0000").unwrap();
        assert_eq!(found.pid, 4321);
        assert!(fresh.get("ffff0000").is_some());

        assert!(matches!(
            fresh.lookup("nope0000"),
            Err(ContainerError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_record_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.persist(&sample("dddd4444")).unwrap();
        assert!(registry.remove_record("dddd4444").unwrap());
        assert!(!registry.remove_record("dddd4444").unwrap());
    }
}
