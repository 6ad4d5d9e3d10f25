//! Durable state store for flow instances, the transition log and chain progress

use crate::models::{ChainRecord, FlowInstance, FlowTransitionRecord, ResourceId};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Persistence contract the engine and the chain executor rely on
///
/// Every write must be durable before it returns: the engine records an
/// instance before dispatching the follow-up event.
pub trait FlowStore: Send + Sync {
    /// Insert or replace an instance, keyed by flow id
    fn save_instance(&self, instance: &FlowInstance) -> Result<()>;

    fn load_instance(&self, flow_id: Uuid) -> Option<FlowInstance>;

    /// Most recently started instance of a definition for a resource
    fn latest_instance(&self, resource_id: ResourceId, definition: &str) -> Option<FlowInstance>;

    fn list_instances(&self) -> Vec<FlowInstance>;

    /// Non-terminal instances with a handler that never committed
    fn find_pending_instances(&self) -> Vec<FlowInstance> {
        self.list_instances()
            .into_iter()
            .filter(|instance| !instance.is_terminal() && instance.pending_event.is_some())
            .collect()
    }

    fn append_transition(&self, record: FlowTransitionRecord) -> Result<()>;

    fn transitions(&self, flow_id: Uuid) -> Vec<FlowTransitionRecord>;

    /// Insert or replace a chain record, keyed by chain id
    fn save_chain(&self, record: &ChainRecord) -> Result<()>;

    fn load_chain(&self, chain_id: Uuid) -> Option<ChainRecord>;

    fn list_chains(&self) -> Vec<ChainRecord>;

    fn find_incomplete_chains(&self) -> Vec<ChainRecord> {
        self.list_chains()
            .into_iter()
            .filter(|chain| !chain.is_complete())
            .collect()
    }
}

/// Root JSON document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JsonStore {
    /// All flow instances, finished ones included
    pub instances: Vec<FlowInstance>,
    /// Append-only transition log
    pub transitions: Vec<FlowTransitionRecord>,
    /// Chain progress records
    pub chains: Vec<ChainRecord>,
}

/// [`FlowStore`] backed by one pretty-printed JSON file
///
/// The whole document is kept in memory. Every mutation writes a complete copy
/// to a temporary file next to the store and renames it over the old one,
/// under an exclusive lock on `<store>.lock`.
pub struct JsonFlowStore {
    /// Path to JSON store file; `None` keeps everything in memory
    store_path: Option<PathBuf>,
    store: Mutex<JsonStore>,
}

impl JsonFlowStore {
    /// Open the store at `store_path`, creating parent directories as needed
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create flow store directory")?;
        }

        let store = if store_path.exists() {
            Self::load_store(&store_path)?
        } else {
            JsonStore::default()
        };

        Ok(Self {
            store_path: Some(store_path),
            store: Mutex::new(store),
        })
    }

    /// Store that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            store_path: None,
            store: Mutex::new(JsonStore::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    /// Copy of the whole document
    pub fn snapshot(&self) -> JsonStore {
        self.store.lock().unwrap().clone()
    }

    fn lock_file(path: &Path) -> Result<File> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_path))
            .context("Failed to open flow store lock file")
    }

    fn load_store(path: &Path) -> Result<JsonStore> {
        let lock = Self::lock_file(path)?;
        lock.lock_shared()
            .context("Failed to acquire read lock on flow store")?;

        let file = File::open(path).context("Failed to open flow store file")?;
        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read flow store")?;

        drop(reader);
        drop(lock);

        if contents.trim().is_empty() {
            return Ok(JsonStore::default());
        }

        serde_json::from_str(&contents).context("Failed to parse flow store JSON")
    }

    fn save_store(&self, store: &JsonStore) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(store).context("Failed to serialize flow store")?;

        let lock = Self::lock_file(path)?;
        lock.lock_exclusive()
            .context("Failed to acquire write lock on flow store")?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).context("Failed to create flow store temp file")?;
        temp.write_all(json.as_bytes())
            .context("Failed to write flow store")?;
        temp.as_file()
            .sync_all()
            .context("Failed to flush flow store to disk")?;
        temp.persist(path)
            .context("Failed to replace flow store file")?;

        drop(lock);
        Ok(())
    }

    /// Apply a mutation to a copy and keep it only once it is on disk
    fn mutate(&self, apply: impl FnOnce(&mut JsonStore)) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let mut updated = store.clone();
        apply(&mut updated);
        self.save_store(&updated)?;
        *store = updated;
        Ok(())
    }
}

impl FlowStore for JsonFlowStore {
    fn save_instance(&self, instance: &FlowInstance) -> Result<()> {
        self.mutate(|store| {
            match store
                .instances
                .iter_mut()
                .find(|existing| existing.flow_id == instance.flow_id)
            {
                Some(existing) => *existing = instance.clone(),
                None => store.instances.push(instance.clone()),
            }
        })
    }

    fn load_instance(&self, flow_id: Uuid) -> Option<FlowInstance> {
        let store = self.store.lock().unwrap();
        store
            .instances
            .iter()
            .find(|instance| instance.flow_id == flow_id)
            .cloned()
    }

    fn latest_instance(&self, resource_id: ResourceId, definition: &str) -> Option<FlowInstance> {
        let store = self.store.lock().unwrap();
        store
            .instances
            .iter()
            .filter(|instance| {
                instance.resource_id == resource_id && instance.definition == definition
            })
            .max_by_key(|instance| instance.started_at)
            .cloned()
    }

    fn list_instances(&self) -> Vec<FlowInstance> {
        self.store.lock().unwrap().instances.clone()
    }

    fn append_transition(&self, record: FlowTransitionRecord) -> Result<()> {
        self.mutate(|store| store.transitions.push(record))
    }

    fn transitions(&self, flow_id: Uuid) -> Vec<FlowTransitionRecord> {
        let store = self.store.lock().unwrap();
        store
            .transitions
            .iter()
            .filter(|record| record.flow_id == flow_id)
            .cloned()
            .collect()
    }

    fn save_chain(&self, record: &ChainRecord) -> Result<()> {
        self.mutate(|store| {
            match store
                .chains
                .iter_mut()
                .find(|existing| existing.chain_id == record.chain_id)
            {
                Some(existing) => *existing = record.clone(),
                None => store.chains.push(record.clone()),
            }
        })
    }

    fn load_chain(&self, chain_id: Uuid) -> Option<ChainRecord> {
        let store = self.store.lock().unwrap();
        store
            .chains
            .iter()
            .find(|chain| chain.chain_id == chain_id)
            .cloned()
    }

    fn list_chains(&self) -> Vec<ChainRecord> {
        self.store.lock().unwrap().chains.clone()
    }
}
