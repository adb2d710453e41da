use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Acquisition, BillingEvent, StripeEventRecord, StripeInfo, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Email is taken.")]
    EmailTaken,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("failed to persist store snapshot: {0}")]
    Snapshot(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn insert_user(&self, user: User) -> StoreResult<()>;
    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn update_user(&self, user: User) -> StoreResult<()>;

    async fn get_info_for_user(&self, user_id: Uuid) -> StoreResult<Option<StripeInfo>>;
    async fn get_info_by_customer(&self, customer_id: &str) -> StoreResult<Option<StripeInfo>>;
    /// Inserts or replaces by id. One record per user and per customer id.
    async fn save_info(&self, info: StripeInfo) -> StoreResult<()>;
    async fn delete_info(&self, info_id: Uuid) -> StoreResult<()>;
    async fn list_infos(&self) -> StoreResult<Vec<StripeInfo>>;

    async fn insert_billing_event(&self, billing: BillingEvent) -> StoreResult<()>;
    async fn get_billing_event(&self, billing_id: Uuid) -> StoreResult<Option<BillingEvent>>;
    async fn list_billing_events_for_user(&self, user_id: Uuid) -> StoreResult<Vec<BillingEvent>>;
    async fn list_billing_events(&self) -> StoreResult<Vec<BillingEvent>>;

    /// Returns `false` without storing anything when the event id was seen before.
    async fn record_event(&self, record: StripeEventRecord) -> StoreResult<bool>;
    async fn forget_event(&self, event_id: &str) -> StoreResult<()>;
    async fn list_events(&self) -> StoreResult<Vec<StripeEventRecord>>;

    async fn insert_acquisition(&self, acquisition: Acquisition) -> StoreResult<()>;
    async fn get_acquisition_for_user(&self, user_id: Uuid) -> StoreResult<Option<Acquisition>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    users: HashMap<Uuid, User>,
    infos: HashMap<Uuid, StripeInfo>,
    billing_events: Vec<BillingEvent>,
    events: Vec<StripeEventRecord>,
    acquisitions: Vec<Acquisition>,
}

/// In-memory store, optionally mirrored to a JSON snapshot file.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<StoreData>>,
    snapshot_path: Option<PathBuf>,
    snapshot_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the snapshot at `path` when it exists and keeps writing to it.
    pub async fn with_snapshot(path: PathBuf) -> anyhow::Result<Self> {
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreData>(&bytes)
                .with_context(|| format!("failed to decode store snapshot {}", path.display()))?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read store snapshot {}", path.display()))
            }
        };

        tracing::info!(
            path = %path.display(),
            users = data.users.len(),
            customers = data.infos.len(),
            events = data.events.len(),
            "loaded store snapshot"
        );

        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            snapshot_path: Some(path),
            snapshot_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    async fn persist(&self) -> StoreResult<()> {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return Ok(()),
        };

        let _guard = self.snapshot_lock.lock().await;
        let bytes = {
            let data = self.data.read();
            serde_json::to_vec(&*data).map_err(|error| StoreError::Snapshot(error.to_string()))?
        };

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(|error| StoreError::Snapshot(error.to_string()))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| StoreError::Snapshot(error.to_string()))
    }
}

fn newest_first<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> chrono::DateTime<chrono::Utc>,
{
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
    items
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn insert_user(&self, user: User) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            let taken = data
                .users
                .values()
                .any(|existing| existing.email.eq_ignore_ascii_case(&user.email));
            if taken {
                return Err(StoreError::EmailTaken);
            }
            data.users.insert(user.id, user);
        }
        self.persist().await
    }

    async fn get_user(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.data.read().users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = email.trim();
        Ok(self
            .data
            .read()
            .users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_user(&self, user: User) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            match data.users.get_mut(&user.id) {
                Some(existing) => *existing = user,
                None => return Err(StoreError::NotFound),
            }
        }
        self.persist().await
    }

    async fn get_info_for_user(&self, user_id: Uuid) -> StoreResult<Option<StripeInfo>> {
        Ok(self
            .data
            .read()
            .infos
            .values()
            .find(|info| info.user_id == user_id)
            .cloned())
    }

    async fn get_info_by_customer(&self, customer_id: &str) -> StoreResult<Option<StripeInfo>> {
        Ok(self
            .data
            .read()
            .infos
            .values()
            .find(|info| info.customer_id == customer_id)
            .cloned())
    }

    async fn save_info(&self, mut info: StripeInfo) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            if let Some(other) = data.infos.values().find(|other| {
                other.id != info.id
                    && (other.user_id == info.user_id || other.customer_id == info.customer_id)
            }) {
                return Err(StoreError::Conflict(format!(
                    "customer record {} already exists for this user or customer",
                    other.short_id()
                )));
            }
            info.modified_at = chrono::Utc::now();
            data.infos.insert(info.id, info);
        }
        self.persist().await
    }

    async fn delete_info(&self, info_id: Uuid) -> StoreResult<()> {
        let removed = self.data.write().infos.remove(&info_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    async fn list_infos(&self) -> StoreResult<Vec<StripeInfo>> {
        let infos = self.data.read().infos.values().cloned().collect();
        Ok(newest_first(infos, |info: &StripeInfo| info.created_at))
    }

    async fn insert_billing_event(&self, billing: BillingEvent) -> StoreResult<()> {
        self.data.write().billing_events.push(billing);
        self.persist().await
    }

    async fn get_billing_event(&self, billing_id: Uuid) -> StoreResult<Option<BillingEvent>> {
        Ok(self
            .data
            .read()
            .billing_events
            .iter()
            .find(|billing| billing.id == billing_id)
            .cloned())
    }

    async fn list_billing_events_for_user(&self, user_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        let events = self
            .data
            .read()
            .billing_events
            .iter()
            .filter(|billing| billing.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(events, |billing: &BillingEvent| billing.created_at))
    }

    async fn list_billing_events(&self) -> StoreResult<Vec<BillingEvent>> {
        let events = self.data.read().billing_events.clone();
        Ok(newest_first(events, |billing: &BillingEvent| billing.created_at))
    }

    async fn record_event(&self, record: StripeEventRecord) -> StoreResult<bool> {
        {
            let mut data = self.data.write();
            if let Some(event_id) = record.event_id.as_deref() {
                let seen = data
                    .events
                    .iter()
                    .any(|existing| existing.event_id.as_deref() == Some(event_id));
                if seen {
                    return Ok(false);
                }
            }
            data.events.push(record);
        }
        self.persist().await?;
        Ok(true)
    }

    async fn forget_event(&self, event_id: &str) -> StoreResult<()> {
        self.data
            .write()
            .events
            .retain(|record| record.event_id.as_deref() != Some(event_id));
        self.persist().await
    }

    async fn list_events(&self) -> StoreResult<Vec<StripeEventRecord>> {
        let events = self.data.read().events.clone();
        Ok(newest_first(events, |record: &StripeEventRecord| {
            record.created_at
        }))
    }

    async fn insert_acquisition(&self, acquisition: Acquisition) -> StoreResult<()> {
        {
            let mut data = self.data.write();
            if data
                .acquisitions
                .iter()
                .any(|existing| existing.user_id == acquisition.user_id)
            {
                return Err(StoreError::Conflict(
                    "acquisition already recorded for user".to_string(),
                ));
            }
            data.acquisitions.push(acquisition);
        }
        self.persist().await
    }

    async fn get_acquisition_for_user(&self, user_id: Uuid) -> StoreResult<Option<Acquisition>> {
        Ok(self
            .data
            .read()
            .acquisitions
            .iter()
            .find(|acquisition| acquisition.user_id == user_id)
            .cloned())
    }
}
