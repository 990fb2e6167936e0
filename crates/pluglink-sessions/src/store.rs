//! Persistence collaborators.
//!
//! The session layer never talks to a database directly; it works against
//! these async traits. In-memory implementations ship for tests and wiring.

use crate::model::{Appointment, AuditRecord, UsageSession};
use async_trait::async_trait;
use pluglink_devices::tracker::StatusSink;
use pluglink_devices::{DeviceHandle, DeviceStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Device records and status snapshots.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look up the command handle for a device.
    async fn device(&self, device_id: &str) -> anyhow::Result<Option<DeviceHandle>>;

    /// Durably record the latest status snapshot.
    async fn update_status(&self, device_id: &str, status: &DeviceStatus) -> anyhow::Result<()>;
}

/// Appointments and usage sessions.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn appointment(&self, appointment_id: &str) -> anyhow::Result<Option<Appointment>>;

    async fn create_session(&self, session: &UsageSession) -> anyhow::Result<()>;

    async fn update_session(&self, session: &UsageSession) -> anyhow::Result<()>;

    async fn session(&self, session_id: Uuid) -> anyhow::Result<Option<UsageSession>>;

    /// The non-terminal session for a device, if one exists. There is at
    /// most one.
    async fn active_session_for_device(
        &self,
        device_id: &str,
    ) -> anyhow::Result<Option<UsageSession>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// In-memory device store.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<String, DeviceHandle>>,
    statuses: Mutex<HashMap<String, DeviceStatus>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, handle: DeviceHandle) {
        self.devices
            .lock()
            .await
            .insert(handle.device_id.clone(), handle);
    }

    pub async fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.statuses.lock().await.get(device_id).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn device(&self, device_id: &str) -> anyhow::Result<Option<DeviceHandle>> {
        Ok(self.devices.lock().await.get(device_id).cloned())
    }

    async fn update_status(&self, device_id: &str, status: &DeviceStatus) -> anyhow::Result<()> {
        self.statuses
            .lock()
            .await
            .insert(device_id.to_string(), status.clone());
        Ok(())
    }
}

// The tracker's durable-write collaborator maps directly onto the device
// store's snapshot column.
#[async_trait]
impl StatusSink for MemoryDeviceStore {
    async fn persist_status(&self, device_id: &str, status: &DeviceStatus) -> anyhow::Result<()> {
        self.update_status(device_id, status).await
    }
}

/// In-memory appointment and session store.
#[derive(Default)]
pub struct MemoryUsageStore {
    appointments: Mutex<HashMap<String, Appointment>>,
    sessions: Mutex<HashMap<Uuid, UsageSession>>,
}

impl MemoryUsageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_appointment(&self, appointment: Appointment) {
        self.appointments
            .lock()
            .await
            .insert(appointment.id.clone(), appointment);
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn appointment(&self, appointment_id: &str) -> anyhow::Result<Option<Appointment>> {
        Ok(self.appointments.lock().await.get(appointment_id).cloned())
    }

    async fn create_session(&self, session: &UsageSession) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &UsageSession) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn session(&self, session_id: Uuid) -> anyhow::Result<Option<UsageSession>> {
        Ok(self.sessions.lock().await.get(&session_id).cloned())
    }

    async fn active_session_for_device(
        &self,
        device_id: &str,
    ) -> anyhow::Result<Option<UsageSession>> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .find(|s| s.device_id == device_id && !s.status.is_terminal())
            .cloned())
    }
}

/// In-memory audit trail.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
