//! Appointment-gated device usage.
//!
//! This crate sits on top of the device layer: it validates that a plug may
//! be powered for a booked service, opens a usage session when it is,
//! reconciles live status samples into active minutes and energy, and
//! raises compliance alerts when actual usage exceeds the estimate. A
//! tenant-scoped gateway fans device status out to UI subscribers.

pub mod control;
pub mod error;
pub mod gateway;
pub mod model;
pub mod reconcile;
pub mod store;

pub use control::{DeviceControlService, PlugCommands};
pub use error::{SessionError, SessionResult, ValidationError};
pub use gateway::{BroadcastGateway, StaticTenantResolver, TenantResolver, UiEvent};
pub use model::{
    AlertSeverity, Appointment, AppointmentService, AppointmentStatus, AuditRecord, ServiceStatus,
    SessionStatus, UsageSession,
};
pub use reconcile::UsageReconciler;
pub use store::{
    AuditLog, DeviceStore, MemoryAuditLog, MemoryDeviceStore, MemoryUsageStore, UsageStore,
};
