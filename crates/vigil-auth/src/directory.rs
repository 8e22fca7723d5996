//! Patient and device ownership lookups.
//!
//! The authorizer asks two questions: who owns patient `N`, and which patient
//! (if any) wears device `D`. [`AccessDirectory`] is that oracle. The
//! persistence layer behind it is somebody else's problem; this crate ships
//! [`InMemoryDirectory`], seeded from a JSON snapshot or populated directly.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::DirectoryError;

/// Ownership facts about one patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    /// Institution the patient belongs to.
    pub institution_id: String,
    /// Staff member the patient is assigned to, if any.
    #[serde(default)]
    pub assigned_staff_id: Option<String>,
}

/// Ownership facts about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Patient the device is attached to.
    pub patient_id: Option<u32>,
    /// That patient's record, when it exists.
    pub patient: Option<PatientRecord>,
}

/// Ownership oracle consulted on every patient/device subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Look up a patient. `Ok(None)` means no such patient.
    async fn patient(&self, patient_id: u32) -> Result<Option<PatientRecord>, DirectoryError>;

    /// Look up a device. `Ok(None)` means no such device.
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError>;
}

/// On-disk snapshot format.
///
/// ```json
/// {
///   "patients": [{"id": 42, "institutionId": "1", "assignedStaffId": "7"}],
///   "devices": [{"deviceId": "ESP32-01", "patientId": 42}]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectorySnapshot {
    /// Patient rows.
    pub patients: Vec<PatientEntry>,
    /// Device rows.
    pub devices: Vec<DeviceEntry>,
}

/// One patient row in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientEntry {
    /// Patient id.
    pub id: u32,
    /// Ownership facts.
    #[serde(flatten)]
    pub record: PatientRecord,
}

/// One device row in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    /// Device id.
    pub device_id: String,
    /// Attached patient.
    #[serde(default)]
    pub patient_id: Option<u32>,
}

/// Directory held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    patients: RwLock<HashMap<u32, PatientRecord>>,
    devices: RwLock<HashMap<String, Option<u32>>>,
}

impl InMemoryDirectory {
    /// Empty directory: every patient/device lookup misses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parsed snapshot.
    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        let dir = Self::new();
        for entry in snapshot.patients {
            dir.upsert_patient(entry.id, entry.record);
        }
        for entry in snapshot.devices {
            dir.attach_device(&entry.device_id, entry.patient_id);
        }
        dir
    }

    /// Load a snapshot file.
    pub fn from_json_file(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: DirectorySnapshot = serde_json::from_str(&content)?;
        tracing::info!(
            ?path,
            patients = snapshot.patients.len(),
            devices = snapshot.devices.len(),
            "loaded access directory snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Insert or replace a patient.
    pub fn upsert_patient(&self, patient_id: u32, record: PatientRecord) {
        let _ = self.patients.write().insert(patient_id, record);
    }

    /// Register a device, optionally attached to a patient.
    pub fn attach_device(&self, device_id: &str, patient_id: Option<u32>) {
        let _ = self.devices.write().insert(device_id.to_owned(), patient_id);
    }

    /// Forget a device.
    pub fn remove_device(&self, device_id: &str) {
        let _ = self.devices.write().remove(device_id);
    }
}

#[async_trait]
impl AccessDirectory for InMemoryDirectory {
    async fn patient(&self, patient_id: u32) -> Result<Option<PatientRecord>, DirectoryError> {
        Ok(self.patients.read().get(&patient_id).cloned())
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError> {
        let Some(patient_id) = self.devices.read().get(device_id).copied() else {
            return Ok(None);
        };
        let patient = patient_id.and_then(|id| self.patients.read().get(&id).cloned());
        Ok(Some(DeviceRecord {
            patient_id,
            patient,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(inst: &str, staff: Option<&str>) -> PatientRecord {
        PatientRecord {
            institution_id: inst.into(),
            assigned_staff_id: staff.map(Into::into),
        }
    }

    #[tokio::test]
    async fn patient_lookup() {
        let dir = InMemoryDirectory::new();
        dir.upsert_patient(42, record("1", Some("7")));
        assert_eq!(dir.patient(42).await.unwrap(), Some(record("1", Some("7"))));
        assert_eq!(dir.patient(43).await.unwrap(), None);
    }

    #[tokio::test]
    async fn device_lookup_joins_patient() {
        let dir = InMemoryDirectory::new();
        dir.upsert_patient(42, record("1", None));
        dir.attach_device("ESP32-01", Some(42));
        dir.attach_device("ESP32-02", None);
        dir.attach_device("ESP32-03", Some(99));

        let d1 = dir.device("ESP32-01").await.unwrap().unwrap();
        assert_eq!(d1.patient, Some(record("1", None)));

        let d2 = dir.device("ESP32-02").await.unwrap().unwrap();
        assert_eq!(d2.patient_id, None);

        let d3 = dir.device("ESP32-03").await.unwrap().unwrap();
        assert_eq!(d3.patient_id, Some(99));
        assert!(d3.patient.is_none());

        assert!(dir.device("nope").await.unwrap().is_none());
        dir.remove_device("ESP32-01");
        assert!(dir.device("ESP32-01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn loads_snapshot_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("directory.json");
        std::fs::write(
            &path,
            r#"{
                "patients": [{"id": 42, "institutionId": "1", "assignedStaffId": "7"}],
                "devices": [{"deviceId": "ESP32-01", "patientId": 42}, {"deviceId": "spare"}]
            }"#,
        )
        .unwrap();

        let dir = InMemoryDirectory::from_json_file(&path).unwrap();
        assert_eq!(dir.patient(42).await.unwrap(), Some(record("1", Some("7"))));
        assert_eq!(dir.device("spare").await.unwrap().unwrap().patient_id, None);
    }

    #[test]
    fn bad_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("directory.json");
        std::fs::write(&path, "[").unwrap();
        assert!(matches!(
            InMemoryDirectory::from_json_file(&path),
            Err(DirectoryError::Json(_))
        ));
        assert!(matches!(
            InMemoryDirectory::from_json_file(&tmp.path().join("missing.json")),
            Err(DirectoryError::Io(_))
        ));
    }
}
