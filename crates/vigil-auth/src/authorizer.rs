//! Channel subscription rules.
//!
//! - `dashboard`, `alerts:global`: any authenticated principal
//! - `patient:<id>`: patient in the principal's institution and, for
//!   non-admin roles, assigned to the principal or unassigned
//! - `device:<id>`: device exists and is either unattached or attached to a
//!   patient passing the patient rule

use std::sync::Arc;

use vigil_core::{Channel, ChannelKind, Principal};

use crate::directory::{AccessDirectory, PatientRecord};
use crate::errors::AuthzError;

/// Decides whether a principal may subscribe to a channel.
#[derive(Clone)]
pub struct ChannelAuthorizer {
    directory: Arc<dyn AccessDirectory>,
    admin_roles: Vec<String>,
}

impl ChannelAuthorizer {
    /// Build an authorizer over `directory`.
    pub fn new(directory: Arc<dyn AccessDirectory>, admin_roles: Vec<String>) -> Self {
        Self {
            directory,
            admin_roles,
        }
    }

    /// `Ok(())` if `principal` may subscribe to `channel`.
    pub async fn authorize(&self, principal: &Principal, channel: &Channel) -> Result<(), AuthzError> {
        match channel.kind() {
            ChannelKind::Dashboard | ChannelKind::AlertsGlobal => Ok(()),
            ChannelKind::Patient(id) => {
                let record = self.directory.patient(*id).await?;
                match record {
                    Some(r) if self.may_view(principal, &r) => Ok(()),
                    _ => Err(AuthzError::PatientDenied),
                }
            }
            ChannelKind::Device(id) => {
                let Some(device) = self.directory.device(id).await? else {
                    return Err(AuthzError::DeviceDenied);
                };
                if device.patient_id.is_none() {
                    return Ok(());
                }
                match device.patient {
                    Some(r) if self.may_view(principal, &r) => Ok(()),
                    _ => Err(AuthzError::DeviceDenied),
                }
            }
        }
    }

    fn may_view(&self, principal: &Principal, patient: &PatientRecord) -> bool {
        if patient.institution_id != principal.institution_id {
            return false;
        }
        principal.is_admin(&self.admin_roles)
            || patient
                .assigned_staff_id
                .as_deref()
                .is_none_or(|staff| staff == principal.user_id)
    }
}

impl std::fmt::Debug for ChannelAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAuthorizer")
            .field("admin_roles", &self.admin_roles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DeviceRecord, MockAccessDirectory};
    use crate::errors::DirectoryError;
    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    fn admin_roles() -> Vec<String> {
        vec!["admin".into(), "administrator".into()]
    }

    fn patient(inst: &str, staff: Option<&str>) -> PatientRecord {
        PatientRecord {
            institution_id: inst.into(),
            assigned_staff_id: staff.map(Into::into),
        }
    }

    fn authorizer(mock: MockAccessDirectory) -> ChannelAuthorizer {
        ChannelAuthorizer::new(Arc::new(mock), admin_roles())
    }

    fn ch(name: &str) -> Channel {
        Channel::parse(name).unwrap()
    }

    #[tokio::test]
    async fn open_channels_need_no_lookup() {
        let auth = authorizer(MockAccessDirectory::new());
        let p = Principal::new("1", "1", "clinician");
        assert!(auth.authorize(&p, &ch("dashboard")).await.is_ok());
        assert!(auth.authorize(&p, &ch("alerts:global")).await.is_ok());
    }

    #[tokio::test]
    async fn assigned_staff_may_view_patient() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock
            .expect_patient()
            .with(eq(42))
            .returning(|_| Ok(Some(patient("1", Some("7")))));
        let auth = authorizer(mock);
        assert!(auth
            .authorize(&Principal::new("7", "1", "clinician"), &ch("patient:42"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unassigned_staff_denied_but_admin_allowed() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock
            .expect_patient()
            .returning(|_| Ok(Some(patient("1", Some("7")))));
        let auth = authorizer(mock);

        assert_matches!(
            auth.authorize(&Principal::new("8", "1", "clinician"), &ch("patient:42"))
                .await,
            Err(AuthzError::PatientDenied)
        );
        assert!(auth
            .authorize(&Principal::new("8", "1", "admin"), &ch("patient:42"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unassigned_patient_visible_to_institution() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock.expect_patient().returning(|_| Ok(Some(patient("1", None))));
        let auth = authorizer(mock);
        assert!(auth
            .authorize(&Principal::new("8", "1", "clinician"), &ch("patient:42"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn other_institution_denied_even_for_admin() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock.expect_patient().returning(|_| Ok(Some(patient("2", None))));
        let auth = authorizer(mock);
        assert_matches!(
            auth.authorize(&Principal::new("1", "1", "admin"), &ch("patient:42"))
                .await,
            Err(AuthzError::PatientDenied)
        );
    }

    #[tokio::test]
    async fn missing_patient_denied() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock.expect_patient().returning(|_| Ok(None));
        let auth = authorizer(mock);
        assert_matches!(
            auth.authorize(&Principal::new("1", "1", "admin"), &ch("patient:1"))
                .await,
            Err(AuthzError::PatientDenied)
        );
    }

    #[tokio::test]
    async fn device_rules() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock.expect_device().returning(|id| {
            Ok(match id {
                "free" => Some(DeviceRecord {
                    patient_id: None,
                    patient: None,
                }),
                "mine" => Some(DeviceRecord {
                    patient_id: Some(42),
                    patient: Some(patient("1", Some("7"))),
                }),
                "dangling" => Some(DeviceRecord {
                    patient_id: Some(99),
                    patient: None,
                }),
                _ => None,
            })
        });
        let auth = authorizer(mock);
        let me = Principal::new("7", "1", "clinician");
        let other = Principal::new("8", "1", "clinician");

        assert!(auth.authorize(&other, &ch("device:free")).await.is_ok());
        assert!(auth.authorize(&me, &ch("device:mine")).await.is_ok());
        assert_matches!(
            auth.authorize(&other, &ch("device:mine")).await,
            Err(AuthzError::DeviceDenied)
        );
        assert_matches!(
            auth.authorize(&me, &ch("device:dangling")).await,
            Err(AuthzError::DeviceDenied)
        );
        assert_matches!(
            auth.authorize(&me, &ch("device:unknown")).await,
            Err(AuthzError::DeviceDenied)
        );
    }

    #[tokio::test]
    async fn directory_failure_surfaces() {
        let mut mock = MockAccessDirectory::new();
        let _ = mock
            .expect_patient()
            .returning(|_| Err(DirectoryError::Lookup("db down".into())));
        let auth = authorizer(mock);
        assert_matches!(
            auth.authorize(&Principal::new("1", "1", "admin"), &ch("patient:1"))
                .await,
            Err(AuthzError::Directory(_))
        );
    }
}
