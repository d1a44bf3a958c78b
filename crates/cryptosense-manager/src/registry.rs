//! Pending sensor registrations.
//!
//! An operator pre-issues a single-use registration key bound to a sensor
//! name, IP and profile. The key moves `pending → used` when a sensor
//! redeems it, or `pending → expired` once its lifetime passes (checked
//! lazily on access). Entries and admin settings share one lock.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use cryptosense_core::wire::{
    AdminSettings, CreatePendingRequest, PendingRegistration, PendingStatus, RegistrationRequest,
};

use crate::error::RegistrationError;

pub const KEY_EXPIRATION_RANGE: (i64, i64) = (5, 1440);
pub const MAX_PENDING_RANGE: (usize, usize) = (1, 1000);

struct Inner {
    entries: HashMap<String, PendingRegistration>,
    settings: AdminSettings,
}

pub struct PendingRegistry {
    tenant_id: String,
    inner: Mutex<Inner>,
}

impl PendingRegistry {
    pub fn new(tenant_id: impl Into<String>, settings: AdminSettings) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                settings,
            }),
        }
    }

    /// Issue a new key bound to the requested name, IP and profile.
    pub fn create(
        &self,
        request: CreatePendingRequest,
    ) -> Result<PendingRegistration, RegistrationError> {
        self.create_at(request, Utc::now())
    }

    fn create_at(
        &self,
        request: CreatePendingRequest,
        now: DateTime<Utc>,
    ) -> Result<PendingRegistration, RegistrationError> {
        let ip = parse_ip(&request.ip_address)?;

        let mut inner = self.inner.lock();
        expire(&mut inner.entries, now);

        let max = inner.settings.max_pending_sensors;
        let pending = inner
            .entries
            .values()
            .filter(|p| p.status == PendingStatus::Pending)
            .count();
        if pending >= max {
            return Err(RegistrationError::CapacityReached(max));
        }

        let mut key = registration_key(&self.tenant_id, now);
        while inner.entries.contains_key(&key) {
            key = registration_key(&self.tenant_id, now);
        }

        let entry = PendingRegistration {
            id: Uuid::new_v4().to_string(),
            registration_key: key.clone(),
            name: request.name,
            bound_ip: ip.to_string(),
            profile: request.profile,
            network_interfaces: request.network_interfaces,
            tags: request.tags,
            created_at: now,
            expires_at: now + Duration::minutes(inner.settings.key_expiration_minutes),
            status: PendingStatus::Pending,
        };
        inner.entries.insert(key, entry.clone());

        tracing::info!(
            registration_key = %entry.registration_key,
            name = %entry.name,
            bound_ip = %entry.bound_ip,
            expires_at = %entry.expires_at,
            "Pending registration created"
        );
        Ok(entry)
    }

    /// All entries, oldest first, with expiry applied.
    pub fn list(&self) -> Vec<PendingRegistration> {
        let mut inner = self.inner.lock();
        expire(&mut inner.entries, Utc::now());
        let mut out: Vec<_> = inner.entries.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get(&self, key: &str) -> Option<PendingRegistration> {
        let mut inner = self.inner.lock();
        expire(&mut inner.entries, Utc::now());
        inner.entries.get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> Result<PendingRegistration, RegistrationError> {
        let removed = self
            .inner
            .lock()
            .entries
            .remove(key)
            .ok_or(RegistrationError::UnknownKey)?;
        tracing::info!(registration_key = %key, "Pending registration deleted");
        Ok(removed)
    }

    pub fn settings(&self) -> AdminSettings {
        self.inner.lock().settings.clone()
    }

    /// Replace the admin settings. Existing keys keep their expiry.
    pub fn update_settings(
        &self,
        settings: AdminSettings,
    ) -> Result<AdminSettings, RegistrationError> {
        validate_settings(&settings)?;
        self.inner.lock().settings = settings.clone();
        tracing::info!(
            key_expiration_minutes = settings.key_expiration_minutes,
            max_pending_sensors = settings.max_pending_sensors,
            require_ip_validation = settings.require_ip_validation,
            "Admin settings updated"
        );
        Ok(settings)
    }

    /// Validate a registration and run `issue` for it. The key is marked
    /// used only when `issue` succeeds, so a failed issuance can be retried
    /// with the same key.
    ///
    /// Checks run in order: IP format, key lookup, expiry, prior use,
    /// declared IP against the bound IP, then the transport IP against the
    /// declared one. Both IP checks are skipped when IP validation is off.
    pub fn redeem<T, E, F>(
        &self,
        request: &RegistrationRequest,
        transport_ip: Option<IpAddr>,
        issue: F,
    ) -> Result<T, E>
    where
        E: From<RegistrationError>,
        F: FnOnce(&PendingRegistration) -> Result<T, E>,
    {
        self.redeem_at(request, transport_ip, Utc::now(), issue)
    }

    fn redeem_at<T, E, F>(
        &self,
        request: &RegistrationRequest,
        transport_ip: Option<IpAddr>,
        now: DateTime<Utc>,
        issue: F,
    ) -> Result<T, E>
    where
        E: From<RegistrationError>,
        F: FnOnce(&PendingRegistration) -> Result<T, E>,
    {
        let declared = parse_ip(&request.ip_address)?;

        let mut inner = self.inner.lock();
        let require_ip = inner.settings.require_ip_validation;
        let entry = inner
            .entries
            .get_mut(&request.registration_key)
            .ok_or(RegistrationError::UnknownKey)?;

        if entry.status == PendingStatus::Pending && now > entry.expires_at {
            entry.status = PendingStatus::Expired;
        }
        match entry.status {
            PendingStatus::Expired => return Err(RegistrationError::KeyExpired.into()),
            PendingStatus::Used => return Err(RegistrationError::KeyUsed.into()),
            PendingStatus::Pending => {}
        }

        if require_ip {
            if entry.bound_ip != declared.to_string() {
                return Err(RegistrationError::IpMismatch {
                    declared: declared.to_string(),
                }
                .into());
            }
            if let Some(actual) = transport_ip.map(|ip| ip.to_canonical()) {
                if actual != declared {
                    return Err(RegistrationError::ClientIpMismatch {
                        declared: declared.to_string(),
                        actual: actual.to_string(),
                    }
                    .into());
                }
            }
        }

        let issued = issue(&*entry)?;
        entry.status = PendingStatus::Used;
        tracing::info!(
            registration_key = %entry.registration_key,
            name = %request.name,
            "Registration key redeemed"
        );
        Ok(issued)
    }
}

fn parse_ip(raw: &str) -> Result<IpAddr, RegistrationError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_canonical())
        .map_err(|_| RegistrationError::InvalidIp(raw.to_string()))
}

/// `REG-<tenant>-<YYYYMMDD>-<6 hex>`.
fn registration_key(tenant_id: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4();
    format!(
        "REG-{}-{}-{}",
        tenant_id,
        now.format("%Y%m%d"),
        hex::encode_upper(&random.as_bytes()[..3])
    )
}

fn expire(entries: &mut HashMap<String, PendingRegistration>, now: DateTime<Utc>) {
    for entry in entries.values_mut() {
        if entry.status == PendingStatus::Pending && now > entry.expires_at {
            entry.status = PendingStatus::Expired;
            tracing::debug!(registration_key = %entry.registration_key, "Registration key expired");
        }
    }
}

pub fn validate_settings(settings: &AdminSettings) -> Result<(), RegistrationError> {
    let (min_exp, max_exp) = KEY_EXPIRATION_RANGE;
    if !(min_exp..=max_exp).contains(&settings.key_expiration_minutes) {
        return Err(RegistrationError::InvalidSettings(format!(
            "key_expiration_minutes must be between {min_exp} and {max_exp}"
        )));
    }
    let (min_pending, max_pending) = MAX_PENDING_RANGE;
    if !(min_pending..=max_pending).contains(&settings.max_pending_sensors) {
        return Err(RegistrationError::InvalidSettings(format!(
            "max_pending_sensors must be between {min_pending} and {max_pending}"
        )));
    }
    Ok(())
}
