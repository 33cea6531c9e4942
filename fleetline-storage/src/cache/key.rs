//! Tuple-typed cache keys and the patterns used to select them.
//!
//! A [`CacheKey`] is an ordered list of string segments. Every key built by
//! this crate puts the query family first and the tenant second, so a
//! tenant-wide selection is the pattern `[*, tenant]`.
//!
//! Matching is structural: a [`KeyPattern`] matches a key when each of its
//! segments matches the key segment at the same position. Segments are never
//! concatenated, so `["work-orders", "org-1"]` does not match a key whose
//! segments merely contain that text.

use fleetline_core::{RecordId, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Query family (first segment), if any.
    pub fn family(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Extend this key with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// True if `prefix` equals the leading segments of this key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// One position of a [`KeyPattern`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Exact(String),
    Any,
}

impl Segment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Segment::Exact(expected) => expected == segment,
            Segment::Any => true,
        }
    }
}

/// Partial tuple selecting every key it is a prefix of.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPattern(Vec<Segment>);

impl KeyPattern {
    /// Pattern of exact segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            segments
                .into_iter()
                .map(|s| Segment::Exact(s.into()))
                .collect(),
        )
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Every key of every family belonging to `tenant`.
    pub fn tenant(tenant: &TenantId) -> Self {
        Self(vec![Segment::Any, Segment::Exact(tenant.to_string())])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        key.len() >= self.0.len()
            && self
                .0
                .iter()
                .zip(key.segments())
                .all(|(pattern, segment)| pattern.matches(segment))
    }
}

impl From<CacheKey> for KeyPattern {
    fn from(key: CacheKey) -> Self {
        Self(key.0.into_iter().map(Segment::Exact).collect())
    }
}

impl From<&CacheKey> for KeyPattern {
    fn from(key: &CacheKey) -> Self {
        Self::from(key.clone())
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .0
            .iter()
            .map(|s| match s {
                Segment::Exact(value) => value.as_str(),
                Segment::Any => "*",
            })
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Query family names. These are the first segment of every key.
pub mod family {
    pub const TEAMS: &str = "teams";
    pub const WORK_ORDERS: &str = "work-orders-enhanced";
    pub const WORK_ORDER: &str = "work-order";
    pub const EQUIPMENT: &str = "equipment-optimized";
    pub const EQUIPMENT_WORK_ORDERS: &str = "equipment-work-orders";
    pub const EQUIPMENT_NOTES: &str = "equipment-notes";
    pub const DASHBOARD: &str = "dashboard-stats";
    pub const NOTES: &str = "notes";
    pub const SCANS: &str = "scans";
    pub const MEMBERS: &str = "organization-members";
    pub const ADMINS: &str = "organization-admins";
    pub const SLOTS: &str = "organization-slots";
    pub const SLOT_AVAILABILITY: &str = "slot-availability";
    pub const SLOT_PURCHASES: &str = "slot-purchases";
    pub const INVITATIONS: &str = "organization-invitations";

    /// Families cleared by an organization-wide invalidation.
    pub const ORGANIZATION_WIDE: [&str; 12] = [
        TEAMS,
        WORK_ORDERS,
        EQUIPMENT,
        DASHBOARD,
        NOTES,
        SCANS,
        MEMBERS,
        ADMINS,
        SLOTS,
        SLOT_AVAILABILITY,
        SLOT_PURCHASES,
        INVITATIONS,
    ];
}

/// Key for a tenant-scoped family list.
pub fn tenant_key(family: &str, tenant: &TenantId) -> CacheKey {
    CacheKey::new([family, tenant.as_str()])
}

/// Key for a record inside a tenant-scoped family.
pub fn record_key(family: &str, tenant: &TenantId, record: &RecordId) -> CacheKey {
    CacheKey::new([family, tenant.as_str(), record.as_str()])
}

pub fn equipment_list(tenant: &TenantId) -> CacheKey {
    tenant_key(family::EQUIPMENT, tenant)
}

pub fn equipment_detail(tenant: &TenantId, equipment: &RecordId) -> CacheKey {
    record_key(family::EQUIPMENT, tenant, equipment)
}

pub fn equipment_work_orders(tenant: &TenantId, equipment: &RecordId) -> CacheKey {
    record_key(family::EQUIPMENT_WORK_ORDERS, tenant, equipment)
}

pub fn equipment_notes(tenant: &TenantId, equipment: &RecordId) -> CacheKey {
    record_key(family::EQUIPMENT_NOTES, tenant, equipment)
}

pub fn work_order_list(tenant: &TenantId) -> CacheKey {
    tenant_key(family::WORK_ORDERS, tenant)
}

pub fn work_order_detail(tenant: &TenantId, work_order: &RecordId) -> CacheKey {
    record_key(family::WORK_ORDER, tenant, work_order)
}

pub fn team_list(tenant: &TenantId) -> CacheKey {
    tenant_key(family::TEAMS, tenant)
}

pub fn dashboard(tenant: &TenantId) -> CacheKey {
    tenant_key(family::DASHBOARD, tenant)
}
