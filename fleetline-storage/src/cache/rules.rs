//! Static invalidation rules.
//!
//! Each entity type maps to the ordered list of key patterns that must be
//! invalidated when one of its rows changes. A child's rule always includes
//! every aggregate that denormalizes it (dashboard stats, tenant-wide lists).

use fleetline_core::{ChangeEvent, ChangeKind, EntityType, RecordId, TenantId};

use super::key::{self, family, KeyPattern};

/// What a single change requires the cache to forget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationPlan {
    /// Every tenant-scoped family. Used when downstream effects cannot be
    /// enumerated, e.g. after a delete.
    Organization,
    Equipment {
        equipment_id: RecordId,
    },
    WorkOrder {
        work_order_id: RecordId,
        equipment_id: Option<RecordId>,
    },
    Team {
        team_id: RecordId,
    },
    Members,
    Slots,
    Invitations,
    Nothing,
}

impl InvalidationPlan {
    /// Ordered patterns for this plan. May contain duplicates when a rule
    /// cascades into another one.
    pub fn patterns(&self, tenant: &TenantId) -> Vec<KeyPattern> {
        match self {
            InvalidationPlan::Organization => organization_patterns(tenant),
            InvalidationPlan::Equipment { equipment_id } => {
                equipment_patterns(tenant, equipment_id)
            }
            InvalidationPlan::WorkOrder {
                work_order_id,
                equipment_id,
            } => work_order_patterns(tenant, work_order_id, equipment_id.as_ref()),
            InvalidationPlan::Team { .. } => team_patterns(tenant),
            InvalidationPlan::Members => member_patterns(tenant),
            InvalidationPlan::Slots => slot_patterns(tenant),
            InvalidationPlan::Invitations => invitation_patterns(tenant),
            InvalidationPlan::Nothing => Vec::new(),
        }
    }
}

/// Routing table from a change event to its plan.
pub fn plan_for_event(event: &ChangeEvent) -> InvalidationPlan {
    match (event.entity, event.kind) {
        // References to a deleted equipment row are not enumerable.
        (EntityType::Equipment, ChangeKind::Delete) => InvalidationPlan::Organization,
        (EntityType::Equipment, _) => match event.record_id() {
            Some(equipment_id) => InvalidationPlan::Equipment { equipment_id },
            None => InvalidationPlan::Organization,
        },
        (EntityType::WorkOrder, _) => match event.record_id() {
            Some(work_order_id) => InvalidationPlan::WorkOrder {
                work_order_id,
                equipment_id: event.equipment_id(),
            },
            None => InvalidationPlan::Organization,
        },
        (EntityType::Team, _) => match event.record_id() {
            Some(team_id) => InvalidationPlan::Team { team_id },
            None => InvalidationPlan::Organization,
        },
        (EntityType::EquipmentNote, _) => match event.equipment_id() {
            Some(equipment_id) => InvalidationPlan::Equipment { equipment_id },
            None => InvalidationPlan::Nothing,
        },
        (EntityType::OrganizationMember, _) => InvalidationPlan::Members,
        (EntityType::OrganizationSlot, _) => InvalidationPlan::Slots,
        (EntityType::OrganizationInvitation, _) => InvalidationPlan::Invitations,
    }
}

/// One entry of a batched invalidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchOperation {
    pub entity: EntityType,
    pub id: RecordId,
    pub equipment_id: Option<RecordId>,
}

impl BatchOperation {
    pub fn new(entity: EntityType, id: impl Into<RecordId>) -> Self {
        Self {
            entity,
            id: id.into(),
            equipment_id: None,
        }
    }

    pub fn with_equipment(mut self, equipment_id: impl Into<RecordId>) -> Self {
        self.equipment_id = Some(equipment_id.into());
        self
    }

    pub fn plan(&self) -> InvalidationPlan {
        match self.entity {
            EntityType::Equipment => InvalidationPlan::Equipment {
                equipment_id: self.id.clone(),
            },
            EntityType::WorkOrder => InvalidationPlan::WorkOrder {
                work_order_id: self.id.clone(),
                equipment_id: self.equipment_id.clone(),
            },
            EntityType::Team => InvalidationPlan::Team {
                team_id: self.id.clone(),
            },
            EntityType::EquipmentNote => match &self.equipment_id {
                Some(equipment_id) => InvalidationPlan::Equipment {
                    equipment_id: equipment_id.clone(),
                },
                None => InvalidationPlan::Nothing,
            },
            EntityType::OrganizationMember => InvalidationPlan::Members,
            EntityType::OrganizationSlot => InvalidationPlan::Slots,
            EntityType::OrganizationInvitation => InvalidationPlan::Invitations,
        }
    }
}

fn tenant_pattern(family: &str, tenant: &TenantId) -> KeyPattern {
    KeyPattern::from(key::tenant_key(family, tenant))
}

pub fn organization_patterns(tenant: &TenantId) -> Vec<KeyPattern> {
    family::ORGANIZATION_WIDE
        .iter()
        .map(|family| tenant_pattern(family, tenant))
        .collect()
}

/// Equipment changes ripple into three read models without a shared prefix.
pub fn equipment_patterns(tenant: &TenantId, equipment: &RecordId) -> Vec<KeyPattern> {
    vec![
        tenant_pattern(family::EQUIPMENT, tenant),
        KeyPattern::from(key::equipment_work_orders(tenant, equipment)),
        KeyPattern::from(key::equipment_notes(tenant, equipment)),
        tenant_pattern(family::DASHBOARD, tenant),
    ]
}

pub fn work_order_patterns(
    tenant: &TenantId,
    work_order: &RecordId,
    equipment: Option<&RecordId>,
) -> Vec<KeyPattern> {
    let mut patterns = vec![
        tenant_pattern(family::WORK_ORDERS, tenant),
        KeyPattern::from(key::work_order_detail(tenant, work_order)),
        tenant_pattern(family::DASHBOARD, tenant),
    ];
    if let Some(equipment) = equipment {
        patterns.extend(equipment_patterns(tenant, equipment));
    }
    patterns
}

/// Team reassignment changes the assignee shown on work orders.
pub fn team_patterns(tenant: &TenantId) -> Vec<KeyPattern> {
    vec![
        tenant_pattern(family::TEAMS, tenant),
        tenant_pattern(family::WORK_ORDERS, tenant),
    ]
}

pub fn member_patterns(tenant: &TenantId) -> Vec<KeyPattern> {
    vec![
        tenant_pattern(family::MEMBERS, tenant),
        tenant_pattern(family::ADMINS, tenant),
        tenant_pattern(family::TEAMS, tenant),
    ]
}

pub fn slot_patterns(tenant: &TenantId) -> Vec<KeyPattern> {
    vec![
        tenant_pattern(family::SLOTS, tenant),
        tenant_pattern(family::SLOT_AVAILABILITY, tenant),
        tenant_pattern(family::SLOT_PURCHASES, tenant),
    ]
}

/// Accepting or cancelling an invitation changes seat availability.
pub fn invitation_patterns(tenant: &TenantId) -> Vec<KeyPattern> {
    let mut patterns = vec![tenant_pattern(family::INVITATIONS, tenant)];
    patterns.extend(slot_patterns(tenant));
    patterns
}
