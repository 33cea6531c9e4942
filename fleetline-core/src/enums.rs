//! Enum types for Fleetline change events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity type discriminator for the tables that publish change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Equipment,
    WorkOrder,
    Team,
    EquipmentNote,
    OrganizationMember,
    OrganizationSlot,
    OrganizationInvitation,
}

impl EntityType {
    /// All entity types, in the order their topics are registered on a channel.
    pub const ALL: [EntityType; 7] = [
        EntityType::Equipment,
        EntityType::WorkOrder,
        EntityType::Team,
        EntityType::EquipmentNote,
        EntityType::OrganizationMember,
        EntityType::OrganizationSlot,
        EntityType::OrganizationInvitation,
    ];

    /// Name of the backing database table.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::Equipment => "equipment",
            EntityType::WorkOrder => "work_orders",
            EntityType::Team => "teams",
            EntityType::EquipmentNote => "equipment_notes",
            EntityType::OrganizationMember => "organization_members",
            EntityType::OrganizationSlot => "organization_slots",
            EntityType::OrganizationInvitation => "organization_invitations",
        }
    }

    /// Resolve an entity type from its table name.
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.table_name() == table)
    }

    /// Whether rows of this table carry an `organization_id` column that a
    /// realtime filter can use.
    pub fn is_tenant_filtered(&self) -> bool {
        !matches!(self, EntityType::EquipmentNote)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            EntityType::Equipment => "Equipment",
            EntityType::WorkOrder => "WorkOrder",
            EntityType::Team => "Team",
            EntityType::EquipmentNote => "EquipmentNote",
            EntityType::OrganizationMember => "OrganizationMember",
            EntityType::OrganizationSlot => "OrganizationSlot",
            EntityType::OrganizationInvitation => "OrganizationInvitation",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_token(s);
        match normalized.as_str() {
            "equipment" => Ok(EntityType::Equipment),
            "workorder" | "workorders" => Ok(EntityType::WorkOrder),
            "team" | "teams" => Ok(EntityType::Team),
            "equipmentnote" | "equipmentnotes" => Ok(EntityType::EquipmentNote),
            "organizationmember" | "organizationmembers" => Ok(EntityType::OrganizationMember),
            "organizationslot" | "organizationslots" => Ok(EntityType::OrganizationSlot),
            "organizationinvitation" | "organizationinvitations" => {
                Ok(EntityType::OrganizationInvitation)
            }
            _ => Err(format!("Invalid EntityType: {}", s)),
        }
    }
}

/// Kind of row change delivered by the realtime feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            _ => Err(format!("Invalid ChangeKind: {}", s)),
        }
    }
}

fn normalize_token(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
