//! Colony entity model.
//!
//! Thirteen record types share a [`Base`] (identifier and timestamps). The
//! closed [`EntityRecord`] enum wraps any of them so stores, changes and rules
//! can handle records uniformly, while the [`Entity`] trait gives typed access.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Free-form JSON attributes attached to several record types.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// Discriminant for every record type the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Organism,
    Cohort,
    HousingUnit,
    Facility,
    BreedingUnit,
    Procedure,
    Treatment,
    Observation,
    Sample,
    Protocol,
    Permit,
    Project,
    SupplyItem,
}

impl EntityType {
    pub const ALL: [EntityType; 13] = [
        EntityType::Organism,
        EntityType::Cohort,
        EntityType::HousingUnit,
        EntityType::Facility,
        EntityType::BreedingUnit,
        EntityType::Procedure,
        EntityType::Treatment,
        EntityType::Observation,
        EntityType::Sample,
        EntityType::Protocol,
        EntityType::Permit,
        EntityType::Project,
        EntityType::SupplyItem,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organism => "organism",
            Self::Cohort => "cohort",
            Self::HousingUnit => "housing_unit",
            Self::Facility => "facility",
            Self::BreedingUnit => "breeding_unit",
            Self::Procedure => "procedure",
            Self::Treatment => "treatment",
            Self::Observation => "observation",
            Self::Sample => "sample",
            Self::Protocol => "protocol",
            Self::Permit => "permit",
            Self::Project => "project",
            Self::SupplyItem => "supply_item",
        }
    }

    /// Collection name used by the on-disk backends.
    pub fn bucket(self) -> &'static str {
        match self {
            Self::Organism => "organisms",
            Self::Cohort => "cohorts",
            Self::HousingUnit => "housing_units",
            Self::Facility => "facilities",
            Self::BreedingUnit => "breeding_units",
            Self::Procedure => "procedures",
            Self::Treatment => "treatments",
            Self::Observation => "observations",
            Self::Sample => "samples",
            Self::Protocol => "protocols",
            Self::Permit => "permits",
            Self::Project => "projects",
            Self::SupplyItem => "supply_items",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Status vocabularies
// ---------------------------------------------------------------------------

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident (default $default:ident) {
            $($variant:ident => $text:literal),+ $(,)?
        }
        terminal: $($terminal:ident)|+
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Terminal states admit no further transitions.
            pub fn is_terminal(self) -> bool {
                matches!(self, $(Self::$terminal)|+)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum! {
    /// Organism life stage.
    LifecycleStage (default Planned) {
        Planned => "planned",
        Larva => "larva",
        Juvenile => "juvenile",
        Adult => "adult",
        Retired => "retired",
        Deceased => "deceased",
    }
    terminal: Retired | Deceased
}

status_enum! {
    HousingState (default Active) {
        Quarantine => "quarantine",
        Active => "active",
        Cleaning => "cleaning",
        Decommissioned => "decommissioned",
    }
    terminal: Decommissioned
}

status_enum! {
    ProcedureStatus (default Scheduled) {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
        Failed => "failed",
    }
    terminal: Completed | Cancelled | Failed
}

status_enum! {
    TreatmentStatus (default Planned) {
        Planned => "planned",
        InProgress => "in_progress",
        Completed => "completed",
        Flagged => "flagged",
    }
    terminal: Completed | Flagged
}

status_enum! {
    ProtocolStatus (default Draft) {
        Draft => "draft",
        Submitted => "submitted",
        Approved => "approved",
        OnHold => "on_hold",
        Expired => "expired",
        Archived => "archived",
    }
    terminal: Expired | Archived
}

status_enum! {
    PermitStatus (default Draft) {
        Draft => "draft",
        Submitted => "submitted",
        Approved => "approved",
        OnHold => "on_hold",
        Expired => "expired",
        Archived => "archived",
    }
    terminal: Expired | Archived
}

status_enum! {
    SampleStatus (default Stored) {
        Stored => "stored",
        InTransit => "in_transit",
        Consumed => "consumed",
        Disposed => "disposed",
    }
    terminal: Consumed | Disposed
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Fields shared by every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Base {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Organism {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub species: String,
    pub line: String,
    pub line_id: Option<String>,
    pub strain_id: Option<String>,
    pub parent_ids: Vec<String>,
    pub stage: LifecycleStage,
    pub cohort_id: Option<String>,
    pub housing_id: Option<String>,
    pub protocol_id: Option<String>,
    pub project_id: Option<String>,
    pub attributes: Attributes,
}

impl Organism {
    pub fn new(name: impl Into<String>, species: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            species: species.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cohort {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub purpose: String,
    pub project_id: Option<String>,
    pub housing_id: Option<String>,
    pub protocol_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousingUnit {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub facility_id: Option<String>,
    /// Signed so that misconfigured units (zero or negative) are representable.
    pub capacity: i64,
    pub environment: String,
    pub state: HousingState,
}

impl HousingUnit {
    pub fn new(name: impl Into<String>, facility_id: impl Into<String>, capacity: i64) -> Self {
        Self {
            name: name.into(),
            facility_id: Some(facility_id.into()),
            capacity,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Facility {
    #[serde(flatten)]
    pub base: Base,
    pub code: String,
    pub name: String,
    pub zone: String,
    pub access_policy: String,
    pub environment_baselines: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreedingUnit {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub strategy: String,
    pub housing_id: Option<String>,
    pub protocol_id: Option<String>,
    pub line_id: Option<String>,
    pub strain_id: Option<String>,
    pub female_ids: Vec<String>,
    pub male_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Procedure {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub status: ProcedureStatus,
    pub scheduled_at: DateTime<Utc>,
    pub protocol_id: Option<String>,
    pub project_id: Option<String>,
    pub cohort_id: Option<String>,
    pub organism_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Treatment {
    #[serde(flatten)]
    pub base: Base,
    pub name: String,
    pub status: TreatmentStatus,
    pub procedure_id: Option<String>,
    pub organism_ids: Vec<String>,
    pub cohort_ids: Vec<String>,
    pub dosage_plan: String,
    pub administration_log: Vec<String>,
    pub adverse_events: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    #[serde(flatten)]
    pub base: Base,
    pub procedure_id: Option<String>,
    pub organism_id: Option<String>,
    pub cohort_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub observer: String,
    pub data: Attributes,
    pub notes: Option<String>,
}

/// One hand-off in a sample's chain of custody.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleCustodyEvent {
    pub actor: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    #[serde(flatten)]
    pub base: Base,
    pub identifier: String,
    pub source_type: String,
    pub organism_id: Option<String>,
    pub cohort_id: Option<String>,
    pub facility_id: Option<String>,
    pub collected_at: DateTime<Utc>,
    pub status: SampleStatus,
    pub storage_location: String,
    pub assay_type: String,
    pub chain_of_custody: Vec<SampleCustodyEvent>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Protocol {
    #[serde(flatten)]
    pub base: Base,
    pub code: String,
    pub title: String,
    pub description: String,
    /// Zero or negative means the protocol is uncapped.
    pub max_subjects: i64,
    pub status: ProtocolStatus,
}

impl Protocol {
    pub fn new(code: impl Into<String>, max_subjects: i64) -> Self {
        Self {
            code: code.into(),
            max_subjects,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permit {
    #[serde(flatten)]
    pub base: Base,
    pub permit_number: String,
    pub authority: String,
    pub status: PermitStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub allowed_activities: Vec<String>,
    pub facility_ids: Vec<String>,
    pub protocol_ids: Vec<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    #[serde(flatten)]
    pub base: Base,
    pub code: String,
    pub title: String,
    pub description: String,
    pub facility_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyItem {
    #[serde(flatten)]
    pub base: Base,
    pub sku: String,
    pub name: String,
    pub description: String,
    pub quantity_on_hand: i64,
    pub unit: String,
    pub lot_number: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub facility_ids: Vec<String>,
    pub project_ids: Vec<String>,
    pub reorder_level: i64,
    pub attributes: Attributes,
}

// ---------------------------------------------------------------------------
// Entity trait and the closed record enum
// ---------------------------------------------------------------------------

/// Typed access to one record type.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityType;

    fn base(&self) -> &Base;
    fn base_mut(&mut self) -> &mut Base;

    fn into_record(self) -> EntityRecord;
    fn from_record(record: EntityRecord) -> Option<Self>;
    fn from_record_ref(record: &EntityRecord) -> Option<&Self>;
    fn from_record_mut(record: &mut EntityRecord) -> Option<&mut Self>;

    fn id(&self) -> &str {
        &self.base().id
    }
}

/// Any colony record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum EntityRecord {
    Organism(Organism),
    Cohort(Cohort),
    HousingUnit(HousingUnit),
    Facility(Facility),
    BreedingUnit(BreedingUnit),
    Procedure(Procedure),
    Treatment(Treatment),
    Observation(Observation),
    Sample(Sample),
    Protocol(Protocol),
    Permit(Permit),
    Project(Project),
    SupplyItem(SupplyItem),
}

macro_rules! impl_entity {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: EntityType = EntityType::$ty;

                fn base(&self) -> &Base {
                    &self.base
                }

                fn base_mut(&mut self) -> &mut Base {
                    &mut self.base
                }

                fn into_record(self) -> EntityRecord {
                    EntityRecord::$ty(self)
                }

                fn from_record(record: EntityRecord) -> Option<Self> {
                    match record {
                        EntityRecord::$ty(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_record_ref(record: &EntityRecord) -> Option<&Self> {
                    match record {
                        EntityRecord::$ty(inner) => Some(inner),
                        _ => None,
                    }
                }

                fn from_record_mut(record: &mut EntityRecord) -> Option<&mut Self> {
                    match record {
                        EntityRecord::$ty(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for EntityRecord {
                fn from(value: $ty) -> Self {
                    EntityRecord::$ty(value)
                }
            }
        )+

        impl EntityRecord {
            pub fn kind(&self) -> EntityType {
                match self {
                    $(EntityRecord::$ty(_) => EntityType::$ty),+
                }
            }

            pub fn base(&self) -> &Base {
                match self {
                    $(EntityRecord::$ty(inner) => &inner.base),+
                }
            }

            pub fn base_mut(&mut self) -> &mut Base {
                match self {
                    $(EntityRecord::$ty(inner) => &mut inner.base),+
                }
            }
        }
    };
}

impl_entity!(
    Organism,
    Cohort,
    HousingUnit,
    Facility,
    BreedingUnit,
    Procedure,
    Treatment,
    Observation,
    Sample,
    Protocol,
    Permit,
    Project,
    SupplyItem,
);

/// Current lifecycle position of a stateful record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleMark {
    pub value: &'static str,
    pub terminal: bool,
}

impl EntityRecord {
    pub fn id(&self) -> &str {
        &self.base().id
    }

    /// Typed borrow of the wrapped record.
    pub fn as_entity<E: Entity>(&self) -> Option<&E> {
        E::from_record_ref(self)
    }

    /// References the store itself enforces: each must name an existing record.
    ///
    /// Relationships checked by rules (housing, protocol, parents, breeding
    /// members) are not included.
    pub fn hard_references(&self) -> Vec<(EntityType, &str)> {
        let mut refs = Vec::new();
        match self {
            EntityRecord::HousingUnit(unit) => {
                push_ref(&mut refs, EntityType::Facility, &unit.facility_id)
            }
            EntityRecord::Sample(sample) => {
                push_ref(&mut refs, EntityType::Facility, &sample.facility_id);
                push_ref(&mut refs, EntityType::Organism, &sample.organism_id);
                push_ref(&mut refs, EntityType::Cohort, &sample.cohort_id);
            }
            EntityRecord::Treatment(treatment) => {
                push_ref(&mut refs, EntityType::Procedure, &treatment.procedure_id);
                push_refs(&mut refs, EntityType::Organism, &treatment.organism_ids);
                push_refs(&mut refs, EntityType::Cohort, &treatment.cohort_ids);
            }
            EntityRecord::Observation(obs) => {
                push_ref(&mut refs, EntityType::Procedure, &obs.procedure_id);
                push_ref(&mut refs, EntityType::Organism, &obs.organism_id);
                push_ref(&mut refs, EntityType::Cohort, &obs.cohort_id);
            }
            _ => {}
        }
        refs
    }

    /// Fields a record cannot be stored without.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            EntityRecord::HousingUnit(unit) if !is_set(&unit.facility_id) => {
                Err("housing unit requires a facility")
            }
            EntityRecord::Sample(sample) if !is_set(&sample.facility_id) => {
                Err("sample requires a facility")
            }
            EntityRecord::Sample(sample)
                if !is_set(&sample.organism_id) && !is_set(&sample.cohort_id) =>
            {
                Err("sample requires an organism or cohort")
            }
            EntityRecord::Treatment(treatment) if !is_set(&treatment.procedure_id) => {
                Err("treatment requires a procedure")
            }
            EntityRecord::Observation(obs)
                if !is_set(&obs.procedure_id)
                    && !is_set(&obs.organism_id)
                    && !is_set(&obs.cohort_id) =>
            {
                Err("observation requires a procedure, organism or cohort")
            }
            _ => Ok(()),
        }
    }

    /// Lifecycle state for record types that have one.
    pub fn lifecycle(&self) -> Option<LifecycleMark> {
        let (value, terminal) = match self {
            EntityRecord::Organism(o) => (o.stage.as_str(), o.stage.is_terminal()),
            EntityRecord::HousingUnit(h) => (h.state.as_str(), h.state.is_terminal()),
            EntityRecord::Procedure(p) => (p.status.as_str(), p.status.is_terminal()),
            EntityRecord::Treatment(t) => (t.status.as_str(), t.status.is_terminal()),
            EntityRecord::Protocol(p) => (p.status.as_str(), p.status.is_terminal()),
            EntityRecord::Permit(p) => (p.status.as_str(), p.status.is_terminal()),
            EntityRecord::Sample(s) => (s.status.as_str(), s.status.is_terminal()),
            _ => return None,
        };
        Some(LifecycleMark { value, terminal })
    }
}

fn is_set(id: &Option<String>) -> bool {
    id.as_deref().is_some_and(|id| !id.is_empty())
}

fn push_refs<'a>(refs: &mut Vec<(EntityType, &'a str)>, kind: EntityType, ids: &'a [String]) {
    refs.extend(ids.iter().filter(|id| !id.is_empty()).map(|id| (kind, id.as_str())));
}

fn push_ref<'a>(refs: &mut Vec<(EntityType, &'a str)>, kind: EntityType, id: &'a Option<String>) {
    if let Some(id) = id.as_deref().filter(|id| !id.is_empty()) {
        refs.push((kind, id));
    }
}
