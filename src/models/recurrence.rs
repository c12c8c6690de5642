//! Grouping record for separately bookable allocations created together.

use uuid::Uuid;

use crate::models::RecurrenceId;

/// Links the allocations of one ungrouped multi-date `allocate` call so they
/// can be cleaned up as a unit once all members are gone.
#[derive(Debug, Clone, PartialEq)]
pub struct Recurrence {
    pub id: RecurrenceId,
    pub resource: Uuid,
    /// The recurrence rule the dates were generated from, if any.
    pub rrule: Option<String>,
}

impl Recurrence {
    pub fn new(resource: Uuid, rrule: Option<String>) -> Self {
        Recurrence { id: RecurrenceId::new(), resource, rrule }
    }
}
