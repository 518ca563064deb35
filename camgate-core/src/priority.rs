use std::cmp::Ordering;

use crate::types::{ClientDescriptor, Priority};

/// Outcome of comparing two priorities from the first one's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOrdering {
    Higher,
    Lower,
    Equal,
}

/// Pure functions defining who wins a device and who collides with whom.
pub struct PriorityModel;

impl PriorityModel {
    /// Total order over priorities. `Greater` means `a` wins over `b`.
    ///
    /// Higher score wins; on a tie the lower (more foreground) state wins.
    pub fn ordering(a: Priority, b: Priority) -> Ordering {
        a.score
            .cmp(&b.score)
            .then_with(|| b.state.cmp(&a.state))
    }

    /// Equal priorities are left for the caller to break by insertion order.
    pub fn compare(a: Priority, b: Priority) -> PriorityOrdering {
        match Self::ordering(a, b) {
            Ordering::Greater => PriorityOrdering::Higher,
            Ordering::Less => PriorityOrdering::Lower,
            Ordering::Equal => PriorityOrdering::Equal,
        }
    }

    /// Two clients collide if they target the same device or either lists
    /// the other's device in its conflict set.
    pub fn conflicts(a: &ClientDescriptor, b: &ClientDescriptor) -> bool {
        a.device_id() == b.device_id()
            || a.is_conflicting(b.device_id())
            || b.is_conflicting(a.device_id())
    }
}
