//! Naming conventions for the fan-out topology.
//!
//! One durable queue exists per (subsystem, action) pair, bound to the shared exchange
//! under a routing key of the same shape:
//!
//! | subsystem    | action | routing key              | queue                    |
//! |--------------|--------|--------------------------|--------------------------|
//! | `crm`        | CREATE | `crm.user.create`        | `crm_user_create`        |
//! | `facturatie` | UPDATE | `facturatie.user.update` | `facturatie_user_update` |
//! | `kassa`      | DELETE | `kassa.user.delete`      | `kassa_user_delete`      |

use crate::event::Action;

/// Exchange all lifecycle events are published to unless configured otherwise.
pub const DEFAULT_EXCHANGE: &str = "user";

/// Downstream subsystems that mirror users by default.
pub const DEFAULT_SUBSYSTEMS: [&str; 3] = ["crm", "facturatie", "kassa"];

/// One routing target: a subsystem's queue for one action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Logical subsystem name (`crm`, `kassa`, ...).
    pub subsystem: String,
    /// Durable queue the subsystem consumes.
    pub queue: String,
    /// Routing key the queue is bound under.
    pub routing_key: String,
}

impl Destination {
    /// Conventional destination for `subsystem` and `action`.
    #[must_use]
    pub fn for_subsystem(subsystem: &str, action: Action) -> Self {
        let segment = action.routing_segment();
        Self {
            subsystem: subsystem.to_string(),
            queue: format!("{subsystem}_user_{segment}"),
            routing_key: format!("{subsystem}.user.{segment}"),
        }
    }
}

/// The set of destinations an event fans out to, in publish order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destinations(Vec<Destination>);

impl Destinations {
    /// Explicit destination list.
    #[must_use]
    pub const fn new(destinations: Vec<Destination>) -> Self {
        Self(destinations)
    }

    /// Conventional destinations of `action` for every subsystem in `subsystems`.
    #[must_use]
    pub fn for_action<S: AsRef<str>>(action: Action, subsystems: &[S]) -> Self {
        Self(
            subsystems
                .iter()
                .map(|s| Destination::for_subsystem(s.as_ref(), action))
                .collect(),
        )
    }

    /// Iterate destinations in publish order.
    pub fn iter(&self) -> std::slice::Iter<'_, Destination> {
        self.0.iter()
    }

    /// Queue names of all destinations.
    #[must_use]
    pub fn queues(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.queue.as_str()).collect()
    }

    /// Number of destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there is nothing to publish to.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Destinations {
    type Item = &'a Destination;
    type IntoIter = std::slice::Iter<'a, Destination>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_follow_naming_convention() {
        let destinations = Destinations::for_action(Action::Update, &DEFAULT_SUBSYSTEMS);

        assert_eq!(destinations.len(), 3);
        assert_eq!(
            destinations.queues(),
            vec!["crm_user_update", "facturatie_user_update", "kassa_user_update"]
        );
        let kassa = destinations.iter().last().map(|d| d.routing_key.as_str());
        assert_eq!(kassa, Some("kassa.user.update"));
    }
}
