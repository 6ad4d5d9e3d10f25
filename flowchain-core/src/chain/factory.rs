//! Expansion of a composite trigger into an ordered event queue

use crate::error::ChainError;
use crate::models::{ChainLink, ChainRecord, ChainStatus, Event, ResourceId};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

/// Ordered events produced from one composite trigger
#[derive(Debug, Clone)]
pub struct EventChain {
    pub chain_id: Uuid,
    pub name: String,
    /// Selector of the composite trigger
    pub trigger: String,
    pub resource_id: ResourceId,
    pub links: Vec<ChainLink>,
}

impl EventChain {
    /// Build a chain for `trigger`. The trigger's accept handle moves onto the
    /// first link; every other link goes without one.
    pub fn new(name: impl Into<String>, trigger: &Event, links: Vec<ChainLink>) -> Self {
        let mut links: Vec<ChainLink> = links
            .into_iter()
            .map(|link| ChainLink {
                event: link.event.without_accepted(),
                best_effort: link.best_effort,
            })
            .collect();

        if let (Some(first), Some(handle)) = (links.first_mut(), trigger.accepted()) {
            first.event = first.event.clone().with_accepted(handle.clone());
        }

        Self {
            chain_id: Uuid::new_v4(),
            name: name.into(),
            trigger: trigger.selector().to_string(),
            resource_id: trigger.resource_id(),
            links,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn selectors(&self) -> Vec<&str> {
        self.links.iter().map(|link| link.event.selector()).collect()
    }

    /// Durable progress record for a chain that has not drained anything yet
    pub fn record(&self) -> ChainRecord {
        let now = Utc::now();
        ChainRecord {
            chain_id: self.chain_id,
            name: self.name.clone(),
            trigger_selector: self.trigger.clone(),
            resource_id: self.resource_id,
            links: self
                .links
                .iter()
                .map(|link| ChainLink {
                    event: link.event.without_accepted().in_chain(self.chain_id),
                    best_effort: link.best_effort,
                })
                .collect(),
            next_index: 0,
            status: ChainStatus::Running,
            flows: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One implementation per composite operation
///
/// Everything the chain needs is resolved up front: a factory either returns
/// the complete queue or fails before anything is dispatched.
#[async_trait]
pub trait EventChainFactory: Send + Sync {
    /// Selector of the composite trigger this factory expands
    fn init_event(&self) -> &'static str;

    fn name(&self) -> &'static str;

    async fn create_event_chain(&self, trigger: &Event) -> Result<EventChain, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::AcceptHandle;
    use crate::models::Payload;

    #[test]
    fn test_accept_handle_moves_to_first_link_only() {
        let (handle, _rx) = AcceptHandle::new();
        let trigger = Event::new("TRIGGER", 3, Payload::Empty).with_accepted(handle.clone());
        let links = vec![
            ChainLink::new(Event::new("A", 3, Payload::Empty).with_accepted(handle.clone())),
            ChainLink::new(Event::new("B", 3, Payload::Empty)),
            ChainLink::best_effort(Event::new("C", 3, Payload::Empty)),
        ];

        let chain = EventChain::new("test", &trigger, links);

        assert_eq!(chain.selectors(), vec!["A", "B", "C"]);
        assert_eq!(chain.links[0].event.accepted(), Some(&handle));
        assert!(chain.links[1..].iter().all(|link| link.event.accepted().is_none()));
        assert!(chain.links[2].best_effort);
    }

    #[test]
    fn test_record_stamps_chain_id() {
        let trigger = Event::new("TRIGGER", 3, Payload::Empty);
        let chain = EventChain::new("test", &trigger, vec![ChainLink::new(Event::new("A", 3, Payload::Empty))]);

        let record = chain.record();

        assert_eq!(record.next_index, 0);
        assert_eq!(record.status, ChainStatus::Running);
        assert_eq!(record.links[0].event.chain_id(), Some(chain.chain_id));
        assert_eq!(record.trigger_selector, "TRIGGER");
    }
}
