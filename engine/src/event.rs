//! Domain events, subscription filters and the delivery dedup log.
//!
//! Every committed write becomes a [`DomainEvent`]. The same event can reach
//! a device twice: once dispatched locally when the write is committed, and
//! again when the remote change feed echoes it back. Both copies carry the
//! same id (the id of the mutation that produced them), and the
//! [`DedupLog`] lets only the first one through.

use crate::{EntityId, EntityType, EventId, MutationOp};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Who an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    All,
    Admins,
    Teachers,
    Parents,
    Watchers,
    Supervisors,
}

/// Where an event entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Committed by this device.
    Local,
    /// Pushed by the remote change feed.
    Remote,
}

/// A change to a domain record, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Idempotency key.
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EntityType,
    pub change: MutationOp,
    pub entity_id: EntityId,
    pub target_audience: Audience,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<EntityId>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

impl DomainEvent {
    /// Build the event for a write.
    ///
    /// Audience and target come from the payload: notifications carry
    /// `targetAudience`/`targetId`; student-scoped records (attendance,
    /// exits, violations) target their `studentId` and go to everyone.
    pub fn for_write(
        id: impl Into<EventId>,
        kind: EntityType,
        change: MutationOp,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        origin: Origin,
    ) -> Self {
        let target_audience = payload
            .get("targetAudience")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(Audience::All);
        let target_id = payload
            .get("targetId")
            .or_else(|| payload.get("studentId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Self {
            id: id.into(),
            kind,
            change,
            entity_id: entity_id.into(),
            target_audience,
            target_id,
            payload,
            created_at,
            origin,
        }
    }
}

/// Which events a subscription wants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Event types to accept; empty accepts all.
    #[serde(default)]
    pub kinds: Vec<EntityType>,
    /// The subscriber's audience. `None` accepts every audience.
    #[serde(default)]
    pub audience: Option<Audience>,
    /// The subscriber's target (e.g. a parent's child). `None` accepts
    /// every target.
    #[serde(default)]
    pub target_id: Option<EntityId>,
}

impl EventFilter {
    /// Accept everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EntityType) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn audience(mut self, audience: Audience) -> Self {
        self.audience = Some(audience);
        self
    }

    pub fn target(mut self, target_id: impl Into<EntityId>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Whether `event` should be delivered under this filter.
    ///
    /// Events addressed to [`Audience::All`] reach every audience, and events
    /// without a target reach every target.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let audience_ok = match self.audience {
            None => true,
            Some(a) => event.target_audience == Audience::All || event.target_audience == a,
        };
        let target_ok = match (&self.target_id, &event.target_id) {
            (None, _) | (_, None) => true,
            (Some(want), Some(got)) => want == got,
        };
        kind_ok && audience_ok && target_ok
    }
}

/// Outcome of offering an event id to the dedup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; deliver it. `evicted` lists ids that fell out of the
    /// retention window and can be dropped from durable storage.
    Fresh { evicted: Vec<EventId> },
    /// Already delivered.
    Duplicate,
}

/// Remembers delivered event ids.
///
/// Ids are retained for `retention` after first sighting and at most
/// `capacity` ids are kept; an echo arriving later than that would be
/// delivered again, so the window must comfortably exceed the remote round
/// trip.
#[derive(Debug, Clone)]
pub struct DedupLog {
    seen: HashSet<EventId>,
    order: VecDeque<(DateTime<Utc>, EventId)>,
    retention: Duration,
    capacity: usize,
}

impl DedupLog {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            retention,
            capacity: capacity.max(1),
        }
    }

    /// Seed the log from durable storage.
    pub fn restore(
        entries: impl IntoIterator<Item = (DateTime<Utc>, EventId)>,
        retention: Duration,
        capacity: usize,
    ) -> Self {
        let mut log = Self::new(retention, capacity);
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort();
        for (at, id) in entries {
            if log.seen.insert(id.clone()) {
                log.order.push_back((at, id));
            }
        }
        log
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record `id` as delivered at `now`.
    pub fn admit(&mut self, id: &str, now: DateTime<Utc>) -> Admission {
        if self.seen.contains(id) {
            return Admission::Duplicate;
        }
        self.seen.insert(id.to_string());
        self.order.push_back((now, id.to_string()));

        let mut evicted = Vec::new();
        let horizon = now - self.retention;
        while let Some((at, _)) = self.order.front() {
            if *at >= horizon && self.order.len() <= self.capacity {
                break;
            }
            if let Some((_, old)) = self.order.pop_front() {
                self.seen.remove(&old);
                evicted.push(old);
            }
        }

        Admission::Fresh { evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap()
    }

    fn notification(audience: &str, target: Option<&str>) -> DomainEvent {
        let mut payload = json!({"id": "N1", "targetAudience": audience, "title": "hi"});
        if let Some(t) = target {
            payload["targetId"] = json!(t);
        }
        DomainEvent::for_write(
            "e1",
            EntityType::Notification,
            MutationOp::Create,
            "N1",
            payload,
            now(),
            Origin::Local,
        )
    }

    #[test]
    fn audience_and_target_come_from_payload() {
        let event = notification("parents", Some("S1"));
        assert_eq!(event.target_audience, Audience::Parents);
        assert_eq!(event.target_id.as_deref(), Some("S1"));

        let attendance = DomainEvent::for_write(
            "e2",
            EntityType::Attendance,
            MutationOp::Create,
            "S1:2024-07-15",
            json!({"studentId": "S1"}),
            now(),
            Origin::Remote,
        );
        assert_eq!(attendance.target_audience, Audience::All);
        assert_eq!(attendance.target_id.as_deref(), Some("S1"));
    }

    #[test]
    fn filter_by_kind() {
        let event = notification("all", None);
        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::all()
            .kind(EntityType::Notification)
            .matches(&event));
        assert!(!EventFilter::all().kind(EntityType::Attendance).matches(&event));
    }

    #[test]
    fn filter_by_audience() {
        let parents = EventFilter::all().audience(Audience::Parents);
        assert!(parents.matches(&notification("parents", None)));
        assert!(parents.matches(&notification("all", None)));
        assert!(!parents.matches(&notification("teachers", None)));
    }

    #[test]
    fn filter_by_target() {
        let parent_of_s1 = EventFilter::all().audience(Audience::Parents).target("S1");
        assert!(parent_of_s1.matches(&notification("parents", Some("S1"))));
        assert!(parent_of_s1.matches(&notification("parents", None)));
        assert!(!parent_of_s1.matches(&notification("parents", Some("S2"))));
    }

    #[test]
    fn event_serialization() {
        let event = notification("watchers", None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["targetAudience"], "watchers");
        assert_eq!(json["origin"], "local");
        assert!(json.get("targetId").is_none());
    }

    #[test]
    fn dedup_suppresses_second_sighting() {
        let mut log = DedupLog::new(Duration::hours(1), 100);
        assert_eq!(
            log.admit("e1", now()),
            Admission::Fresh { evicted: vec![] }
        );
        assert_eq!(log.admit("e1", now()), Admission::Duplicate);
        assert!(log.contains("e1"));
    }

    #[test]
    fn dedup_evicts_by_age() {
        let mut log = DedupLog::new(Duration::minutes(10), 100);
        log.admit("old", now());
        let later = now() + Duration::minutes(11);
        assert_eq!(
            log.admit("new", later),
            Admission::Fresh {
                evicted: vec!["old".to_string()]
            }
        );
        assert!(!log.contains("old"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn dedup_evicts_by_capacity() {
        let mut log = DedupLog::new(Duration::hours(1), 2);
        log.admit("a", now());
        log.admit("b", now());
        let outcome = log.admit("c", now());
        assert_eq!(
            outcome,
            Admission::Fresh {
                evicted: vec!["a".to_string()]
            }
        );
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn dedup_restore() {
        let log = DedupLog::restore(
            vec![(now(), "b".to_string()), (now(), "a".to_string())],
            Duration::hours(1),
            10,
        );
        assert!(log.contains("a"));
        assert!(log.contains("b"));
        assert_eq!(log.len(), 2);
    }
}
