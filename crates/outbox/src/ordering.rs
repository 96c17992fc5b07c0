//! Per-connection dispatch planning: gating, supersession and priority order.

use chrono::{DateTime, Utc};

use regsync_core::MessageId;

use crate::message::{MessageStatus, OutboxMessage};

/// What the dispatcher should do with a connection's open messages right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchPlan {
    /// Queued updates made moot by a later removal: `(update, removal)`.
    pub superseded: Vec<(MessageId, MessageId)>,
    /// Ready messages free to send, in dispatch order.
    pub dispatchable: Vec<MessageId>,
    /// Ready messages waiting on an earlier message for the same entity.
    pub blocked: Vec<MessageId>,
}

/// Plan dispatch over every non-terminal message of one connection.
///
/// A message is blocked while an earlier-enqueued open message touches any of
/// the same entities (target, parent employee, or bundled payload section).
/// Superseded updates are resolved first and never block anything.
pub fn plan(open: &[OutboxMessage], now: DateTime<Utc>) -> DispatchPlan {
    let mut messages: Vec<&OutboxMessage> =
        open.iter().filter(|m| !m.status.is_terminal()).collect();
    messages.sort_by_key(|m| m.sequence);

    let mut out = DispatchPlan::default();

    for m in &messages {
        if m.status != MessageStatus::Queued || !m.kind.is_update() {
            continue;
        }
        if let Some(removal) = messages
            .iter()
            .find(|n| n.sequence > m.sequence && n.kind.is_removal() && n.entity == m.entity)
        {
            out.superseded.push((m.id, removal.id));
        }
    }

    let live: Vec<&OutboxMessage> = messages
        .into_iter()
        .filter(|m| !out.superseded.iter().any(|(id, _)| *id == m.id))
        .collect();

    let mut ready: Vec<&OutboxMessage> = Vec::new();
    for (idx, m) in live.iter().enumerate() {
        if !m.is_ready(now) {
            continue;
        }
        let affected = m.affected_entities();
        let gated = live[..idx]
            .iter()
            .any(|earlier| affected.iter().any(|e| earlier.touches(e)));
        if gated {
            out.blocked.push(m.id);
        } else {
            ready.push(*m);
        }
    }

    ready.sort_by_key(|m| (m.priority, m.scheduled_at, m.sequence));
    out.dispatchable = ready.into_iter().map(|m| m.id).collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageKind, Mutation};
    use crate::retry::RetryPolicy;
    use proptest::prelude::*;
    use regsync_core::{ConnectionId, ContractId, EmployeeId, TenantId};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Queue {
        tenant: TenantId,
        connection: ConnectionId,
        messages: Vec<OutboxMessage>,
        next_seq: i64,
    }

    impl Queue {
        fn new() -> Self {
            Self {
                tenant: TenantId::new(),
                connection: ConnectionId::new(),
                messages: Vec::new(),
                next_seq: 1,
            }
        }

        fn push(&mut self, mutation: Mutation, now: DateTime<Utc>) -> MessageId {
            let mut m =
                OutboxMessage::from_mutation(self.tenant, self.connection, mutation, 10, now).unwrap();
            m.sequence = self.next_seq;
            self.next_seq += 1;
            let id = m.id;
            self.messages.push(m);
            id
        }

        fn get_mut(&mut self, id: MessageId) -> &mut OutboxMessage {
            self.messages.iter_mut().find(|m| m.id == id).unwrap()
        }
    }

    #[test]
    fn priority_orders_independent_entities() {
        let now = Utc::now();
        let mut q = Queue::new();
        let create = q.push(Mutation::employee(MessageKind::EmployeeCreate, EmployeeId::new(), json!({})), now);
        let update = q.push(Mutation::employee(MessageKind::EmployeeUpdate, EmployeeId::new(), json!({})), now);
        let delete = q.push(Mutation::employee(MessageKind::EmployeeDelete, EmployeeId::new(), json!({})), now);

        let plan = plan(&q.messages, now);
        assert_eq!(plan.dispatchable, vec![delete, update, create]);
    }

    #[test]
    fn same_entity_waits_for_earlier_message() {
        let now = Utc::now();
        let mut q = Queue::new();
        let emp = EmployeeId::new();
        let create = q.push(Mutation::employee(MessageKind::EmployeeCreate, emp, json!({})), now);
        let contract = q.push(
            Mutation::contract(MessageKind::ContractCreate, ContractId::new(), emp, json!({})),
            now,
        );

        let p = plan(&q.messages, now);
        assert_eq!(p.dispatchable, vec![create]);
        assert_eq!(p.blocked, vec![contract]);

        // A failed predecessor releases its dependents.
        let m = q.get_mut(create);
        m.begin_send(now).unwrap();
        m.mark_rejected("bad", now).unwrap();
        assert_eq!(plan(&q.messages, now).dispatchable, vec![contract]);
    }

    #[test]
    fn backed_off_message_still_gates_later_ones() {
        let now = Utc::now();
        let mut q = Queue::new();
        let emp = EmployeeId::new();
        let first = q.push(Mutation::employee(MessageKind::EmployeeUpdate, emp, json!({"v": 1})), now);
        let second = q.push(Mutation::employee(MessageKind::EmployeeUpdate, emp, json!({"v": 2})), now);

        let m = q.get_mut(first);
        m.begin_send(now).unwrap();
        m.fail_transient("503", &RetryPolicy::fixed(10, Duration::from_secs(60)), now).unwrap();

        let p = plan(&q.messages, now);
        assert!(p.dispatchable.is_empty());
        assert_eq!(p.blocked, vec![second]);
    }

    #[test]
    fn later_delete_supersedes_queued_update() {
        let now = Utc::now();
        let mut q = Queue::new();
        let emp = EmployeeId::new();
        let update = q.push(Mutation::employee(MessageKind::EmployeeUpdate, emp, json!({})), now);
        let delete = q.push(Mutation::employee(MessageKind::EmployeeDelete, emp, json!({})), now);

        let p = plan(&q.messages, now);
        assert_eq!(p.superseded, vec![(update, delete)]);
        assert_eq!(p.dispatchable, vec![delete]);
    }

    #[test]
    fn update_already_sending_is_not_superseded() {
        let now = Utc::now();
        let mut q = Queue::new();
        let emp = EmployeeId::new();
        let update = q.push(Mutation::employee(MessageKind::EmployeeUpdate, emp, json!({})), now);
        let delete = q.push(Mutation::employee(MessageKind::EmployeeDelete, emp, json!({})), now);
        q.get_mut(update).begin_send(now).unwrap();

        let p = plan(&q.messages, now);
        assert!(p.superseded.is_empty());
        assert_eq!(p.blocked, vec![delete]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enqueue { entity: usize, kind: MessageKind },
        Deliver { fail: bool },
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3, prop_oneof![
                Just(MessageKind::EmployeeCreate),
                Just(MessageKind::EmployeeUpdate),
                Just(MessageKind::EmployeeDelete),
            ])
                .prop_map(|(entity, kind)| Step::Enqueue { entity, kind }),
            any::<bool>().prop_map(|fail| Step::Deliver { fail }),
        ]
    }

    proptest! {
        #[test]
        fn per_entity_delivery_follows_enqueue_order(steps in prop::collection::vec(step(), 1..60)) {
            let now = Utc::now();
            let policy = RetryPolicy::fixed(10, Duration::ZERO);
            let entities: Vec<EmployeeId> = (0..3).map(|_| EmployeeId::new()).collect();
            let mut q = Queue::new();
            let mut delivered: HashMap<EmployeeId, Vec<i64>> = HashMap::new();

            let mut run = |q: &mut Queue, fail: bool| {
                let p = plan(&q.messages, now);
                for (update, by) in p.superseded {
                    q.get_mut(update).mark_superseded(by, now).unwrap();
                }
                let Some(&head) = p.dispatchable.first() else { return };
                let m = q.get_mut(head);
                m.begin_send(now).unwrap();
                if fail {
                    m.fail_transient("503", &policy, now).unwrap();
                } else {
                    m.mark_sent(None, None, now).unwrap();
                    m.mark_accepted(now).unwrap();
                    let emp = m.entity.employee_id().unwrap();
                    delivered.entry(emp).or_default().push(m.sequence);
                }
            };

            for s in steps {
                match s {
                    Step::Enqueue { entity, kind } => {
                        q.push(Mutation::employee(kind, entities[entity], json!({})), now);
                    }
                    Step::Deliver { fail } => run(&mut q, fail),
                }
            }
            for _ in 0..200 {
                run(&mut q, false);
            }

            for seqs in delivered.values() {
                let mut sorted = seqs.clone();
                sorted.sort();
                prop_assert_eq!(seqs, &sorted);
            }
            prop_assert!(q.messages.iter().all(|m| m.status.is_terminal()));
        }
    }
}
