//! Reactive loop scenarios: chaining, lineage, dead-letters, schedules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;

use ontic_bus::{CronExpr, Schedule};
use ontic_core::config::EngineConfig;
use ontic_core::descriptor::TypeDescriptor;
use ontic_core::error::EngineError;
use ontic_core::event::{DEAD_LETTER_EVENT_TYPE, EventDraft, EventType};
use ontic_core::intent::EntityType;
use ontic_core::spec::TypeSpec;
use ontic_session::{HandlerContext, Session, SessionHandler, SessionOptions};
use ontic_storage::Repository;

#[derive(Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
}

impl EventType for OrderPlaced {
    const NAME: &'static str = "order.placed";
}

#[derive(Serialize, Deserialize)]
struct PaymentCompleted {
    order_id: String,
}

impl EventType for PaymentCompleted {
    const NAME: &'static str = "payment.completed";
}

#[derive(Serialize, Deserialize)]
struct OrderFulfilled {
    order_id: String,
}

impl EventType for OrderFulfilled {
    const NAME: &'static str = "order.fulfilled";
}

#[derive(Clone, Serialize, Deserialize)]
struct OrderRow {
    id: String,
    state: String,
}

impl EntityType for OrderRow {
    const NAME: &'static str = "OrderRow";

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::entity("OrderRow")
            .primary_key("id")
            .field("state", TypeSpec::str())
            .build()
            .expect("static descriptor")
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

fn bus_config() -> EngineConfig {
    EngineConfig {
        event_poll_interval_ms: 1,
        ..EngineConfig::default()
    }
}

fn session_with(uri: &str, config: EngineConfig) -> Session {
    Session::new(
        uri,
        SessionOptions {
            entity_types: vec![OrderRow::descriptor()],
            config,
            ..SessionOptions::default()
        },
    )
    .unwrap()
}

fn backend_uris(tag: &str) -> Vec<String> {
    vec![
        "sqlite://:memory:".to_string(),
        format!("mem://bus-tests-{tag}/store"),
    ]
}

#[test]
fn handlers_chain_events_with_lineage() {
    for uri in backend_uris("chain") {
        let session = session_with(&uri, bus_config());
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();

        let fulfilled: Arc<Mutex<Vec<(String, u32, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fulfilled);

        let handlers = vec![
            // A: consumes order.placed, commits state and emits payment.
            SessionHandler::new("handle-order", OrderPlaced::NAME, 10, |ctx: &mut HandlerContext| {
                let order: OrderPlaced = ctx.decode()?;
                ctx.ensure_entity(&OrderRow {
                    id: order.order_id.clone(),
                    state: "paid".into(),
                })?;
                ctx.emit(EventDraft::new(&PaymentCompleted {
                    order_id: order.order_id,
                })?)?;
                ctx.commit(None)?;
                Ok(())
            }),
            // B: consumes payment.completed, emits fulfilment (promoted
            // by the loop on success, no explicit commit).
            SessionHandler::new("handle-payment", PaymentCompleted::NAME, 5, |ctx: &mut HandlerContext| {
                let payment: PaymentCompleted = ctx.decode()?;
                ctx.emit(EventDraft::new(&OrderFulfilled {
                    order_id: payment.order_id,
                })?)?;
                Ok(())
            }),
            // C: records the tail of the chain.
            SessionHandler::new("observe", OrderFulfilled::NAME, 0, move |ctx: &mut HandlerContext| {
                let event = ctx.event().clone();
                sink.lock().unwrap().push((
                    event.root_event_id.clone(),
                    event.chain_depth,
                    event.payload["order_id"].as_str().unwrap_or_default().to_string(),
                ));
                Ok(())
            }),
        ];

        let report = session.run(handlers, Vec::new(), Some(60)).unwrap();
        assert!(report.events_handled >= 3, "{uri}: {report:?}");
        assert_eq!(report.events_failed, 0, "{uri}");

        let recorded = fulfilled.lock().unwrap();
        assert_eq!(recorded.len(), 1, "{uri}");
        let (root, depth, order_id) = &recorded[0];
        assert_eq!(order_id, "o1", "{uri}");
        // Root lineage flows through the whole chain.
        assert_eq!(*depth, 2, "{uri}");
        assert!(!root.is_empty(), "{uri}");

        // The committed state change landed too.
        let query = session.query().unwrap();
        let row = query
            .entities::<OrderRow>()
            .unwrap()
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(row.state, "paid", "{uri}");
    }
}

#[test]
fn chain_depth_cap_rejects_at_emit() {
    for uri in backend_uris("depth") {
        let config = EngineConfig {
            max_event_chain_depth: 1,
            ..bus_config()
        };
        let session = session_with(&uri, config);
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let handlers = vec![
            SessionHandler::new("emit-payment", OrderPlaced::NAME, 10, |ctx: &mut HandlerContext| {
                let order: OrderPlaced = ctx.decode()?;
                // depth 1: allowed.
                ctx.emit(EventDraft::new(&PaymentCompleted {
                    order_id: order.order_id,
                })?)?;
                Ok(())
            }),
            SessionHandler::new("emit-fulfilled", PaymentCompleted::NAME, 5, move |ctx: &mut HandlerContext| {
                let payment: PaymentCompleted = ctx.decode()?;
                // depth 2 would exceed the cap of 1.
                let err = ctx
                    .emit(EventDraft::new(&OrderFulfilled {
                        order_id: payment.order_id,
                    })?)
                    .unwrap_err();
                sink.lock().unwrap().push(err.to_string());
                Ok(())
            }),
        ];

        session.run(handlers, Vec::new(), Some(60)).unwrap();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1, "{uri}");
        assert!(errors[0].contains("chain depth"), "{uri}: {}", errors[0]);
    }
}

#[test]
fn failing_handler_dead_letters_with_lineage() {
    for uri in backend_uris("deadletter") {
        let config = EngineConfig {
            event_max_attempts: 1,
            ..bus_config()
        };
        let session = session_with(&uri, config);
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();

        let audits: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&audits);

        let handlers = vec![
            SessionHandler::new("always-fails", OrderPlaced::NAME, 10, |_ctx: &mut HandlerContext| {
                Err(EngineError::validation("intentional failure"))
            }),
            // The synthetic audit event is consumable like any other.
            SessionHandler::new("audit", DEAD_LETTER_EVENT_TYPE, 0, move |ctx: &mut HandlerContext| {
                let event = ctx.event().clone();
                sink.lock()
                    .unwrap()
                    .push((event.root_event_id.clone(), event.chain_depth));
                Ok(())
            }),
        ];

        let report = session.run(handlers, Vec::new(), Some(60)).unwrap();
        assert_eq!(report.events_failed, 1, "{uri}");

        let dead = session.repo().list_dead_letters(session.namespace()).unwrap();
        assert_eq!(dead.len(), 1, "{uri}");
        assert_eq!(dead[0].event_type, OrderPlaced::NAME, "{uri}");
        assert_eq!(dead[0].attempts, 1, "{uri}");
        assert_eq!(
            dead[0].last_error.as_deref(),
            Some("validation error: intentional failure"),
            "{uri}"
        );

        // Synthetic event preserves the failed event's lineage.
        let audits = audits.lock().unwrap();
        assert_eq!(audits.len(), 1, "{uri}");
        assert_eq!(audits[0].0, dead[0].root_event_id, "{uri}");
        assert_eq!(audits[0].1, dead[0].chain_depth + 1, "{uri}");
    }
}

#[test]
fn released_claims_are_retried_after_backoff() {
    for uri in backend_uris("retry") {
        let config = EngineConfig {
            event_backoff_base_ms: 1,
            event_poll_interval_ms: 5,
            ..EngineConfig::default()
        };
        let session = session_with(&uri, config);
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let handlers = vec![SessionHandler::new(
            "flaky",
            OrderPlaced::NAME,
            0,
            move |_ctx: &mut HandlerContext| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EngineError::validation("first attempt fails"))
                } else {
                    Ok(())
                }
            },
        )];

        let report = session.run(handlers, Vec::new(), Some(400)).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "{uri}");
        assert_eq!(report.events_handled, 1, "{uri}");
        assert_eq!(report.events_failed, 1, "{uri}");
    }
}

#[test]
fn event_only_commit_enqueues_without_commit_row() {
    for uri in backend_uris("eventonly") {
        let session = session_with(&uri, bus_config());
        let cid = session
            .commit(Some(
                EventDraft::new(&OrderPlaced {
                    order_id: "o1".into(),
                })
                .unwrap(),
            ))
            .unwrap();
        assert_eq!(cid, None, "{uri}");
        assert_eq!(session.repo().head().unwrap().commit_id, 0, "{uri}");

        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let handlers = vec![SessionHandler::new(
            "observe",
            OrderPlaced::NAME,
            0,
            move |_ctx: &mut HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1, "{uri}");
    }
}

#[test]
fn replay_produces_a_fresh_root_event() {
    for uri in backend_uris("replay") {
        let session = session_with(&uri, bus_config());
        session
            .enqueue(
                EventDraft::raw(OrderPlaced::NAME, json!({ "order_id": "o1" }))
                    .with_priority(7),
            )
            .unwrap();

        // Capture the original event id through a handler.
        let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        let handlers = vec![SessionHandler::new(
            "capture",
            OrderPlaced::NAME,
            0,
            move |ctx: &mut HandlerContext| {
                *sink.lock().unwrap() = Some(ctx.event().id.clone());
                Ok(())
            },
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();
        let original_id = captured.lock().unwrap().clone().unwrap();

        let replayed = session.repo().replay_event(&original_id).unwrap();
        let original = session.repo().get_event(&original_id).unwrap().unwrap();
        assert_ne!(replayed.id, original.id, "{uri}");
        assert_eq!(replayed.event_type, original.event_type, "{uri}");
        assert_eq!(replayed.payload, original.payload, "{uri}");
        assert_eq!(replayed.priority, 7, "{uri}");
        assert_eq!(replayed.root_event_id, replayed.id, "{uri}");
        assert_eq!(replayed.chain_depth, 0, "{uri}");
    }
}

#[test]
fn claims_are_ordered_by_priority_then_age() {
    for uri in backend_uris("priority") {
        let session = session_with(&uri, bus_config());
        for (order_id, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            session
                .enqueue(
                    EventDraft::raw(OrderPlaced::NAME, json!({ "order_id": order_id }))
                        .with_priority(priority),
                )
                .unwrap();
        }

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handlers = vec![SessionHandler::new(
            "collect",
            OrderPlaced::NAME,
            0,
            move |ctx: &mut HandlerContext| {
                sink.lock().unwrap().push(
                    ctx.event().payload["order_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                );
                Ok(())
            },
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["high".to_string(), "mid".to_string(), "low".to_string()],
            "{uri}"
        );
    }
}

#[test]
fn schedules_emit_root_events() {
    for uri in backend_uris("schedule") {
        let session = session_with(&uri, bus_config());
        let schedule = Schedule::new(
            EventDraft::raw("report.tick", json!({ "kind": "hourly" })),
            CronExpr::parse("* * * * *").unwrap(),
        );

        let ticks: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let handlers = vec![SessionHandler::new(
            "tick",
            "report.tick",
            0,
            move |ctx: &mut HandlerContext| {
                sink.lock().unwrap().push(ctx.event().chain_depth);
                Ok(())
            },
        )];
        let report = session.run(handlers, vec![schedule], Some(30)).unwrap();
        assert_eq!(report.schedule_fires, 1, "{uri}");

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.len(), 1, "{uri}");
        // Scheduled events are roots.
        assert_eq!(ticks[0], 0, "{uri}");
    }
}

#[test]
fn handler_commit_inside_lease_margin_fails() {
    for uri in backend_uris("leasemargin") {
        let config = EngineConfig {
            // A zero-length claim lease puts every commit inside the
            // safety margin immediately.
            event_claim_lease_ms: 0,
            event_max_attempts: 1,
            ..bus_config()
        };
        let session = session_with(&uri, config);
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handlers = vec![SessionHandler::new(
            "late-commit",
            OrderPlaced::NAME,
            0,
            move |ctx: &mut HandlerContext| {
                ctx.ensure_entity(&OrderRow {
                    id: "o1".into(),
                    state: "paid".into(),
                })?;
                let err = ctx.commit(None).unwrap_err();
                sink.lock().unwrap().push(err.to_string());
                Err(err)
            },
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();

        let errors = errors.lock().unwrap();
        assert!(!errors.is_empty(), "{uri}");
        assert!(errors[0].contains("lease expired"), "{uri}: {}", errors[0]);
        // The guarded commit never landed.
        assert_eq!(session.repo().head().unwrap().commit_id, 0, "{uri}");
    }
}

#[test]
fn gc_removes_terminal_events_but_keeps_unclaimed_ones() {
    for uri in backend_uris("gc") {
        let config = EngineConfig {
            event_retention_ms: 0,
            ..bus_config()
        };
        let session = session_with(&uri, config);
        session
            .enqueue(EventDraft::new(&OrderPlaced {
                order_id: "o1".into(),
            })
            .unwrap())
            .unwrap();
        // No handler consumes this type, so it never gets a claim.
        session
            .enqueue(EventDraft::raw("order.audit", json!({ "order_id": "o1" })))
            .unwrap();

        let handlers = vec![SessionHandler::new(
            "ack-it",
            OrderPlaced::NAME,
            0,
            |_ctx: &mut HandlerContext| Ok(()),
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();

        // Only the acked event is terminal; the unclaimed one survives
        // even though it is past retention.
        let removed = session.gc_events().unwrap();
        assert_eq!(removed, 1, "{uri}");

        // The survivor is still consumable.
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let handlers = vec![SessionHandler::new(
            "audit",
            "order.audit",
            0,
            move |_ctx: &mut HandlerContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )];
        session.run(handlers, Vec::new(), Some(30)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1, "{uri}");

        // Once acked, it becomes reapable too.
        let removed = session.gc_events().unwrap();
        assert_eq!(removed, 1, "{uri}");
    }
}
