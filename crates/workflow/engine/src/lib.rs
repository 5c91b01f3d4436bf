//! Task-graph execution engine for compiled processes
//!
//! The engine executes a [`DefinitionSet`](procflow_types::DefinitionSet)
//! as a graph of tasks. It advances an instance until it completes or has
//! to wait for a user or a message, and it can persist an instance to
//! opaque bytes and resume it later.
//!
//! # Architecture
//!
//! - [`Engine`] - create, advance, persist, restore, resume, correlate, cancel
//! - [`HandlerRegistry`] - service task implementations keyed by node
//! - [`BranchReconciler`] - keeps one branch per exclusive gateway
//! - [`expression`] - the condition language on gateway flows
//! - [`Checkpointer`] - runs engine calls against an [`InstanceStore`]
//!
//! # Example
//!
//! ```rust
//! use procflow_engine::{Engine, ExecutionContext, HandlerRegistry, HandlerError, TaskContext, ActorContext};
//! use procflow_types::*;
//!
//! let mut def = ProcessDefinition::new("greeting");
//! def.add_element(FlowElement::start_event(START_EVENT_ID)).unwrap();
//! def.add_element(FlowElement::service_task("greet", "Greet")).unwrap();
//! def.add_element(FlowElement::end_event("end")).unwrap();
//! def.add_flow(SequenceFlow::new("f1", START_EVENT_ID, "greet")).unwrap();
//! def.add_flow(SequenceFlow::new("f2", "greet", "end")).unwrap();
//!
//! let handlers = HandlerRegistry::builder()
//!     .register(
//!         "greet",
//!         |task: &mut TaskContext, _: &mut (), _: Option<&ActorContext>| -> Result<(), HandlerError> {
//!             task.set("greeting", "hello");
//!             Ok(())
//!         },
//!     )
//!     .build();
//! let engine = Engine::new(handlers);
//!
//! let mut persistence = ();
//! let mut ctx = ExecutionContext::new(&mut persistence);
//! let mut instance = engine
//!     .create(DefinitionSet::new(def), DataBag::new(), &mut ctx)
//!     .unwrap();
//! let outcome = engine.advance(&mut instance, &mut ctx).unwrap();
//!
//! assert!(outcome.is_completed());
//! assert_eq!(instance.data["greeting"], "hello");
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod events;
pub mod expression;
pub mod handlers;
pub mod reconcile;
pub mod snapshot;
pub mod store;

pub use config::{EngineConfig, GatewayActivation, DEFAULT_MAX_STEPS};
pub use engine::{AdvanceOutcome, Engine, TaskCompletion};
pub use events::{EngineEvent, EventSink, ExecutionContext, RecordingSink};
pub use expression::{evaluate, EvalError};
pub use handlers::{
    ActorContext, HandlerError, HandlerRegistry, HandlerRegistryBuilder, ServiceHandler,
    TaskContext,
};
pub use reconcile::{BranchCandidate, BranchReconciler, ConditionReconciler, Reconciliation};
pub use store::{
    Checkpointer, InMemoryInstanceStore, InstanceStore, PersistedRecord, StoreError, StoreResult,
};
