// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # colony-core
//!
//! Transactional record layer for research-animal colonies. Every mutation
//! runs inside a transaction whose prospective state is checked by a rules
//! engine before anything is committed.
//!
//! ## Architecture
//!
//! - **Entities** (`entity`): thirteen record types behind a closed `EntityRecord` enum
//! - **Changes** (`change`): create/update/delete captured in occurrence order
//! - **Rules** (`rules`): ordered, append-only engine with capacity, quota and lineage rules
//! - **Stores** (`store`): memory, snapshot file (memmap2) and durable (redb) backends
//! - **Service** (`service`): timed, logged, audited operations over any store
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use colony_core::context::Context;
//! use colony_core::entity::{Facility, HousingUnit, Organism};
//! use colony_core::rules::RulesEngine;
//! use colony_core::store::{MemoryStore, StoreExt, TransactionExt};
//!
//! let store = MemoryStore::new(Arc::new(RulesEngine::with_defaults()));
//! let ctx = Context::new();
//! let (unit, _) = store
//!     .transact(&ctx, |tx| {
//!         let facility = tx.create(Facility::default())?;
//!         tx.create(HousingUnit::new("Tank 4", facility.base.id, 2))
//!     })
//!     .unwrap();
//! let (frog, result) = store
//!     .transact(&ctx, |tx| {
//!         let mut frog = Organism::new("Frog 1", "xenopus");
//!         frog.housing_id = Some(unit.base.id.clone());
//!         tx.create(frog)
//!     })
//!     .unwrap();
//! assert!(result.is_empty());
//! assert!(store.get::<Organism>(&frog.base.id).is_some());
//! ```

pub mod change;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod rules;
pub mod service;
pub mod store;
pub mod view;
