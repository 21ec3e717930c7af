//! # Sluice Engine
//!
//! Declarative source resolution and caching. Consumers declare *what* data
//! they need as named sources; the engine normalizes those names, expands
//! sources that depend on other sources' data, fetches what is missing,
//! caches results, and tells every mounted consumer when its data changed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde_json::Value;
//! use sluice_engine::{Consumer, Declaration, DeclarationSet, Engine};
//! use sluice_types::Location;
//! use sluice_util::EngineConfig;
//!
//! struct Profile;
//!
//! impl Consumer for Profile {
//!     fn sources(&self, _location: &Location) -> DeclarationSet {
//!         DeclarationSet::from(vec![
//!             Declaration::new("/api/user").key("user"),
//!             Declaration::derived(|deps: &[Value]| format!("/api/user/{}/posts", deps[0]["id"]).into())
//!                 .requires("user")
//!                 .key("user.posts"),
//!         ])
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::builder(EngineConfig::default()).build()?;
//! let binding = engine.mount(Arc::new(Profile));
//! engine.wait_idle().await;
//! println!("{}", binding.data());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`store`**: the keyed cache, its reducer, and the publish/subscribe channel
//! - **`dispatch`**: deduplicated network fetches and response classification
//! - **`declaration`** / **`document`**: what consumers ask for, in code or on disk
//! - **`resolver`**: recursive expansion of dependent declarations
//! - **`registry`** / **`binding`**: mounted consumers and their local data trees
//! - **`engine`**: the coordinator, navigation, and refresh

pub mod binding;
pub mod declaration;
pub mod dispatch;
pub mod document;
pub mod engine;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod templates;

pub use binding::{Consumer, ConsumerBinding, build_local_state};
pub use declaration::{Declaration, DeclarationSet, Requirement, SourceSpec, SourceTransformer};
pub use dispatch::{FetchFailure, FetchOutcome, RequestDispatcher};
pub use document::{DeclarationDocument, DocumentConsumer, DocumentError, load_declaration_document};
pub use engine::{Bootstrappable, Engine, EngineBuilder, EngineError};
pub use registry::SubscriberRegistry;
pub use resolver::{Resolution, Resolver};
pub use store::{CacheStore, Subscription, reduce};
