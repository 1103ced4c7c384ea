//! # wirekit - dependency-wired component lifecycle
//!
//! Register components with declared dependencies, then let the host resolve a
//! validated plan, construct instances with the right lifetime, and drive
//! start → stop in dependency order with per-component timeout and retry.
//!
//! ## Features
//!
//! - **Explicit dependencies**: every descriptor lists what it needs; missing names and
//!   cycles are rejected before any handler runs
//! - **Deterministic order**: topological order with priority then name as tie-break;
//!   stop is the exact reverse
//! - **Lifetimes**: singleton, scoped (explicit [`Scope`]s) and transient instances
//! - **Health**: on-demand probes folded transitively along the graph
//!
//! ## Example
//!
//! ```rust,ignore
//! use wirekit::{ComponentDescriptor, ComponentHost, Deadline};
//!
//! let host = ComponentHost::default();
//! host.register(
//!     ComponentDescriptor::builder::<Database>()
//!         .named("db")
//!         .factory(|_| Ok(Database::connect_lazy()))
//!         .with_lifecycle()
//!         .build()?,
//! )?;
//! host.register(
//!     ComponentDescriptor::builder::<UserRepo>()
//!         .named("users")
//!         .depends_on("db")
//!         .factory(|ctx| Ok(UserRepo::new(ctx.resolve::<Database>("db")?)))
//!         .build()?,
//! )?;
//!
//! host.start(&Deadline::none()).await?;
//! let report = host.health(&Deadline::after(Duration::from_secs(2))).await;
//! host.stop(&Deadline::none()).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub mod container;
pub mod contracts;
pub mod descriptor;
pub mod errors;
pub mod graph;
pub mod health;
pub mod registry;
pub mod runtime;

pub use container::{Container, ResolveCtx, ResolveError, ResolvedInstance, Scope};
pub use contracts::{Component, HealthReport, HealthStatus};
pub use descriptor::{
    ComponentDescriptor, Dependency, DescriptorBuilder, Lifetime, PolicyOverrides, RetryPolicy,
    TypeKey, DEFAULT_TIMEOUT,
};
pub use errors::{HandlerAction, LifecycleError, StopFailure};
pub use graph::{DependencyGraph, ExecutionPlan};
pub use health::HealthSnapshot;
pub use registry::{ComponentRegistry, DescriptorStore, RegistryError};
pub use runtime::{
    run, ComponentHost, ComponentState, Deadline, HostOptions, LifecyclePhase, RunOptions,
    ShutdownOptions, StartMode,
};
