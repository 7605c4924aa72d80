//! Foreman: an inversion-of-coupling execution kernel.
//!
//! Applications register functions (units of logic with declared resource
//! dependencies, continuations, governance, and administration duties) and
//! the kernel owns every execution concern: which team of workers runs each
//! job, when asynchronously loading resources become available, how failures
//! escalate, and when scoped state is recycled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use foreman_core::kernel::{FnFunction, FunctionMeta, KernelBuilder, PassiveTeamFactory};
//! use foreman_core::types::{FunctionId, TeamId};
//!
//! # async fn demo() -> foreman_core::types::Result<()> {
//! let kernel = KernelBuilder::new()
//!     .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
//!     .add_function(
//!         FunctionMeta::new(FunctionId::must("greet")),
//!         FnFunction::new(|ctx| {
//!             tracing::info!("argument={}", ctx.argument());
//!             Ok(())
//!         }),
//!     )
//!     .build()?;
//! kernel.open().await?;
//! let process = kernel.create_process();
//! process.instigate(FunctionId::must("greet"), serde_json::json!("hi")).await?;
//! # Ok(())
//! # }
//! ```

pub mod kernel;
pub mod observability;
pub mod types;

pub use kernel::{ExecuteContext, Kernel, KernelBuilder, ProcessHandle};
pub use types::{Error, KernelConfig, Result};
