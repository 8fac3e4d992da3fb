//! Step interpreter and the plugin contract.
//!
//! | Step kind      | Work                                   | Suspends? |
//! |----------------|----------------------------------------|-----------|
//! | `action`       | external plugin call                   | yes       |
//! | `transform`    | pure collection operation              | no        |
//! | `enrichment`   | merge / deep merge / join of sources   | no        |
//! | `validation`   | schema + rules, local failure policy   | no        |
//! | `comparison`   | equality, diff, containment            | no        |
//! | `approval`     | human decision via the approval tracker| yes       |
//!
//! `conditional` and `scatter_gather` schedule nested steps and are driven
//! by the parallel executor.

pub mod comparison;
pub mod conditions;
pub mod enrichment;
mod executor;
mod plugin;
pub mod transform;
pub mod validation;

pub use executor::StepExecutor;
pub use plugin::{EchoPlugin, Plugin, PluginError, PluginRegistry, PluginResponse};
