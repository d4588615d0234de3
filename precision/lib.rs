#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod error;
pub mod factor;
pub mod likelihood;
pub mod operator;
pub mod types;
pub mod variants;

#[path = "../parallel/mod.rs"]
pub mod parallel;

#[path = "../blup/mod.rs"]
pub mod blup;

pub use error::PrecisionError;
pub use factor::FillOrdering;
pub use likelihood::{log_likelihood, log_likelihood_gradient, log_likelihood_hessian};
pub use operator::{FactorState, PrecisionOperator};
pub use types::{BlockDescriptor, Edge, GenomicRegion, RowSelection};
pub use variants::{NumericColumn, VariantRecord, VariantTable};
