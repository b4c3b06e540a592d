pub mod builder;
pub mod bundle;
pub mod classifier;
pub mod defaults;
pub mod runtime;
pub mod stages;
pub mod traits;
