pub mod catalog;
#[cfg(feature = "cli")]
pub mod tracing_setup;
