//! Metadata resolution from local and remote providers.

mod provider;
pub mod providers;
mod resolver;

pub use provider::MetadataProvider;
pub use resolver::{MetadataResolver, Resolution};

#[cfg(test)]
pub(crate) use resolver::tests::ScriptedProvider;
