//! Concrete metadata providers.

mod archive;
mod civarchive;
mod civitai;

pub use archive::ArchiveDbProvider;
pub use civarchive::CivArchiveProvider;
pub use civitai::CivitaiProvider;

#[cfg(test)]
pub(crate) use archive::tests::build_archive;
