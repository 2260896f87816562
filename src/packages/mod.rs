// src/packages/mod.rs

//! Packages the merge engine can install or remove
//!
//! An [`ImagePackage`] is a staged directory tree about to be installed; an
//! [`InstalledPackage`] is the recorded contents of something already on the
//! system. Both implement the [`Package`] trait.

pub mod image;
pub mod installed;
pub mod traits;

pub use image::ImagePackage;
pub use installed::InstalledPackage;
pub use traits::Package;
