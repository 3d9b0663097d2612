//! Host collaborators: package installation and service supervision

pub mod packages;
pub mod services;

pub use packages::{AptInstaller, PackageInstaller};
pub use services::{ServiceSupervisor, Systemd};

#[cfg(test)]
pub use packages::MockPackageInstaller;
#[cfg(test)]
pub use services::MockServiceSupervisor;
