pub mod constants;
pub use constants::*;

pub mod tracing_telemetry;

/// Formats the package name and version.
#[macro_export]
macro_rules! package_description {
    () => {
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
    };
}

/// Logs the package name and version.
#[macro_export]
macro_rules! print_package_info {
    () => {
        tracing::info!(
            package = env!("CARGO_PKG_NAME"),
            version = env!("CARGO_PKG_VERSION"),
            "Starting"
        );
    };
}
