/// Configuration Parameters.
#[cfg(target_os = "linux")]
pub(crate) mod config;
#[cfg(target_os = "linux")]
mod main_;

#[tokio::main]
#[cfg(target_os = "linux")]
async fn main() -> anyhow::Result<()> {
    main_::main().await.map_err(|error| {
        tracing::error!(%error, "Terminated with error");
        error
    })
}

#[tokio::main]
#[cfg(not(target_os = "linux"))]
async fn main() -> anyhow::Result<()> {
    Ok(())
}
