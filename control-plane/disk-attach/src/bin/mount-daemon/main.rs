//! Host mount daemon.
//!
//! Runs in the host mount namespace and performs the mounts requested by containerized node
//! agents, with the filesystem helpers installed on the host.

use actix_web::{get, web, App, HttpResponse, HttpServer};
use clap::{Arg, ArgAction, Command};
use disk_attach::mount::{redact, MountRequest};
use serde::Serialize;
use std::str::FromStr;
use tracing::{error, info, warn};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

#[derive(Serialize)]
struct Info {
    name: &'static str,
    version: &'static str,
}

#[get("/info")]
async fn info() -> HttpResponse {
    HttpResponse::Ok().json(Info {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[get("/mount/{command}")]
async fn mount(command: web::Path<String>) -> HttpResponse {
    let request = match MountRequest::decode(&command) {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "Rejecting mount request");
            return HttpResponse::BadRequest().json(error);
        }
    };
    info!(
        source = %request.source,
        target = %request.target.display(),
        fs_type = %request.fs_type,
        options = ?redact(&request.options),
        "Mounting"
    );
    match tokio::process::Command::new("mount")
        .args(request.args())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            HttpResponse::Ok().json(String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(target = %request.target.display(), %stderr, "Mount failed");
            HttpResponse::BadRequest().json(stderr)
        }
        Err(error) => {
            error!(%error, "Failed to execute mount");
            HttpResponse::InternalServerError().json(error.to_string())
        }
    }
}

fn cli() -> Command {
    Command::new(utils::package_description!())
        .about("Performs the mounts of containerized node agents in the host mount namespace")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("bind")
                .long("bind")
                .env("MOUNT_DAEMON_BIND")
                .value_name("ADDRESS")
                .default_value(utils::DEFAULT_MOUNT_DAEMON_BIND)
                .help("Address to listen on, agents connect through the loopback interface"),
        )
        .arg(
            Arg::new("fmt-style")
                .long("fmt-style")
                .value_name("STYLE")
                .default_value(FmtStyle::Compact.as_ref().to_string())
                .help("Formatting style of the logs: compact, pretty or json"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the verbosity level"),
        )
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let style = matches
        .get_one::<String>("fmt-style")
        .map(|style| FmtStyle::from_str(style))
        .transpose()?
        .unwrap_or(FmtStyle::Compact);
    let level = match matches.get_count("v") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stderr)
        .with_style(style)
        .with_default_level(level)
        .init(utils::PRODUCT_NAME);
    utils::print_package_info!();

    let bind = matches
        .get_one::<String>("bind")
        .map(String::as_str)
        .unwrap_or(utils::DEFAULT_MOUNT_DAEMON_BIND);
    info!(bind, "Listening for mount requests");
    HttpServer::new(|| App::new().service(info).service(mount))
        .bind(bind)?
        .run()
        .await?;
    Ok(())
}
