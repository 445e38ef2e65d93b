use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Arg, Command};
use log::{error, info};

use mailgate::settings::{self, Config};
use mailgate::{web, Gateway};

const DEFAULT_CONFIG: &str = "resources/mailgate.yaml";

fn setup_logging(level: log::LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message,
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mailgate")
        .about("Queues outbound mail over SMTP and collects inbound mail over POP3")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value(DEFAULT_CONFIG),
        )
        .get_matches();

    let path = matches.get_one::<String>("config").map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);
    let config: Arc<Config> = Arc::new(settings::load_settings(&path)?);
    setup_logging(config.log_level())?;
    info!("Loaded settings from {}", path.display());

    let gateway = Arc::new(Gateway::new(&config));
    gateway.start();

    let server = tokio::spawn(web::start_web_server(config.server.clone(), Arc::clone(&gateway)));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
        }
        result = server => {
            match result {
                Ok(Ok(())) => info!("Web server exited"),
                Ok(Err(err)) => error!("Web server failed: {}", err),
                Err(err) => error!("Web server task failed: {}", err),
            }
        }
    }

    gateway.stop().await?;
    Ok(())
}
