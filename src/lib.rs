pub mod attachment_store;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod mail_codec;
pub mod mail_source;
pub mod pop3;
pub mod settings;
pub mod web;

pub use error::{Error, Result};
pub use gateway::Gateway;

#[cfg(test)]
mod tests;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply()
            .unwrap();
    })
}
