use std::env::consts::{
    ARCH, DLL_EXTENSION, DLL_PREFIX, DLL_SUFFIX, EXE_EXTENSION, EXE_SUFFIX, FAMILY, OS,
};

use anyhow::{Context, Error};
use tracing::trace;

use crate::booru::{init_config, init_logger, log_error, log_system_event};
use crate::program::Program;

mod booru;
mod program;
mod tui;

/// Directory holding `config.toml`.
const CONFIG_DIR: &str = "./config";

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_manager = init_config(CONFIG_DIR).context("Failed to load configuration")?;
    let config = config_manager.get_app_config();

    // the guard flushes the file log when dropped at the end of main
    let _logger = init_logger(&config.logging, &config.paths).context("Failed to initialize logging")?;
    log_system_information();
    log_system_event("startup", env!("CARGO_PKG_VERSION"));

    let program = Program::new(config_manager);
    let result = program.run().await;
    if let Err(e) = &result {
        log_error("program", &e.to_string(), Some(&format!("{:#}", e)));
    }
    log_system_event("shutdown", if result.is_ok() { "clean" } else { "error" });
    result
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("DLL_EXTENSION:  \"{}\"", DLL_EXTENSION);
    trace!("DLL_PREFIX:     \"{}\"", DLL_PREFIX);
    trace!("DLL_SUFFIX:     \"{}\"", DLL_SUFFIX);
    trace!("EXE_EXTENSION:  \"{}\"", EXE_EXTENSION);
    trace!("EXE_SUFFIX:     \"{}\"", EXE_SUFFIX);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    trace!("CPUS:           {}", num_cpus::get());
}
