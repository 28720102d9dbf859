use std::path::Path;

use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger,
    LoggerHandle, Naming,
};
use log::{debug, error};

use rowpulse::cli::Cli;
use rowpulse::config::Config;

const LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 5;

fn setup_logging(config: &Config, data_dir: &Path) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(config.logging.log_spec())?.format(detailed_format);

    let logger = if config.logging.file {
        logger
            .log_to_file(
                FileSpec::default()
                    .directory(data_dir.join("logs"))
                    .basename("rowpulse"),
            )
            .rotate(
                Criterion::Size(LOG_FILE_SIZE),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(LOG_FILES_KEPT),
            )
            .duplicate_to_stderr(Duplicate::Warn)
    } else {
        logger.log_to_stderr()
    };

    logger.start()
}

fn main() {
    let project_dirs = match Config::project_dirs() {
        Ok(dirs) => dirs,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    let data_dir = project_dirs.data_local_dir();
    let config = Config::init(data_dir);

    // Keep the handle alive for the life of the process
    let _logger = match setup_logging(config, data_dir) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start logging: {}", err);
            std::process::exit(1);
        }
    };

    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if let Err(err) = Cli::handle_command_line(config, data_dir) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
