use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::broadcast;

use crate::admin::AlertAdmin;
use crate::alerts::{AlertStore, NewAlert};
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::error::RowPulseError;
use crate::notify::NotifierRegistry;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::sources::DataSources;

#[derive(Parser)]
#[command(
    name = "rowpulse",
    version,
    about = "rowPulse: alerts on new rows in SQLite tables"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the alert scheduler (default if no command specified)
    Serve,

    /// List the alerts watching a database
    List {
        /// Configured source database name
        #[arg(long = "database", short = 'd')]
        database: String,
    },

    /// Show one alert with its subscriptions and recent log
    Show {
        alert_id: String,
    },

    /// Create an alert from a JSON request file
    Create {
        #[arg(long = "file", short = 'f')]
        file: PathBuf,
    },

    /// Delete an alert (and its queue, for trigger alerts)
    Delete {
        alert_id: String,
    },

    /// List the registered notification channels
    Notifiers,
}

/// Handles shared by every command
struct Services {
    store: AlertStore,
    sources: DataSources,
    registry: NotifierRegistry,
}

impl Services {
    fn open(config: &Config, data_dir: &Path) -> Result<Self, RowPulseError> {
        let db_path = config.database.resolve_path(data_dir);
        let db = Database::open_metadata(&db_path, config.database.pool_size)?;

        Ok(Services {
            store: AlertStore::new(db),
            sources: DataSources::open_all(&config.sources, config.database.pool_size),
            registry: NotifierRegistry::with_builtins(&config.notifiers.enabled),
        })
    }

    fn admin(&self, config: &Config) -> AlertAdmin {
        AlertAdmin::new(
            self.store.clone(),
            self.sources.clone(),
            self.registry.clone(),
            config.scheduler.max_attempts,
        )
    }

    fn scheduler(&self, config: &Config) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.sources.clone(),
            Dispatcher::new(self.registry.clone(), config.scheduler.send_timeout()),
            SchedulerSettings::from(&config.scheduler),
        )
    }
}

impl Cli {
    pub fn handle_command_line(config: &Config, data_dir: &Path) -> Result<(), RowPulseError> {
        let args = Cli::parse();

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| RowPulseError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let services = Services::open(config, data_dir)?;

            // Default to Serve if no command specified
            match args.command.unwrap_or(Command::Serve) {
                Command::Serve => Self::serve(&services, config).await,
                Command::List { database } => {
                    let alerts = services.admin(config).list_alerts(&database, Utc::now()).await?;
                    print_json(&alerts)
                }
                Command::Show { alert_id } => {
                    let view = services.admin(config).alert_detail(&alert_id, Utc::now()).await?;
                    print_json(&view)
                }
                Command::Create { file } => {
                    let text = fs::read_to_string(&file)?;
                    let request: NewAlert = serde_json::from_str(&text)?;
                    let alert_id = services.admin(config).create_alert(request, Utc::now()).await?;
                    println!("{}", alert_id);
                    Ok(())
                }
                Command::Delete { alert_id } => {
                    services.admin(config).delete_alert(&alert_id).await?;
                    println!("Deleted {}", alert_id);
                    Ok(())
                }
                Command::Notifiers => {
                    for notifier in services.registry.descriptors() {
                        println!("{:<10} {:<10} {}", notifier.slug, notifier.name, notifier.description);
                    }
                    Ok(())
                }
            }
        })
    }

    async fn serve(services: &Services, config: &Config) -> Result<(), RowPulseError> {
        let sources: Vec<&str> = services.sources.names().collect();
        info!(
            "Serving {} data source(s) [{}] with notifiers [{}]",
            sources.len(),
            sources.join(", "),
            services.registry.slugs().join(", ")
        );

        let scheduler = services.scheduler(config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let run = scheduler.run(shutdown_rx);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping scheduler");
                let _ = shutdown_tx.send(());
                run.await
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), RowPulseError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
