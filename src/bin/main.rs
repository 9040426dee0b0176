use std::io::{BufRead, Write};

use tracing::{error, info};

use ssm_agent::agent::supervisor::{Agent, ExitReason};
use ssm_agent::cli::Cli;
use ssm_agent::identity::{IdentityStore, RegistrationRecord};
use ssm_agent::logging::init_logging;
use ssm_agent::AgentConfig;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
/// Termination by user signal.
const EXIT_SIGNALLED: i32 = 130;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::init();

    if let Err(err) = init_logging() {
        eprintln!("{err}");
        return EXIT_ERROR;
    }

    let config = match AgentConfig::load(&cli.config_path()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "could not load configuration");
            return EXIT_ERROR;
        }
    };

    if cli.register {
        return handle_register(&cli, &config);
    }
    if cli.fingerprint {
        return handle_fingerprint(&cli, &config);
    }

    // with or without --worker the core runs the same way; the flag only
    // tells the OS service wrapper not to re-spawn us
    run_agent(config)
}

fn run_agent(config: AgentConfig) -> i32 {
    let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    }) {
        error!(%err, "could not install signal handler");
        return EXIT_ERROR;
    }

    match Agent::new(config).run(shutdown_rx) {
        Ok(ExitReason::Signalled) => EXIT_SIGNALLED,
        Ok(ExitReason::Completed) => EXIT_OK,
        Err(err) => {
            error!(%err, "agent cannot start");
            EXIT_ERROR
        }
    }
}

fn handle_register(cli: &Cli, config: &AgentConfig) -> i32 {
    let (Some(code), Some(id), Some(region)) = (&cli.code, &cli.id, &cli.region) else {
        eprintln!("usage: --register --code <code> --id <id> --region <region> [-y] [--clear]");
        return EXIT_ERROR;
    };
    if code.is_empty() {
        eprintln!("activation code must not be empty");
        return EXIT_ERROR;
    }

    let store = IdentityStore::new(&config.data_root);

    if cli.clear {
        if let Err(err) = store.clear_registration() {
            error!(%err, "could not clear existing registration");
            return EXIT_ERROR;
        }
    }

    match store.load_registration() {
        Ok(Some(existing)) if !cli.yes => {
            if !confirm_overwrite(&existing.instance_id) {
                info!("registration cancelled");
                return EXIT_ERROR;
            }
        }
        Ok(_) => {}
        Err(err) => {
            error!(%err, "could not read existing registration");
            return EXIT_ERROR;
        }
    }

    // the credential exchange itself happens outside the core runtime; the
    // record below is what the supervisor resolves identity from
    let record = RegistrationRecord {
        instance_id: id.clone(),
        region: region.clone(),
    };
    match store.save_registration(&record) {
        Ok(()) => {
            info!(instance_id = record.instance_id, "instance registered");
            EXIT_OK
        }
        Err(err) => {
            error!(%err, "could not persist registration");
            EXIT_ERROR
        }
    }
}

fn handle_fingerprint(cli: &Cli, config: &AgentConfig) -> i32 {
    let store = IdentityStore::new(&config.data_root);
    match store.save_similarity_threshold(cli.similarity_threshold) {
        Ok(()) => {
            info!(
                threshold = cli.similarity_threshold,
                "similarity threshold updated"
            );
            EXIT_OK
        }
        Err(err) => {
            error!(%err, "could not persist similarity threshold");
            EXIT_ERROR
        }
    }
}

fn confirm_overwrite(existing_instance_id: &str) -> bool {
    print!("Instance already registered as {existing_instance_id}. Overwrite? (y/N) ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
