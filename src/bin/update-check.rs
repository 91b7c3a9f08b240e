//! CLI front door for the managed-software-update session engine.
//!
//! Grounded on `pahkatc.rs`'s `clap::App`/subcommand shape and
//! `env_logger::init()` at the top of `main`.

extern crate clap;
#[macro_use]
extern crate log;

use clap::{App, Arg, SubCommand};
use std::path::PathBuf;
use std::process::exit;

use munkicheck::session::{with_session_lock, ExitCode, SessionConfig, SessionController};

fn main() {
    env_logger::init();

    let matches = App::new("update-check")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Brendan Molloy <brendan@bbqsrc.net>")
        .about("Managed software update session runner")
        .arg(
            Arg::with_name("config")
                .value_name("PATH")
                .help("Path to the session config JSON file")
                .short("c")
                .long("config")
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a single update-check session")
                .arg(
                    Arg::with_name("repo-url")
                        .value_name("URL")
                        .help("Override the configured software repo URL")
                        .long("repo-url")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("auto")
                        .help("Run non-interactively, suppressing login-window install behavior")
                        .long("auto"),
                ),
        )
        .subcommand(SubCommand::with_name("show-config").about("Print the resolved session config"))
        .get_matches();

    let config_path = matches
        .value_of("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match matches.subcommand() {
        ("show-config", Some(_)) => {
            let config = SessionConfig::load(&config_path);
            match serde_json::to_string_pretty(&config) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    error!("failed to serialize config: {}", e);
                    exit(ExitCode::ErrorsOccurred as i32);
                }
            }
        }
        ("run", Some(run_matches)) => {
            let mut config = SessionConfig::load(&config_path);

            if let Some(url) = run_matches.value_of("repo-url") {
                config.software_repo_url = url.to_string();
            }
            if run_matches.is_present("auto") {
                config.suppress_loginwindow_install = true;
            }

            let lock_path = lock_path_for(&config);
            let exit_code = with_session_lock(&lock_path, move || run_session(config));

            match exit_code {
                Ok(code) => exit(code as i32),
                Err(e) => {
                    error!("{}", e);
                    exit(ExitCode::ErrorsOccurred as i32);
                }
            }
        }
        _ => {
            println!("{}", matches.usage());
        }
    }
}

fn run_session(config: SessionConfig) -> ExitCode {
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_style(
        indicatif::ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}"),
    );
    spinner.set_message("checking for updates...");
    spinner.enable_steady_tick(120);

    let mut controller = SessionController::new(config);
    let (install_info, report, exit_code) = controller.run();

    spinner.finish_and_clear();

    info!(
        "session for manifest {:?} finished with {} managed install(s), {} problem item(s)",
        report.manifest_name,
        install_info.managed_installs.len(),
        install_info.problem_items.len()
    );

    for problem in &install_info.problem_items {
        warn!("problem item: {} ({})", problem.name, problem.reason);
    }

    let report_path = controller.config.cache_dir.join("report.json");
    if let Err(e) = report.write_to(&report_path) {
        warn!("failed to write session report: {}", e);
    }

    exit_code
}

fn default_config_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join("munkicheck").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("/Library/Managed Installs/config.json"))
}

fn lock_path_for(config: &SessionConfig) -> PathBuf {
    config.cache_dir.join("session.lock")
}
