#[macro_use]
extern crate log;
extern crate clap;
extern crate loggerv;
extern crate openssl_probe;

extern crate zoe_definitions;
extern crate zoe_master;

use std::process;
use std::sync::Arc;

use clap::{App, AppSettings, Arg, ArgMatches};

use zoe_definitions::{Config, StateStore};
use zoe_master::backends;
use zoe_master::scheduler::ElasticScheduler;
use zoe_master::Result;

fn main() {
    let args = App::new("zoe-master")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Placement engine for the Zoe analytics orchestrator")
        .setting(AppSettings::ColoredHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase verbosity level"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .default_value("/etc/zoe/zoe.yml")
                .help("Configuration file"),
        )
        .arg(
            Arg::with_name("init-db")
                .long("init-db")
                .help("Initialize the state database and exit"),
        )
        .arg(
            Arg::with_name("force")
                .long("force")
                .requires("init-db")
                .help("Drop and recreate the deployment schema"),
        )
        .get_matches();

    openssl_probe::init_ssl_cert_env_vars(); // prerequisite for https clients
    loggerv::init_with_verbosity(args.occurrences_of("verbose") + 1).unwrap();

    if let Err(e) = run(&args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(args: &ArgMatches) -> Result<()> {
    let config = Config::read_from_file(args.value_of("config").unwrap())?;

    if args.is_present("init-db") {
        StateStore::init_db(&config, args.is_present("force"))?;
        info!("State database ready for deployment {}", config.deployment_name);
        return Ok(());
    }

    // the schema gate runs before any thread is launched
    let state = Arc::new(StateStore::connect(&config)?);

    let backend = backends::initialize_backend(&config)?;
    backend.init(Arc::clone(&state))?;

    let scheduler = ElasticScheduler::new(Arc::clone(&state), Arc::clone(&backend), config.clone())?;
    scheduler.trigger();
    info!(
        "Zoe master ready, deployment {}, {} back-end, {} policy",
        config.deployment_name,
        match config.backend {
            zoe_definitions::BackendKind::Kubernetes => "Kubernetes",
            zoe_definitions::BackendKind::Swarm => "Swarm",
        },
        config.scheduler_policy
    );

    scheduler.wait();
    backend.shutdown();
    Ok(())
}
