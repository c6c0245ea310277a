//! Entry point (SPEC_FULL §4.9, §3): parse args, load config, run the
//! proxy until shutdown completes.

use filterproxy::{cli, config::Config, logging};

fn main() {
    let args = cli::Args::parse_args();

    if let Err(e) = logging::init(&args.log_level, args.colored) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load config {}: {e}", args.config_path.display());
            std::process::exit(1);
        }
    };

    log::info!(
        "starting filterproxy: bind={}:{} pool={} backlog={} rules={} log={}",
        config.host,
        config.port,
        config.thread_pool_size,
        config.backlog,
        config.blocked_domains_file,
        config.log_file
    );

    let exit_code = smol::block_on(async move {
        match filterproxy::run(config).await {
            Ok(()) => {
                log::info!("filterproxy shut down cleanly");
                0
            }
            Err(e) => {
                log::error!("filterproxy exited with error: {e}");
                1
            }
        }
    });

    std::process::exit(exit_code);
}
