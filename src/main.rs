use clap::Parser;

use servent::cli::ExitCode;
use servent::{lookup, Cli, Config, Servent};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 4 && args[1] == lookup::CHECK_FILE_FLAG {
        lookup::run_check_file_subcommand(&args[2], &args[3]);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(reason) => {
            eprintln!("{reason}");
            std::process::exit(ExitCode::NotEnoughArguments.into());
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(ExitCode::UnableToSpawn.into());
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code.into());
}

async fn run(config: Config) -> ExitCode {
    let mut servent = match Servent::bootstrap(&config).await {
        Ok(servent) => servent,
        Err(e) => {
            tracing::error!(%e, "failed to bootstrap servent");
            return ExitCode::IoError;
        }
    };

    match servent.run().await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(%e, "servent loop exited with error");
            ExitCode::IoError
        }
    }
}
