mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, ConfigArgs, IssueTokenArgs, RunArgs};
use warden_core::config::Config;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));

    match command {
        Command::Run(args) => cmd_run(args),
        Command::CheckConfig(args) => cmd_check_config(args),
        Command::IssueToken(args) => cmd_issue_token(args),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    // Peek at config for file logging; a broken file is reported by build()
    let log_dir = Config::load(&args.config.config)
        .ok()
        .filter(|c| c.logging_to_file)
        .map(|c| c.log_dir.unwrap_or_else(|| "logs".to_string()));
    let _guard = warden_core::lifecycle::logging::init_logging(
        &args.log_level,
        args.log_format,
        log_dir.as_deref(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(&args)?;
        application.serve().await
    })
}

fn cmd_check_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .map_err(|e| anyhow::anyhow!("{}: {e}", args.config))?;
    println!("{}: OK", args.config);
    println!("  listen:          {}:{}", config.host, config.port);
    println!("  tls:             {}", config.tls.enable);
    println!("  rate limiting:   {}", config.rate_limit.enabled);
    println!(
        "  internal secret: {}",
        if config.resolve_internal_secret().is_some() { "set" } else { "MISSING" }
    );
    println!(
        "  jwt secret:      {}",
        if config.auth.resolve_jwt_secret().is_some() { "set" } else { "MISSING" }
    );
    Ok(())
}

fn cmd_issue_token(args: IssueTokenArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config.config).unwrap_or_default();
    let secret = config
        .auth
        .resolve_jwt_secret()
        .ok_or_else(|| anyhow::anyhow!("no JWT secret in config or WARDEN_JWT_SECRET"))?;
    let token = warden_core::auth::issue_token(
        &args.user_id,
        args.email.as_deref(),
        args.role,
        &args.permissions,
        &secret,
        args.ttl.unwrap_or(config.auth.token_ttl_secs),
    )?;
    println!("{token}");
    Ok(())
}
