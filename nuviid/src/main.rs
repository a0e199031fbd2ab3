use nuviid::daemon::{DaemonConfig, DaemonRuntime, PROVIDER_ID};
use nuviid::registrar::{LogShellServiceHost, Registrar};
use nuvii_filter::RegistrationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Cleanup,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--cleanup" => mode = CliMode::Cleanup,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    match parse_cli_mode(std::env::args())? {
        CliMode::Cleanup => {
            let config = DaemonConfig::from_env()?;
            let registrations = RegistrationStore::open(&config.state_dir)?;
            let removed =
                Registrar::force_cleanup(&registrations, &LogShellServiceHost, PROVIDER_ID)?;
            eprintln!("[nuviid] cleanup removed {removed} sync-root registration(s)");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: nuviid [--cleanup]");
            println!("  --cleanup   Remove all provider sync-root registrations and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run() {
        let mode = parse_cli_mode(vec!["nuviid".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn cli_supports_cleanup() {
        let mode = parse_cli_mode(vec!["nuviid".to_string(), "--cleanup".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Cleanup);
    }

    #[test]
    fn cli_supports_help() {
        let mode = parse_cli_mode(vec!["nuviid".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn cli_rejects_unknown_arguments() {
        assert!(parse_cli_mode(vec!["nuviid".to_string(), "--bogus".to_string()]).is_err());
    }
}
