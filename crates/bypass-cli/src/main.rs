//! bypass: fetch an article across a blocking network
//!
//! Runs one fetch session from the command line. The body goes to stdout,
//! logs go to stderr (`RUST_LOG` overrides the default `info` level).

use anyhow::{anyhow, bail, Context, Result};
use bypass_fetch::{CancellationToken, FetchConfig, FetchOutcome, FetchPipeline};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "\
Usage: bypass [OPTIONS] <URL>

Options:
  --config <PATH>   Load configuration (.toml or .json)
  --proxy           Start on a proxy candidate
  --relay           Start on the fixed relay
  --mirror          Start on the mirror host
  --print-config    Print the effective configuration and exit
  -h, --help        Show this help";

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    proxy: bool,
    relay: bool,
    mirror: bool,
    print_config: bool,
    help: bool,
    url: Option<String>,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--proxy" => parsed.proxy = true,
            "--relay" => parsed.relay = true,
            "--mirror" => parsed.mirror = true,
            "--print-config" => parsed.print_config = true,
            "-h" | "--help" => parsed.help = true,
            flag if flag.starts_with('-') => bail!("unknown option {flag}"),
            _ if parsed.url.is_some() => bail!("only one URL can be fetched at a time"),
            _ => parsed.url = Some(arg),
        }
    }

    if parsed.proxy && parsed.relay {
        bail!("--proxy and --relay are mutually exclusive");
    }
    Ok(parsed)
}

/// Article URLs are fetched through the primary content host
fn target_url(config: &FetchConfig, url: &str) -> String {
    let on_content_host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| config.is_content_host(h)))
        .unwrap_or(false);

    if on_content_host {
        url.to_string()
    } else {
        config.content_url(url)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => FetchConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FetchConfig::default(),
    };
    if args.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let original = args.url.clone().ok_or_else(|| anyhow!("no URL given\n\n{USAGE}"))?;
    let target = target_url(&config, &original);

    let pipeline = Arc::new(FetchPipeline::new(config)?);
    let mut session = pipeline.session(&target, &original)?;

    if args.mirror && session.toggle_mirror().is_none() {
        warn!("--mirror ignored: {} is not on a content host", target);
    }
    if args.proxy {
        session.request_proxy();
    }
    if args.relay {
        session.request_relay();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling fetch");
                cancel.cancel();
            }
        });
    }

    info!("Fetching {} (tier: {})", session.target(), session.tier());

    let outcome = pipeline.run(&mut session, &cancel).await;
    match &outcome {
        FetchOutcome::Success { body, content_type, final_url, tier } => {
            info!("{} via {} ({}, {} bytes)", final_url, tier, content_type, body.len());
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(body)?;
            stdout.flush()?;
            Ok(())
        }
        FetchOutcome::Failure { message, signal, .. } => {
            let actions: Vec<String> = outcome
                .recovery_actions()
                .iter()
                .map(|a| format!("{a:?}"))
                .collect();
            eprintln!("{message}");
            eprintln!("Signal: {signal}; options: {}", actions.join(", "));
            std::process::exit(1);
        }
        FetchOutcome::Cancelled => {
            eprintln!("Cancelled");
            std::process::exit(130);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--config", "bypass.toml", "--mirror", "https://medium.com/x"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("bypass.toml")));
        assert!(parsed.mirror);
        assert_eq!(parsed.url.as_deref(), Some("https://medium.com/x"));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--bogus"]).is_err());
        assert!(args(&["--proxy", "--relay", "u"]).is_err());
        assert!(args(&["a", "b"]).is_err());
    }

    #[test]
    fn test_target_url() {
        let config = FetchConfig::default();
        assert_eq!(
            target_url(&config, "https://medium.com/@a/story"),
            "https://freedium.cfd/https://medium.com/@a/story"
        );
        assert_eq!(
            target_url(&config, "https://freedium-mirror.cfd/x"),
            "https://freedium-mirror.cfd/x"
        );
    }
}
