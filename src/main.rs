mod cli;
mod config_proxy;
mod control;
mod events;
mod logging;
mod relay;
mod status_store;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use cli::Options;
use config_proxy::{ConfigProxy, ConfigProxyConfig};
use control::{ControlCommand, Controller, NotificationOutcome, Reply};
use events::ChatDestination;
use relay::{AcceptorConfig, Settings};
use status_store::StatusStore;

#[tokio::main]
async fn main() {
    let options = match Options::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            eprintln!("{}", cli::usage());
            std::process::exit(2);
        }
    };
    if options.help {
        eprintln!("{}", cli::usage());
        std::process::exit(0);
    }

    let _log_guard = logging::init(options.verbose, options.log_file.as_deref());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "Starting veil"
    );
    if options.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    if let Err(e) = run(options).await {
        tracing::error!(error = %e, "Fatal error");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(options: Options) -> Result<(), String> {
    relay::init_crypto_provider();

    let store = StatusStore::default_location();
    let visibility = store.load();
    tracing::info!(visibility = %visibility, path = %store.path().display(), "Loaded saved status");

    let settings = Arc::new(Settings::new(visibility, options.lobby_chat));
    let controller = Arc::new(Controller::new(settings.clone(), store));

    let (notify_tx, mut notify_rx) = events::channel();
    let (dest_tx, dest_rx) = watch::channel::<Option<ChatDestination>>(None);
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();

    let listener = relay::bind_acceptor(options.chat_port).await?;
    let relay_port = listener
        .local_addr()
        .map_err(|e| format!("Failed to read chat listener address: {}", e))?
        .port();
    tracing::info!(port = relay_port, "Chat listener bound");

    let proxy = ConfigProxy::start(
        ConfigProxyConfig {
            upstream_url: options.config_url.clone(),
            affinity_url: options.affinity_url.clone(),
            relay_port,
        },
        notify_tx.clone(),
    )
    .await
    .map_err(|e| format!("Failed to start config proxy: {}", e))?;

    tracing::info!(port = proxy.port(), "Config proxy ready");
    println!("Point the client config URL at {}", proxy.url());
    println!(
        "Appearing as {}. Type 'help' for commands.",
        controller.settings().visibility()
    );

    let acceptor_config = AcceptorConfig {
        cert_path: options.cert_path.clone(),
        key_path: options.key_path.clone(),
        insecure_upstream: options.dangerous_insecure_tls,
    };
    let mut acceptor = tokio::spawn(relay::run_acceptor(
        listener,
        acceptor_config,
        dest_rx,
        settings,
        notify_tx,
        session_tx,
    ));

    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            Some(handle) = session_rx.recv() => controller.attach(handle),

            Some(notification) = notify_rx.recv() => {
                if let NotificationOutcome::Exit(message) =
                    controller.handle_notification(notification, &dest_tx).await
                {
                    proxy.stop();
                    return Err(message);
                }
            }

            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if line.trim().eq_ignore_ascii_case("help") {
                        println!("{}", cli::usage());
                        continue;
                    }
                    match line.parse::<ControlCommand>() {
                        Ok(command) => match controller.apply(command).await {
                            Reply::Continue(message) => println!("{}", message),
                            Reply::Quit => break,
                        },
                        Err(e) => println!("{}", e),
                    }
                }
                Ok(None) => {
                    tracing::debug!("Console closed, running until interrupted");
                    console_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Console read failed");
                    console_open = false;
                }
            },

            result = &mut acceptor => {
                controller.persist();
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(format!("Chat listener task failed: {}", e)),
                };
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                controller.persist();
                break;
            }
        }
    }

    tracing::info!(status = %controller.status_line(), "Shutting down");
    acceptor.abort();
    proxy.stop();
    Ok(())
}
