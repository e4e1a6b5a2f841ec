use std::sync::Arc;

use console::style;
use roost_stream::{server::start_server, types::DEFAULT_CURSOR_SECRET};
use tracing::warn;

use crate::Context;

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct RunCommand {
    /// Port to run the server on (overrides the config file)
    #[arg(long, env = "ROOST_PORT")]
    pub port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "ROOST_HOST")]
    pub host: Option<String>,
}

impl RunCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<(), String> {
        let mut options = ctx.config.server.clone();
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(host) = &self.host {
            options.host = host.clone();
        }

        let auth = ctx.config.authenticator().map_err(|e| e.to_string())?;

        println!();
        println!("{}", style("Roost").cyan().bold());
        println!("{}", style("Starting delivery server").dim());
        println!();
        println!("{} {}", style("Config").dim(), ctx.config_path.display());
        println!("{} {}", style("Users").dim(), auth.len());
        println!("{} {}:{}", style("Listen").dim(), options.host, options.port);
        println!();
        println!("{}", style("Endpoints").dim());
        println!("  {} ws://{}:{}/v1/socket", style("  WS").cyan(), options.host, options.port);
        for (method, path) in [
            (style("  GET").yellow(), "/api/subscriptions"),
            (style(" POST").magenta(), "/api/subscribe"),
            (style(" POST").magenta(), "/api/unsubscribe"),
            (style("  GET").yellow(), "/api/messages"),
            (style(" POST").magenta(), "/api/messages"),
            (style("  GET").yellow(), "/health"),
        ] {
            println!("  {} http://{}:{}{}", method, options.host, options.port, path);
        }
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        if options.cursor_secret == DEFAULT_CURSOR_SECRET {
            warn!("Using the built-in cursor secret; set ROOST_CURSOR_SECRET in production");
        }
        if auth.is_empty() {
            warn!("No users configured; every socket will be rejected");
        }

        start_server(options, Arc::new(auth), shutdown_signal())
            .await
            .map_err(|e| format!("Server failed: {}", e))?;

        println!("{}", style("Bye").dim());
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
