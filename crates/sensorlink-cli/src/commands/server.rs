use log::{error, info};
use sensorlink_server::{Server, ServerConfig};

/// Serve until Ctrl+C; returns the process exit code.
pub fn run(config: ServerConfig) -> i32 {
    println!("sensorlink server v{}", sensorlink_core::VERSION);
    match config.seed {
        Some(seed) => println!("   seeded readings (seed {seed})"),
        None => println!("   random readings"),
    }
    println!("   up to {} concurrent clients", config.max_connections);
    println!();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("could not start runtime: {e}");
            return 1;
        }
    };

    rt.block_on(async move {
        let server = match Server::bind(config).await {
            Ok(server) => server,
            Err(e) => {
                error!("could not bind: {e}");
                return 1;
            }
        };
        if let Ok(addr) = server.local_addr() {
            println!("   listening on {addr} (try: sensorlink client --port {})", addr.port());
        }

        tokio::select! {
            result = server.run() => match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("server stopped: {e}");
                    1
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                0
            }
        }
    })
}
