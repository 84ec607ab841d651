use strata_server::{Server, ServerConfig};

fn main() {
    env_logger::init();
    let config = ServerConfig::from_env();
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            log::error!("startup failed: {}", err);
            std::process::exit(1);
        }
    };
    if let Ok(plugin) = std::env::var("STRATA_COMPOSITOR_PLUGIN") {
        server.use_plugin(&plugin, "plugin");
    }
    if let Err(err) = server.run() {
        log::error!("server exited: {}", err);
        std::process::exit(1);
    }
}
