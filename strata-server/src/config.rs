//! Server configuration, read from the environment by the binary.

use std::path::PathBuf;

use strata_registry::Capacities;
use strata_wire::{Rect, SERVER_SOCKET_PATH};

/// Startup parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Full screen rectangle.
    pub screen_rect: Rect,
    /// Worker threads for banded composition; 0 composites on the server
    /// thread alone.
    pub compose_workers: usize,
    /// Capacities of the default layer's registry.
    pub default_caps: Capacities,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            socket_path: PathBuf::from(SERVER_SOCKET_PATH),
            screen_rect: Rect::new(0, 0, 1024, 768),
            compose_workers: 0,
            default_caps: Capacities::default(),
        }
    }
}

impl ServerConfig {
    /// Reads overrides from `STRATA_SOCKET`, `STRATA_SCREEN` (`WxH`) and
    /// `STRATA_COMPOSE_WORKERS`.  Unparsable values keep the default and
    /// are logged.
    pub fn from_env() -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Ok(path) = std::env::var("STRATA_SOCKET") {
            config.socket_path = PathBuf::from(path);
        }
        if let Ok(screen) = std::env::var("STRATA_SCREEN") {
            match parse_screen(&screen) {
                Some(rect) => config.screen_rect = rect,
                None => log::warn!("ignoring unparsable STRATA_SCREEN {:?}", screen),
            }
        }
        if let Ok(workers) = std::env::var("STRATA_COMPOSE_WORKERS") {
            match workers.parse() {
                Ok(n) => config.compose_workers = n,
                Err(_) => log::warn!("ignoring unparsable STRATA_COMPOSE_WORKERS {:?}", workers),
            }
        }
        config
    }
}

fn parse_screen(s: &str) -> Option<Rect> {
    let (w, h) = s.split_once('x')?;
    let w: i32 = w.parse().ok()?;
    let h: i32 = h.parse().ok()?;
    if w <= 0 || h <= 0 {
        return None;
    }
    Some(Rect::new(0, 0, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_strings_parse() {
        assert_eq!(parse_screen("1920x1080"), Some(Rect::new(0, 0, 1920, 1080)));
        assert_eq!(parse_screen("1920"), None);
        assert_eq!(parse_screen("0x600"), None);
        assert_eq!(parse_screen("axb"), None);
    }
}
