use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};

/// Load and validate a configuration file. TOML by default; `.yml`/`.yaml`
/// files are parsed as YAML.
pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let path = p.as_ref();
    let txt = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"));
    let cfg: Config = if is_yaml {
        serde_norway::from_str(&txt)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?
    } else {
        toml::from_str(&txt).map_err(|e| Error::Config(format!("failed to parse config: {e}")))?
    };

    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.proxies.is_empty() {
        return Err(Error::Config("no proxies configured".into()));
    }

    let mut listens: HashSet<(String, u16)> = HashSet::new();
    for proxy in &cfg.proxies {
        if proxy.interfaces.is_empty() {
            return Err(Error::Config(format!("proxy {}: no interfaces", proxy.name)));
        }
        validate_targets(&proxy.name, proxy.targets.len())?;
        for group in proxy.sni_routes.iter().map(|r| r.targets.len()) {
            validate_targets(&proxy.name, group)?;
        }
        for route in &proxy.source_routes {
            validate_targets(&proxy.name, route.targets.len())?;
            route.cidr.parse::<ipnet::Ipv4Net>().map_err(|e| {
                Error::Config(format!("proxy {}: bad cidr {}: {e}", proxy.name, route.cidr))
            })?;
        }
        if proxy.targets.iter().all(|t| t.weight == 0) {
            return Err(Error::Config(format!("proxy {}: all target weights are zero", proxy.name)));
        }
        for iface in &proxy.interfaces {
            if !listens.insert((iface.clone(), proxy.port)) {
                return Err(Error::Config(format!(
                    "duplicate listen {iface}:{} (proxy {})",
                    proxy.port, proxy.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_targets(proxy: &str, count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::Config(format!("proxy {proxy}: empty target group")));
    }
    if count > skarv_ebpf_common::MAX_TARGETS {
        return Err(Error::Config(format!(
            "proxy {proxy}: {count} targets, kernel route holds at most {}",
            skarv_ebpf_common::MAX_TARGETS
        )));
    }
    Ok(())
}
