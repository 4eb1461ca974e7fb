//! Kernel data-plane assembly: create the maps, emit and load the
//! programs, attach them to the configured interfaces, and optionally pin
//! the maps for the runtime subcommands.

#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use skarv_ebpf::progs::{build_egress, build_ingress, EgressMaps, IngressMaps, IngressOptions};
use skarv_ebpf::sys::{remove_memlock_limit, BpfLink, Hook, KernelMap, KernelProg};
use skarv_ebpf::{
    BackendRateTable, ConntrackTable, ListenTable, MapKind, RateConfigTable, RawMap,
    SettingsTable, SniTable, SourceRouteTable,
};
use skarv_ebpf_common::layout::{
    CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, LISTEN_KEY_LEN, LPM_KEY_LEN, RATE_CONFIG_LEN,
    RATE_STATE_LEN, ROUTE_VALUE_LEN, SETTINGS_VALUE_LEN, SNI_KEY_LEN,
};
use skarv_lb_lib::config::Config;
use skarv_lb_lib::coordinator::{resolve_ifindex, DataPlane};
use skarv_lb_lib::error::{Error, Result};
use tracing::info;

/// Map names; used for kernel object names and pin paths.
const MAPS: &[(&str, MapKind, usize, usize, u32)] = &[
    ("listen", MapKind::Hash, LISTEN_KEY_LEN, ROUTE_VALUE_LEN, 1_024),
    ("source_routes", MapKind::LpmTrie, LPM_KEY_LEN, ROUTE_VALUE_LEN, 1_024),
    ("sni", MapKind::Hash, SNI_KEY_LEN, ROUTE_VALUE_LEN, 4_096),
    ("conntrack", MapKind::LruHash, CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, 262_144),
    ("settings", MapKind::Array, 4, SETTINGS_VALUE_LEN, 1),
    ("stats_events", MapKind::PerfEventArray, 4, 4, 128),
    ("src_rate_config", MapKind::Array, 4, RATE_CONFIG_LEN, 1),
    ("src_rate_state", MapKind::LruHash, 4, RATE_STATE_LEN, 65_536),
    ("backend_rate_config", MapKind::Hash, 8, RATE_CONFIG_LEN, 64),
    ("backend_rate_state", MapKind::Hash, 8, RATE_STATE_LEN, 64),
];

/// The loaded data plane. Dropping this detaches the programs (links close
/// before program fds) and releases the maps.
pub struct KernelPlane {
    pub plane: DataPlane,
    _links: Vec<BpfLink>,
    _ingress: KernelProg,
    _egress: KernelProg,
    _maps: Vec<Arc<KernelMap>>,
}

fn create_maps(pin_path: Option<&Path>) -> Result<Vec<Arc<KernelMap>>> {
    let mut out = Vec::with_capacity(MAPS.len());
    for &(name, kind, key_size, value_size, max_entries) in MAPS {
        let map = KernelMap::create(name, kind, key_size as u32, value_size as u32, max_entries)?;
        if let Some(dir) = pin_path {
            std::fs::create_dir_all(dir)?;
            map.pin(&dir.join(name))?;
        }
        out.push(Arc::new(map));
    }
    Ok(out)
}

fn plane_over(maps: &[Arc<KernelMap>]) -> DataPlane {
    let shared = |i: usize| -> Arc<dyn RawMap> { maps[i].clone() };
    DataPlane {
        listen: ListenTable::new(shared(0)),
        source_routes: SourceRouteTable::new(shared(1)),
        sni: SniTable::new(shared(2)),
        conntrack: ConntrackTable::new(shared(3)),
        settings: SettingsTable::new(shared(4)),
        src_rate_config: RateConfigTable::new(shared(6)),
        backend_rate_config: BackendRateTable::new(shared(8)),
    }
}

/// Build everything and attach to every interface the config names.
pub fn load(config: &Config, pin_path: Option<&Path>) -> Result<KernelPlane> {
    remove_memlock_limit();
    let maps = create_maps(pin_path)?;

    let opts = IngressOptions {
        source_rate_limit: config.proxies.iter().any(|p| p.rate_limit.is_some()),
        backend_rate_limit: config
            .proxies
            .iter()
            .any(|p| p.targets.iter().any(|t| t.rate_limit.is_some())),
    };
    let ingress_insns = build_ingress(
        &IngressMaps {
            listen: maps[0].fd(),
            source_routes: maps[1].fd(),
            sni: maps[2].fd(),
            conntrack: maps[3].fd(),
            stats_events: maps[5].fd(),
            src_rate_config: maps[6].fd(),
            src_rate_state: maps[7].fd(),
            backend_rate_config: maps[8].fd(),
            backend_rate_state: maps[9].fd(),
        },
        &opts,
    )?;
    let egress_insns = build_egress(&EgressMaps { conntrack: maps[3].fd() })?;

    let ingress = KernelProg::load("skarv_ingress", Hook::XdpIngress, &ingress_insns)?;
    let egress = KernelProg::load("skarv_egress", Hook::TcEgress, &egress_insns)?;

    let mut interfaces: Vec<String> =
        config.proxies.iter().flat_map(|p| p.interfaces.iter().cloned()).collect();
    interfaces.sort();
    interfaces.dedup();

    let mut links = Vec::new();
    for name in &interfaces {
        let ifindex = resolve_ifindex(name)?;
        let xdp = ingress.attach(Hook::XdpIngress, ifindex).map_err(|source| Error::Attach {
            interface: name.clone(),
            source,
        })?;
        let tc = egress.attach(Hook::TcEgress, ifindex).map_err(|source| Error::Attach {
            interface: name.clone(),
            source,
        })?;
        info!(interface = name, ifindex, "data plane attached");
        links.push(xdp);
        links.push(tc);
    }

    Ok(KernelPlane {
        plane: plane_over(&maps),
        _links: links,
        _ingress: ingress,
        _egress: egress,
        _maps: maps,
    })
}

/// Open the pinned maps for a runtime subcommand.
pub fn open_pinned(pin_path: &PathBuf) -> Result<DataPlane> {
    let mut maps = Vec::with_capacity(MAPS.len());
    for &(name, _, key_size, value_size, _) in MAPS {
        maps.push(Arc::new(KernelMap::open_pinned(&pin_path.join(name), key_size, value_size)?));
    }
    Ok(plane_over(&maps))
}
