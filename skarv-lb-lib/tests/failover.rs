//! Control plane and data plane together: the coordinator installs routes
//! into shared maps, health events rewrite the weights, and the emitted
//! ingress program — run under the interpreter over those same maps —
//! steers packets accordingly.

use std::net::Ipv4Addr;
use std::sync::Arc;

use skarv_ebpf::interp::{Ctx, Interp};
use skarv_ebpf::progs::{build_ingress, IngressMaps, IngressOptions};
use skarv_ebpf::{
    BackendRateTable, ConntrackTable, ListenTable, MapKind, MemMap, RateConfigTable, RawMap,
    SettingsTable, SniTable, SourceRouteTable,
};
use skarv_ebpf_common::layout::{
    CONNTRACK_KEY_LEN, CONNTRACK_VALUE_LEN, LISTEN_KEY_LEN, LPM_KEY_LEN, RATE_CONFIG_LEN,
    RATE_STATE_LEN, ROUTE_VALUE_LEN, SETTINGS_VALUE_LEN, SNI_KEY_LEN,
};
use skarv_lb_lib::config::{
    Config, ConntrackConfig, HealthCheckSpec, ProxyConfig, TargetConfig, TelemetryConfig,
};
use skarv_lb_lib::health::CheckFailure;
use skarv_lb_lib::{Coordinator, DataPlane};

struct SharedMaps {
    listen: Arc<MemMap>,
    source_routes: Arc<MemMap>,
    sni: Arc<MemMap>,
    conntrack: Arc<MemMap>,
    settings: Arc<MemMap>,
    stats: Arc<MemMap>,
    src_rate_cfg: Arc<MemMap>,
    src_rate_state: Arc<MemMap>,
    be_rate_cfg: Arc<MemMap>,
    be_rate_state: Arc<MemMap>,
}

impl SharedMaps {
    fn new() -> Self {
        Self {
            listen: Arc::new(MemMap::new(MapKind::Hash, LISTEN_KEY_LEN, ROUTE_VALUE_LEN, 1024)),
            source_routes: Arc::new(MemMap::new(
                MapKind::LpmTrie,
                LPM_KEY_LEN,
                ROUTE_VALUE_LEN,
                1024,
            )),
            sni: Arc::new(MemMap::new(MapKind::Hash, SNI_KEY_LEN, ROUTE_VALUE_LEN, 1024)),
            conntrack: Arc::new(MemMap::new(
                MapKind::LruHash,
                CONNTRACK_KEY_LEN,
                CONNTRACK_VALUE_LEN,
                65536,
            )),
            settings: Arc::new(MemMap::new(MapKind::Array, 4, SETTINGS_VALUE_LEN, 1)),
            stats: Arc::new(MemMap::new(MapKind::PerfEventArray, 4, 4, 0)),
            src_rate_cfg: Arc::new(MemMap::new(MapKind::Array, 4, RATE_CONFIG_LEN, 1)),
            src_rate_state: Arc::new(MemMap::new(MapKind::LruHash, 4, RATE_STATE_LEN, 1024)),
            be_rate_cfg: Arc::new(MemMap::new(MapKind::Hash, 8, RATE_CONFIG_LEN, 64)),
            be_rate_state: Arc::new(MemMap::new(MapKind::Hash, 8, RATE_STATE_LEN, 64)),
        }
    }

    fn plane(&self) -> DataPlane {
        DataPlane {
            listen: ListenTable::new(self.listen.clone() as Arc<dyn RawMap>),
            source_routes: SourceRouteTable::new(self.source_routes.clone() as Arc<dyn RawMap>),
            sni: SniTable::new(self.sni.clone() as Arc<dyn RawMap>),
            conntrack: ConntrackTable::new(self.conntrack.clone() as Arc<dyn RawMap>),
            settings: SettingsTable::new(self.settings.clone() as Arc<dyn RawMap>),
            src_rate_config: RateConfigTable::new(self.src_rate_cfg.clone() as Arc<dyn RawMap>),
            backend_rate_config: BackendRateTable::new(self.be_rate_cfg.clone() as Arc<dyn RawMap>),
        }
    }

    fn interp(&self) -> Interp<'_> {
        let mut interp = Interp::new();
        interp.attach_map(1, &self.listen);
        interp.attach_map(2, &self.source_routes);
        interp.attach_map(3, &self.sni);
        interp.attach_map(4, &self.conntrack);
        interp.attach_map(5, &self.stats);
        interp.attach_map(6, &self.src_rate_cfg);
        interp.attach_map(7, &self.src_rate_state);
        interp.attach_map(8, &self.be_rate_cfg);
        interp.attach_map(9, &self.be_rate_state);
        interp
    }
}

fn ingress_maps() -> IngressMaps {
    IngressMaps {
        listen: 1,
        source_routes: 2,
        sni: 3,
        conntrack: 4,
        stats_events: 5,
        src_rate_config: 6,
        src_rate_state: 7,
        backend_rate_config: 8,
        backend_rate_state: 9,
    }
}

fn tcp_packet(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> Vec<u8> {
    use skarv_ebpf_common::csum::{ipv4_header_checksum, l4_checksum};

    let mut pkt = vec![0u8; 12];
    pkt.extend_from_slice(&[0x08, 0x00]);
    let mut ip = vec![0x45, 0x00, 0x00, 0x28, 0, 0, 0x40, 0x00, 64, 6, 0, 0];
    ip.extend_from_slice(&src.0.octets());
    ip.extend_from_slice(&dst.0.octets());
    let c = ipv4_header_checksum(&ip);
    ip[10] = c[0];
    ip[11] = c[1];
    pkt.extend_from_slice(&ip);
    let mut l4 = Vec::new();
    l4.extend_from_slice(&src.1.to_be_bytes());
    l4.extend_from_slice(&dst.1.to_be_bytes());
    l4.extend_from_slice(&[0; 8]);
    l4.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    let c = l4_checksum(u32::from(src.0), u32::from(dst.0), 6, &l4);
    l4[16] = c[0];
    l4[17] = c[1];
    pkt.extend_from_slice(&l4);
    pkt
}

fn target(address: &str, weight: u8) -> TargetConfig {
    TargetConfig {
        address: address.to_string(),
        weight,
        health_check: HealthCheckSpec::default(),
        rate_limit: None,
    }
}

fn config() -> Config {
    Config {
        proxies: vec![ProxyConfig {
            name: "web".into(),
            interfaces: vec!["2".into()],
            port: 80,
            targets: vec![target("10.0.0.1:8080", 50), target("10.0.0.2:8080", 50)],
            sni_routes: Vec::new(),
            source_routes: Vec::new(),
            rate_limit: None,
            circuit_breaker: None,
            stats: false,
        }],
        cluster: None,
        telemetry: TelemetryConfig::default(),
        conntrack: ConntrackConfig::default(),
    }
}

#[tokio::test]
async fn health_failover_redirects_the_packet_path() {
    let maps = SharedMaps::new();
    let coordinator = Coordinator::new(config(), maps.plane()).unwrap();
    coordinator.start().await.unwrap();

    let prog = build_ingress(&ingress_maps(), &IngressOptions::default()).unwrap();

    // With both targets healthy a draw of 99 selects the second slot.
    let mut pkt = tcp_packet((Ipv4Addr::new(1, 2, 3, 4), 55000), (Ipv4Addr::new(192, 0, 2, 10), 80));
    let mut interp = maps.interp();
    interp.random.push_back(99);
    interp.run(&prog, &Ctx::Xdp { ingress_ifindex: 2 }, &mut pkt).unwrap();
    assert_eq!(&pkt[30..34], &[10, 0, 0, 2]);

    // Target 2 fails its threshold; the listen row now excludes it.
    let health = coordinator.health();
    for _ in 0..3 {
        health.record_failure("web", "10.0.0.2:8080", 1, &CheckFailure::ConnectionRefused);
    }

    // The same high draw lands on the surviving target.
    let mut pkt = tcp_packet((Ipv4Addr::new(1, 2, 3, 4), 55001), (Ipv4Addr::new(192, 0, 2, 10), 80));
    let mut interp = maps.interp();
    interp.random.push_back(99);
    interp.run(&prog, &Ctx::Xdp { ingress_ifindex: 2 }, &mut pkt).unwrap();
    assert_eq!(&pkt[30..34], &[10, 0, 0, 1]);

    coordinator.stop().await.unwrap();
}
