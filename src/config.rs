use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::info;

use crate::comm::limiter::RateLimit;


/// All tunables of a node. Constructed with defaults, then adjusted either
///  directly or through `apply_option` with the textual `key=value` form the
///  node binary accepts.
#[derive(Debug)]
pub struct MeshConfig {
    /// bound of the duplicate-broadcast ID cache
    pub packet_id_cache_size: usize,
    /// scatter unicasts over several comparable paths
    pub multipath: bool,
    /// band-width factor for scattering, never below 2
    pub multipath_ratio: u32,
    /// ping changes below this many microseconds are not reported to peers
    pub report_ping_changes_above: u32,
    /// advertisements beyond this hop count are ignored
    pub route_max_dist: u32,
    /// initial TTL stamped on originated broadcasts
    pub route_broadcast_ttl: u16,
    /// percent of ping added per hop when comparing candidate routes
    pub route_hop_penalization: u32,
    /// route all broadcasts through one random upstream peer
    pub shared_uplink: bool,

    pub mtu: usize,
    pub max_waiting_data_size: usize,
    pub max_waiting_proto_size: usize,
    /// per-peer cap on advertised routes; exceeding it resets the connection
    pub max_remote_routes: usize,
    pub red_enabled: bool,
    /// data queue depth in bytes above which random early drop kicks in
    pub red_threshold: usize,
    pub keepalive: Duration,
    pub timeout: Duration,
    pub retry: Duration,
    pub upload_limit: RateLimit,
    pub download_limit: RateLimit,

    pub tick_interval: Duration,
    pub stats_interval: Duration,
    /// shared secret for the AES-GCM record layer; `None` runs plain TCP
    pub shared_secret: Option<Vec<u8>>,
}

impl MeshConfig {
    pub fn new() -> MeshConfig {
        MeshConfig {
            packet_id_cache_size: 1024,
            multipath: false,
            multipath_ratio: 2,
            report_ping_changes_above: 5000,
            route_max_dist: 64,
            route_broadcast_ttl: 128,
            route_hop_penalization: 0,
            shared_uplink: false,
            mtu: 8192,
            max_waiting_data_size: 512 * 1024,
            max_waiting_proto_size: 256 * 1024,
            max_remote_routes: 16 * 1024,
            red_enabled: false,
            red_threshold: 256 * 1024,
            keepalive: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            retry: Duration::from_secs(10),
            upload_limit: RateLimit::disabled(),
            download_limit: RateLimit::disabled(),
            tick_interval: Duration::from_millis(10),
            stats_interval: Duration::from_secs(1),
            shared_secret: None,
        }
    }

    /// Applies one `key=value` style option by name.
    pub fn apply_option(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "packet_id_cache_size" => self.packet_id_cache_size = parse_int::<usize>(key, value)?.max(1),
            "multipath" => self.multipath = parse_bool(key, value)?,
            "multipath_ratio" => self.multipath_ratio = parse_int::<u32>(key, value)?.max(2),
            "report_ping_changes_above" => self.report_ping_changes_above = parse_int(key, value)?,
            "route_max_dist" => self.route_max_dist = parse_int(key, value)?,
            "route_broadcast_ttl" => self.route_broadcast_ttl = parse_int(key, value)?,
            "route_hop_penalization" => self.route_hop_penalization = parse_int(key, value)?,
            "shared_uplink" => self.shared_uplink = parse_bool(key, value)?,
            "mtu" => self.mtu = parse_int(key, value)?,
            "max_waiting_data_size" => self.max_waiting_data_size = parse_int(key, value)?,
            "max_waiting_proto_size" => self.max_waiting_proto_size = parse_int(key, value)?,
            "max_remote_routes" => self.max_remote_routes = parse_int(key, value)?,
            "red_enabled" => self.red_enabled = parse_bool(key, value)?,
            "red_threshold" => self.red_threshold = parse_int(key, value)?,
            "keepalive_msec" => self.keepalive = Duration::from_millis(parse_int(key, value)?),
            "timeout_msec" => self.timeout = Duration::from_millis(parse_int(key, value)?),
            "retry_msec" => self.retry = Duration::from_millis(parse_int(key, value)?),
            "upload_total" => set_limit(&mut self.upload_limit, value, key, |l, v| l.total = v)?,
            "upload_conn" => set_limit(&mut self.upload_limit, value, key, |l, v| l.per_conn = v)?,
            "upload_burst" => set_limit(&mut self.upload_limit, value, key, |l, v| l.burst = v)?,
            "download_total" => set_limit(&mut self.download_limit, value, key, |l, v| l.total = v)?,
            "download_conn" => set_limit(&mut self.download_limit, value, key, |l, v| l.per_conn = v)?,
            "download_burst" => set_limit(&mut self.download_limit, value, key, |l, v| l.burst = v)?,
            _ => bail!("unknown option '{}'", key),
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        info!("broadcast ID cache size is {}", self.packet_id_cache_size);
        if self.multipath {
            info!("multipath scattering enabled, ratio {}", self.multipath_ratio);
        }
        info!("only ping changes above {}msec are reported to peers", self.report_ping_changes_above / 1000);
        info!("maximal advertised distance is {}", self.route_max_dist);
        info!("initial broadcast TTL is {}", self.route_broadcast_ttl);
        info!("hop penalization is {}%", self.route_hop_penalization);
        if self.shared_uplink {
            info!("sharing uplink for broadcasts");
        }
        if self.red_enabled {
            info!("random early drop above {} queued bytes", self.red_threshold);
        }
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value.parse()
        .map_err(|_| anyhow!("option '{}': '{}' is not a valid number", key, value))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => bail!("option '{}': '{}' is not a valid boolean", key, value),
    }
}

fn set_limit(limit: &mut RateLimit, value: &str, key: &str, set: impl FnOnce(&mut RateLimit, u32)) -> anyhow::Result<()> {
    set(limit, parse_int(key, value)?);
    limit.enabled = true;
    Ok(())
}
