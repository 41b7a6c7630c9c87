use std::time::Duration;


/// Per-connection traffic counters: running totals plus a current window that
///  a periodic roll turns into packets/bytes-per-second figures.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub in_packets_total: u64,
    pub in_bytes_total: u64,
    pub out_packets_total: u64,
    pub out_bytes_total: u64,
    pub dropped_frames: u64,

    in_packets_window: u64,
    in_bytes_window: u64,
    out_packets_window: u64,
    out_bytes_window: u64,

    pub in_packets_per_sec: u64,
    pub in_bytes_per_sec: u64,
    pub out_packets_per_sec: u64,
    pub out_bytes_per_sec: u64,
}

impl TrafficStats {
    pub fn record_in(&mut self, size: usize) {
        self.in_packets_total += 1;
        self.in_bytes_total += size as u64;
        self.in_packets_window += 1;
        self.in_bytes_window += size as u64;
    }

    pub fn record_out(&mut self, size: usize) {
        self.out_packets_total += 1;
        self.out_bytes_total += size as u64;
        self.out_packets_window += 1;
        self.out_bytes_window += size as u64;
    }

    pub fn record_drop(&mut self) {
        self.dropped_frames += 1;
    }

    /// Converts the current window into per-second speeds and starts a new
    ///  window. `elapsed` is the actual wall time since the previous roll.
    pub fn roll(&mut self, elapsed: Duration) {
        let millis = elapsed.as_millis().max(1) as u64;
        self.in_packets_per_sec = self.in_packets_window * 1000 / millis;
        self.in_bytes_per_sec = self.in_bytes_window * 1000 / millis;
        self.out_packets_per_sec = self.out_packets_window * 1000 / millis;
        self.out_bytes_per_sec = self.out_bytes_window * 1000 / millis;

        self.in_packets_window = 0;
        self.in_bytes_window = 0;
        self.out_packets_window = 0;
        self.out_bytes_window = 0;
    }
}
