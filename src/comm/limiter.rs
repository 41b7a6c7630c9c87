/// One direction's rate cap: `total` is the per-tick budget shared by all
///  active connections, `per_conn` the per-connection per-tick refill,
///  `burst` the balance cap.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub enabled: bool,
    pub total: u32,
    pub per_conn: u32,
    pub burst: u32,
}

impl RateLimit {
    pub fn disabled() -> RateLimit {
        RateLimit {
            enabled: false,
            total: 0,
            per_conn: 0,
            burst: 0,
        }
    }

    /// What one connection may claim per tick: its own refill, or its fair
    ///  share of the fleet budget, whichever is smaller.
    fn tick_allowance(&self, active_count: usize) -> u32 {
        if active_count == 0 {
            return self.per_conn;
        }
        self.per_conn.min(self.total / active_count as u32)
    }
}


/// Upload side: a balance that refills each tick and is consumed by writes.
///  An exhausted balance makes the write pump yield until the next tick.
#[derive(Debug, Default)]
pub struct UploadBucket {
    available: u32,
}

impl UploadBucket {
    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn refill(&mut self, limit: &RateLimit, active_count: usize) {
        if !limit.enabled {
            return;
        }
        self.available = (self.available + limit.tick_allowance(active_count)).min(limit.burst);
    }

    /// How many of `wanted` bytes may go out now.
    pub fn writable(&self, limit: &RateLimit, wanted: usize) -> usize {
        if !limit.enabled {
            return wanted;
        }
        wanted.min(self.available as usize)
    }

    pub fn consume(&mut self, limit: &RateLimit, n: usize) {
        if !limit.enabled {
            return;
        }
        self.available = self.available.saturating_sub(n as u32);
    }
}


/// Download side: bytes received above the per-tick allowance accumulate in
///  `over`; past `burst` the connection pauses reads, resuming only once the
///  counter has drained back to zero.
#[derive(Debug, Default)]
pub struct DownloadBucket {
    over: u64,
    paused: bool,
}

impl DownloadBucket {
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn on_received(&mut self, limit: &RateLimit, n: usize) {
        if !limit.enabled {
            return;
        }
        self.over += n as u64;
        if self.over > limit.burst as u64 {
            self.paused = true;
        }
    }

    pub fn drain(&mut self, limit: &RateLimit, active_count: usize) {
        if !limit.enabled {
            self.over = 0;
            self.paused = false;
            return;
        }
        self.over = self.over.saturating_sub(limit.tick_allowance(active_count) as u64);
        if self.over == 0 {
            self.paused = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limit(total: u32, per_conn: u32, burst: u32) -> RateLimit {
        RateLimit { enabled: true, total, per_conn, burst }
    }

    #[test]
    fn test_upload_refill_fair_share_and_burst() {
        let limit = limit(1000, 400, 1000);
        let mut bucket = UploadBucket::default();

        // 4 active connections: fair share 250 beats per_conn 400
        bucket.refill(&limit, 4);
        assert_eq!(bucket.available(), 250);

        // 2 active connections: per_conn 400 is the cap
        bucket.refill(&limit, 2);
        assert_eq!(bucket.available(), 650);

        // balance never exceeds burst
        bucket.refill(&limit, 2);
        assert_eq!(bucket.available(), 1000);
        bucket.refill(&limit, 2);
        assert_eq!(bucket.available(), 1000);
    }

    #[test]
    fn test_upload_consume_and_yield() {
        let limit = limit(1000, 100, 200);
        let mut bucket = UploadBucket::default();
        bucket.refill(&limit, 1);
        assert_eq!(bucket.available(), 100);

        assert_eq!(bucket.writable(&limit, 80), 80);
        bucket.consume(&limit, 80);
        assert_eq!(bucket.writable(&limit, 80), 20);
        bucket.consume(&limit, 20);
        assert_eq!(bucket.writable(&limit, 1), 0);
    }

    #[test]
    fn test_upload_disabled_is_unlimited() {
        let limit = RateLimit::disabled();
        let mut bucket = UploadBucket::default();
        assert_eq!(bucket.writable(&limit, 1 << 30), 1 << 30);
        bucket.consume(&limit, 1 << 30);
        assert_eq!(bucket.writable(&limit, 1 << 30), 1 << 30);
    }

    #[test]
    fn test_download_pause_hysteresis() {
        let limit = limit(1000, 100, 300);
        let mut bucket = DownloadBucket::default();

        bucket.on_received(&limit, 250);
        assert!(!bucket.is_paused());
        bucket.on_received(&limit, 100);
        assert!(bucket.is_paused());

        // draining below burst is not enough - reads resume only at zero
        bucket.drain(&limit, 1);
        assert!(bucket.is_paused());
        bucket.drain(&limit, 1);
        bucket.drain(&limit, 1);
        assert!(bucket.is_paused());
        bucket.drain(&limit, 1);
        assert!(!bucket.is_paused());
    }
}
