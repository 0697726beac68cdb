use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// I/O statistics of a session or stream.
#[derive(Debug)]
pub struct Monitor {
    read: AtomicU64,
    written: AtomicU64,
    delay_nanos: AtomicU64,
    created: SystemTime,
    created_instant: Instant,
    dead: Mutex<Option<(SystemTime, Instant)>>,
    speed: Mutex<SpeedSample>,
}

#[derive(Debug)]
struct SpeedSample {
    at: Instant,
    read: u64,
    written: u64,
    read_per_sec: f64,
    written_per_sec: f64,
}

/// Snapshot of a [Monitor].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MonitorInfo {
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub read_speed: f64,
    pub write_speed: f64,
    pub delay: Duration,
    pub created: SystemTime,
    pub dead: Option<SystemTime>,
    pub lifetime: Duration,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            delay_nanos: AtomicU64::new(0),
            created: SystemTime::now(),
            created_instant: now,
            dead: Mutex::new(None),
            speed: Mutex::new(SpeedSample {
                at: now,
                read: 0,
                written: 0,
                read_per_sec: 0.0,
                written_per_sec: 0.0,
            }),
        }
    }

    pub fn add_read(&self, count: usize) {
        self.read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_written(&self, count: usize) {
        self.written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delay(&self, delay: Duration) {
        self.delay_nanos
            .store(delay.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn delay(&self) -> Duration {
        Duration::from_nanos(self.delay_nanos.load(Ordering::Relaxed))
    }

    /// Update the transfer speed from the byte counts since the previous sample.
    pub fn record_speed(&self) {
        let now = Instant::now();
        let read = self.read.load(Ordering::Relaxed);
        let written = self.written.load(Ordering::Relaxed);
        let mut sample = self.speed.lock();
        let elapsed = now.duration_since(sample.at).as_secs_f64();
        if elapsed > 0.0 {
            sample.read_per_sec = (read - sample.read) as f64 / elapsed;
            sample.written_per_sec = (written - sample.written) as f64 / elapsed;
        }
        sample.at = now;
        sample.read = read;
        sample.written = written;
    }

    /// Mark the monitored object as dead. Only the first call has an effect.
    pub fn dead(&self) {
        let mut dead = self.dead.lock();
        if dead.is_none() {
            *dead = Some((SystemTime::now(), Instant::now()));
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.lock().is_some()
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn info(&self) -> MonitorInfo {
        let dead = *self.dead.lock();
        let lifetime = match dead {
            Some((_, at)) => at.duration_since(self.created_instant),
            None => self.created_instant.elapsed(),
        };
        let speed = self.speed.lock();
        MonitorInfo {
            read_bytes: self.read.load(Ordering::Relaxed),
            written_bytes: self.written.load(Ordering::Relaxed),
            read_speed: speed.read_per_sec,
            write_speed: speed.written_per_sec,
            delay: self.delay(),
            created: self.created,
            dead: dead.map(|(time, _)| time),
            lifetime,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_and_dead_once() {
        let monitor = Monitor::new();
        monitor.add_read(10);
        monitor.add_written(3);
        monitor.add_read(5);
        monitor.record_delay(Duration::from_millis(7));
        monitor.dead();
        let first = monitor.info();
        std::thread::sleep(Duration::from_millis(5));
        monitor.dead();
        let second = monitor.info();
        assert_eq!(first.read_bytes, 15);
        assert_eq!(first.written_bytes, 3);
        assert_eq!(first.delay, Duration::from_millis(7));
        assert_eq!(first.dead, second.dead);
        assert_eq!(first.lifetime, second.lifetime);
    }

    #[test]
    fn speed() {
        let monitor = Monitor::new();
        std::thread::sleep(Duration::from_millis(20));
        monitor.add_read(1000);
        monitor.record_speed();
        let info = monitor.info();
        assert!(info.read_speed > 0.0);
        assert_eq!(info.write_speed, 0.0);
    }
}
